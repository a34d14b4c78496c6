use std::sync::Arc;

use parking_lot::Mutex;

use super::{ChannelFuture, ChannelPromise};
use crate::CoreError;

struct Tally {
    remaining: usize,
    first_failure: Option<CoreError>,
}

/// 聚合一组 Future：全部完成后完成；任一失败或取消时以最先观察到的原因失败。
///
/// - 空集合立即成功；
/// - 聚合结果只在最后一个成员完成时落定，不会因首个失败而提前完成；
/// - void 成员永不完成，因此调用方不应把 void Future 放入集合。
pub fn combine(futures: Vec<ChannelFuture>) -> ChannelFuture {
    if futures.is_empty() {
        return ChannelFuture::succeeded();
    }
    let aggregate = ChannelPromise::new();
    let tally = Arc::new(Mutex::new(Tally {
        remaining: futures.len(),
        first_failure: None,
    }));
    for future in futures {
        let tally = Arc::clone(&tally);
        let aggregate = aggregate.clone();
        future.add_listener(move |done| {
            let finished = {
                let mut tally = tally.lock();
                if let Some(cause) = done.cause() {
                    tally.first_failure.get_or_insert(cause);
                }
                tally.remaining -= 1;
                if tally.remaining == 0 {
                    Some(tally.first_failure.take())
                } else {
                    None
                }
            };
            match finished {
                Some(None) => {
                    aggregate.try_success();
                }
                Some(Some(cause)) => {
                    aggregate.try_failure(cause);
                }
                None => {}
            }
        });
    }
    aggregate.future()
}
