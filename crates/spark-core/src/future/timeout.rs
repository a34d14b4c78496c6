//! 以定时任务表达的超时。
//!
//! 超时不在出站缓冲或 Pipeline 内部强制执行，而是调用方按需叠加：在执行器上调度一个
//! “若尚未完成则失败”的任务，Promise 的单次赋值保证完成与超时只有一方生效。

use std::{sync::Arc, time::Duration};

use super::ChannelPromise;
use crate::{
    CoreError, Result,
    error::codes,
    runtime::{EventExecutor, ScheduledHandle},
};

/// `delay` 之后若 `promise` 仍未完成，则以 `future.timeout` 失败。
///
/// Promise 先完成时会取消定时任务。返回的句柄可用于提前撤销超时。
pub fn fail_after(
    promise: &ChannelPromise,
    executor: &Arc<dyn EventExecutor>,
    delay: Duration,
) -> Result<ScheduledHandle> {
    let target = promise.clone();
    let handle = executor.schedule(
        delay,
        Box::new(move || {
            let cause = CoreError::new(
                codes::FUTURE_TIMEOUT,
                format!("operation did not complete within {delay:?}"),
            );
            if target.try_failure(cause) {
                tracing::debug!(?delay, "promise 超时");
            }
        }),
    )?;
    let cancel = handle.clone();
    promise.future().add_listener(move |_| {
        cancel.cancel();
    });
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::EmbeddedEventLoop;

    #[test]
    fn timeout_fails_pending_promise() {
        let event_loop = Arc::new(EmbeddedEventLoop::new());
        let executor: Arc<dyn EventExecutor> = event_loop.clone();
        let promise = ChannelPromise::new();
        fail_after(&promise, &executor, Duration::from_millis(50)).unwrap();
        event_loop.advance_time_by(Duration::from_millis(50));
        assert_eq!(
            promise.future().cause().map(|c| c.code()),
            Some(codes::FUTURE_TIMEOUT)
        );
    }

    #[test]
    fn completion_before_deadline_cancels_timer() {
        let event_loop = Arc::new(EmbeddedEventLoop::new());
        let executor: Arc<dyn EventExecutor> = event_loop.clone();
        let promise = ChannelPromise::new();
        let handle = fail_after(&promise, &executor, Duration::from_millis(50)).unwrap();
        assert!(promise.try_success());
        assert!(handle.is_cancelled());
        event_loop.advance_time_by(Duration::from_secs(1));
        assert!(promise.is_success());
    }
}
