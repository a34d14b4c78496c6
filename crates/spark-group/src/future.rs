use std::{
    collections::BTreeMap,
    fmt,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use parking_lot::Mutex;
use spark_core::{ChannelFuture, ChannelPromise, CoreError, Result};
use spark_pipeline::ChannelId;

use crate::ChannelGroupError;

#[derive(Default)]
struct Tally {
    success: usize,
    failure: usize,
    failures: Vec<(ChannelId, CoreError)>,
}

struct Aggregation {
    group: Arc<str>,
    total: usize,
    tally: Mutex<Tally>,
    promise: ChannelPromise,
}

impl Aggregation {
    fn record(&self, id: ChannelId, done: &ChannelFuture) {
        let failures = {
            let mut tally = self.tally.lock();
            match done.cause() {
                None => tally.success += 1,
                Some(cause) => {
                    tally.failure += 1;
                    tally.failures.push((id, cause));
                }
            }
            if tally.success + tally.failure < self.total {
                return;
            }
            std::mem::take(&mut tally.failures)
        };
        if failures.is_empty() {
            self.promise.try_success();
        } else {
            tracing::debug!(
                group = %self.group,
                failed = failures.len(),
                total = self.total,
                "批量操作部分失败"
            );
            let err = ChannelGroupError::new(Arc::clone(&self.group), self.total, failures);
            self.promise.try_failure(err.into());
        }
    }
}

/// 一次批量操作的聚合完成句柄。
///
/// # 教案式说明
/// - **意图（Why）**：广播写入或批量关闭后，调用方既想等待“全部完成”，也想按 Channel 查看各自结果。
/// - **逻辑（How）**：构造时固定 `ChannelId -> ChannelFuture` 快照，为每个成员挂一个监听器；
///   监听器在同一把锁内累加成功与失败计数，最后一个成员完成时落定聚合结果。
/// - **契约（What）**：
///   - 全部成员成功时成功，否则以 `group.partial_failure` 失败，底层原因为列出全部失败项的
///     [`ChannelGroupError`]；被取消的成员按 `future.cancelled` 计入失败；
///   - 聚合结果只在所有成员完成后落定，与成员完成的先后顺序无关；
///   - 快照为空时立即成功。
/// - **风险与权衡（Trade-offs）**：void Future 永不完成，放入快照会使聚合永远挂起；
///   在成员的执行器线程上调用 [`wait`](Self::wait) 会死锁。
#[derive(Clone)]
pub struct ChannelGroupFuture {
    futures: Arc<BTreeMap<ChannelId, ChannelFuture>>,
    aggregation: Arc<Aggregation>,
    aggregate: ChannelFuture,
}

impl ChannelGroupFuture {
    /// 以成员快照构造；同一 `ChannelId` 出现多次时保留最后一个。
    pub fn new(
        group: impl Into<Arc<str>>,
        futures: impl IntoIterator<Item = (ChannelId, ChannelFuture)>,
    ) -> Self {
        let futures: BTreeMap<ChannelId, ChannelFuture> = futures.into_iter().collect();
        let promise = ChannelPromise::new();
        let aggregation = Arc::new(Aggregation {
            group: group.into(),
            total: futures.len(),
            tally: Mutex::new(Tally::default()),
            promise: promise.clone(),
        });
        if futures.is_empty() {
            promise.try_success();
        }
        for (id, future) in &futures {
            let aggregation = Arc::clone(&aggregation);
            let id = *id;
            future.add_listener(move |done| aggregation.record(id, done));
        }
        Self {
            futures: Arc::new(futures),
            aggregation,
            aggregate: promise.future(),
        }
    }

    /// 所属分组名称。
    pub fn group(&self) -> &str {
        &self.aggregation.group
    }

    /// 指定 Channel 的成员 Future。
    pub fn find(&self, id: ChannelId) -> Option<&ChannelFuture> {
        self.futures.get(&id)
    }

    /// 按 `ChannelId` 升序遍历成员。
    pub fn iter(&self) -> impl Iterator<Item = (ChannelId, &ChannelFuture)> + '_ {
        self.futures.iter().map(|(id, future)| (*id, future))
    }

    /// 成员数量。
    pub fn len(&self) -> usize {
        self.futures.len()
    }

    /// 是否没有成员。
    pub fn is_empty(&self) -> bool {
        self.futures.is_empty()
    }

    /// 聚合结果的 Future。
    pub fn future(&self) -> ChannelFuture {
        self.aggregate.clone()
    }

    /// 是否已落定。
    pub fn is_done(&self) -> bool {
        self.aggregate.is_done()
    }

    /// 是否全部成功。
    pub fn is_success(&self) -> bool {
        self.aggregate.is_success()
    }

    /// 聚合失败原因。
    pub fn cause(&self) -> Option<CoreError> {
        self.aggregate.cause()
    }

    /// 聚合失败时的组合错误。
    pub fn error(&self) -> Option<ChannelGroupError> {
        let cause = self.cause()?;
        ChannelGroupError::from_core(&cause).cloned()
    }

    /// 已有成员成功，但并非全部成功。
    ///
    /// 按计数判定：`成功数 != 0 && 成功数 != 成员总数`，与聚合是否落定无关。
    pub fn is_partial_success(&self) -> bool {
        let tally = self.aggregation.tally.lock();
        tally.success != 0 && tally.success != self.aggregation.total
    }

    /// 已有成员失败，但并非全部失败。
    ///
    /// 按计数判定：`失败数 != 0 && 失败数 != 成员总数`。因此 3 个成员中 1 个失败后，
    /// 该值在其余成员成功、聚合落定之后仍为 `true`；只有全部失败时为 `false`。
    pub fn is_partial_failure(&self) -> bool {
        let tally = self.aggregation.tally.lock();
        tally.failure != 0 && tally.failure != self.aggregation.total
    }

    /// 聚合落定后回调；已落定时立即在当前线程执行。
    pub fn add_listener(&self, listener: impl FnOnce(&ChannelGroupFuture) + Send + 'static) {
        let this = self.clone();
        self.aggregate.add_listener(move |_| listener(&this));
    }

    /// 阻塞等待全部成员完成。
    pub fn wait(&self) -> Result<()> {
        self.aggregate.wait()
    }

    /// 最多等待 `timeout`；返回是否已落定。
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.aggregate.wait_timeout(timeout)
    }
}

impl<'a> IntoIterator for &'a ChannelGroupFuture {
    type Item = (&'a ChannelId, &'a ChannelFuture);
    type IntoIter = std::collections::btree_map::Iter<'a, ChannelId, ChannelFuture>;

    fn into_iter(self) -> Self::IntoIter {
        self.futures.iter()
    }
}

impl std::future::Future for ChannelGroupFuture {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        std::future::Future::poll(Pin::new(&mut self.get_mut().aggregate), cx)
    }
}

impl fmt::Debug for ChannelGroupFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelGroupFuture")
            .field("group", &self.group())
            .field("len", &self.len())
            .field("aggregate", &self.aggregate)
            .finish()
    }
}
