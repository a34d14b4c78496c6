use std::{
    fmt, mem,
    panic::{AssertUnwindSafe, catch_unwind},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

use crate::{CoreError, Result, error::codes};

type Listener = Box<dyn FnOnce(&ChannelFuture) + Send + 'static>;

#[derive(Clone)]
enum Outcome {
    Success,
    Failure(CoreError),
    Cancelled,
}

#[derive(Default)]
struct State {
    outcome: Option<Outcome>,
    uncancellable: bool,
    listeners: Vec<Listener>,
    wakers: Vec<Waker>,
}

struct PromiseCore {
    state: Mutex<State>,
    done: Condvar,
    void: bool,
}

impl PromiseCore {
    fn new(void: bool) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
            done: Condvar::new(),
            void,
        })
    }
}

/// Promise 的写端。
///
/// # 教案式说明
/// - **意图（Why）**：出站缓冲、Pipeline 与 ChannelGroup 都需要一个“只能完成一次”的结果槽，
///   并允许任意线程竞争完成，由第一个到达者胜出。
/// - **逻辑（How）**：状态保存在 `parking_lot::Mutex` 中；完成时在锁内写入结果并取走监听器与
///   waker，锁外依次唤醒与回调，因此监听器可以安全地再次访问同一个 Promise 或向队列追加工作。
/// - **契约（What）**：
///   - `try_*` 返回 `true` 表示本次调用完成了 Promise；
///   - 监听器在完成线程上内联执行；完成后追加的监听器立即在追加线程上执行；
///   - 监听器 panic 被隔离并记录日志，不影响其余监听器；
///   - void Promise 忽略所有完成请求与监听器，用于调用方不关心结果的写入。
/// - **风险与权衡（Trade-offs）**：在执行器自身线程上调用 [`ChannelFuture::wait`] 等待由该执行器完成
///   的 Promise 会死锁，调用方应改用监听器或 `.await`。
#[derive(Clone)]
pub struct ChannelPromise {
    core: Arc<PromiseCore>,
}

impl ChannelPromise {
    /// 新建未完成的 Promise。
    pub fn new() -> Self {
        Self {
            core: PromiseCore::new(false),
        }
    }

    /// 新建 void Promise。
    pub fn void() -> Self {
        Self {
            core: PromiseCore::new(true),
        }
    }

    /// 对应的读端。
    pub fn future(&self) -> ChannelFuture {
        ChannelFuture {
            core: Arc::clone(&self.core),
        }
    }

    /// 以成功完成。
    pub fn try_success(&self) -> bool {
        self.complete(Outcome::Success)
    }

    /// 以失败完成。
    pub fn try_failure(&self, cause: CoreError) -> bool {
        self.complete(Outcome::Failure(cause))
    }

    /// 尽力取消；已完成或已标记不可取消时返回 `false`。
    pub fn cancel(&self) -> bool {
        self.complete(Outcome::Cancelled)
    }

    /// 标记为不可取消；若已被取消返回 `false`。
    pub fn set_uncancellable(&self) -> bool {
        if self.core.void {
            return true;
        }
        let mut state = self.core.state.lock();
        if matches!(state.outcome, Some(Outcome::Cancelled)) {
            return false;
        }
        state.uncancellable = true;
        true
    }

    /// 是否为 void Promise。
    pub fn is_void(&self) -> bool {
        self.core.void
    }

    /// 是否已完成。
    pub fn is_done(&self) -> bool {
        self.future().is_done()
    }

    /// 是否已成功完成。
    pub fn is_success(&self) -> bool {
        self.future().is_success()
    }

    /// 是否已被取消。
    pub fn is_cancelled(&self) -> bool {
        self.future().is_cancelled()
    }

    /// 本 Promise 完成后，以相同结果完成 `target`。
    pub fn cascade_to(&self, target: ChannelPromise) {
        self.future().add_listener(move |future| {
            match future.outcome() {
                Some(Outcome::Success) => target.try_success(),
                Some(Outcome::Failure(cause)) => target.try_failure(cause),
                Some(Outcome::Cancelled) => target.cancel(),
                None => false,
            };
        });
    }

    /// 两个句柄是否指向同一个 Promise。
    pub fn ptr_eq(&self, other: &ChannelPromise) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    fn complete(&self, outcome: Outcome) -> bool {
        if self.core.void {
            return false;
        }
        let (listeners, wakers) = {
            let mut state = self.core.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            if matches!(outcome, Outcome::Cancelled) && state.uncancellable {
                return false;
            }
            state.outcome = Some(outcome);
            (
                mem::take(&mut state.listeners),
                mem::take(&mut state.wakers),
            )
        };
        self.core.done.notify_all();
        for waker in wakers {
            waker.wake();
        }
        let future = self.future();
        for listener in listeners {
            future.notify(listener);
        }
        true
    }
}

impl Default for ChannelPromise {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChannelPromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.future(), f)
    }
}

/// Promise 的读端。
#[derive(Clone)]
pub struct ChannelFuture {
    core: Arc<PromiseCore>,
}

impl ChannelFuture {
    /// 已成功完成的 Future。
    pub fn succeeded() -> Self {
        let promise = ChannelPromise::new();
        promise.try_success();
        promise.future()
    }

    /// 已失败的 Future。
    pub fn failed(cause: CoreError) -> Self {
        let promise = ChannelPromise::new();
        promise.try_failure(cause);
        promise.future()
    }

    /// 是否已完成（成功、失败或取消）。void Future 永远不会完成。
    pub fn is_done(&self) -> bool {
        self.core.state.lock().outcome.is_some()
    }

    /// 是否成功完成。
    pub fn is_success(&self) -> bool {
        matches!(self.core.state.lock().outcome, Some(Outcome::Success))
    }

    /// 是否被取消。
    pub fn is_cancelled(&self) -> bool {
        matches!(self.core.state.lock().outcome, Some(Outcome::Cancelled))
    }

    /// 是否为 void Future。
    pub fn is_void(&self) -> bool {
        self.core.void
    }

    /// 失败原因；取消视为 `future.cancelled` 失败，未完成或成功时为 `None`。
    pub fn cause(&self) -> Option<CoreError> {
        match self.outcome()? {
            Outcome::Success => None,
            Outcome::Failure(cause) => Some(cause),
            Outcome::Cancelled => Some(CoreError::cancelled()),
        }
    }

    /// 已完成时的结果。
    pub fn result(&self) -> Option<Result<()>> {
        self.outcome().map(into_result)
    }

    /// 追加完成监听器。
    ///
    /// 已完成时立即在当前线程执行；void Future 丢弃监听器。
    pub fn add_listener(&self, listener: impl FnOnce(&ChannelFuture) + Send + 'static) {
        if self.core.void {
            tracing::debug!("void future 忽略监听器");
            return;
        }
        let listener: Listener = Box::new(listener);
        {
            let mut state = self.core.state.lock();
            if state.outcome.is_none() {
                state.listeners.push(listener);
                return;
            }
        }
        self.notify(listener);
    }

    /// 阻塞等待完成并返回结果。
    pub fn wait(&self) -> Result<()> {
        self.ensure_not_void()?;
        let mut state = self.core.state.lock();
        loop {
            if let Some(outcome) = state.outcome.clone() {
                return into_result(outcome);
            }
            self.core.done.wait(&mut state);
        }
    }

    /// 最多等待 `timeout`；返回是否已完成。
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.core.void {
            return false;
        }
        let mut state = self.core.state.lock();
        if state.outcome.is_some() {
            return true;
        }
        let _ = self
            .core
            .done
            .wait_while_for(&mut state, |state| state.outcome.is_none(), timeout);
        state.outcome.is_some()
    }

    /// 两个句柄是否指向同一个 Promise。
    pub fn ptr_eq(&self, other: &ChannelFuture) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    fn outcome(&self) -> Option<Outcome> {
        self.core.state.lock().outcome.clone()
    }

    fn ensure_not_void(&self) -> Result<()> {
        if self.core.void {
            return Err(CoreError::new(
                codes::FUTURE_VOID,
                "void future never completes",
            ));
        }
        Ok(())
    }

    fn notify(&self, listener: Listener) {
        if catch_unwind(AssertUnwindSafe(|| listener(self))).is_err() {
            tracing::warn!("future 监听器发生 panic，已隔离");
        }
    }
}

fn into_result(outcome: Outcome) -> Result<()> {
    match outcome {
        Outcome::Success => Ok(()),
        Outcome::Failure(cause) => Err(cause),
        Outcome::Cancelled => Err(CoreError::cancelled()),
    }
}

impl std::future::Future for ChannelFuture {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Err(err) = self.ensure_not_void() {
            return Poll::Ready(Err(err));
        }
        let mut state = self.core.state.lock();
        if let Some(outcome) = state.outcome.clone() {
            return Poll::Ready(into_result(outcome));
        }
        if !state.wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl fmt::Debug for ChannelFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.core.void {
            "void"
        } else {
            match self.outcome() {
                None => "pending",
                Some(Outcome::Success) => "success",
                Some(Outcome::Failure(_)) => "failure",
                Some(Outcome::Cancelled) => "cancelled",
            }
        };
        f.debug_struct("ChannelFuture").field("status", &status).finish()
    }
}
