//! 事件执行器契约与参考实现。
//!
//! # 契约声明
//! * **执行契约**：Pipeline 只依赖 [`EventExecutor`] 的三项能力：提交任务（`execute`）、
//!   判断当前是否已在该执行器上（`in_event_loop`）、延迟调度（`schedule`）。
//! * **顺序保证**：同一执行器上、同一来源提交的任务按提交顺序执行。
//! * **亲和性判定**：是否“已在正确执行器上”是执行器自身的能力查询，而非比较具体线程类型。
//!
//! ## 参考实现
//! * [`EmbeddedEventLoop`]：确定性的单线程替身，`in_event_loop` 恒为真，任务由测试显式驱动；
//! * [`SingleThreadEventLoop`]：专属线程 + `crossbeam_channel` 指令通道 + 线程本地定时堆；
//! * [`EventLoopGroup`]：按轮询分配事件循环。

mod embedded;
mod group;
mod scheduled;
mod single_thread;

pub use embedded::EmbeddedEventLoop;
pub use group::EventLoopGroup;
pub use single_thread::SingleThreadEventLoop;

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use crate::Result;

/// 提交到执行器的任务。
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// `EventExecutor` 定义 Pipeline 消费的执行契约。
///
/// # 契约说明（What）
/// - `execute`：入队任务；执行器关闭后返回 `executor.rejected`；
/// - `in_event_loop`：调用方是否正运行在该执行器上，用于决定内联执行还是投递；
/// - `schedule`：`delay` 后执行任务，返回可取消的 [`ScheduledHandle`]。
///
/// # 风险提示（Trade-offs）
/// - 在执行器自身线程上同步等待由该执行器完成的 Future 会死锁，调用方必须改用监听器。
pub trait EventExecutor: Send + Sync + 'static {
    /// 执行器名称，用于日志。
    fn name(&self) -> &str;

    /// 调用方是否正运行在该执行器上。
    fn in_event_loop(&self) -> bool;

    /// 提交任务。
    fn execute(&self, task: Task) -> Result<()>;

    /// 延迟调度任务。
    fn schedule(&self, delay: Duration, task: Task) -> Result<ScheduledHandle>;

    /// 执行器是否已开始关闭。
    fn is_shutdown(&self) -> bool;
}

impl fmt::Debug for dyn EventExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventExecutor")
            .field("name", &self.name())
            .finish()
    }
}

/// 判断两个执行器句柄是否指向同一个实例。
pub fn same_executor(left: &Arc<dyn EventExecutor>, right: &Arc<dyn EventExecutor>) -> bool {
    Arc::ptr_eq(left, right)
}

/// 定时任务的取消句柄。
///
/// # 逻辑（How）
/// - 与执行器共享一个 `AtomicBool`；执行器在到期时检查标记，已取消则丢弃任务；
/// - `cancel` 通过 `compare_exchange` 保证只有首个调用者观察到状态翻转。
#[derive(Clone, Debug, Default)]
pub struct ScheduledHandle {
    cancelled: Arc<AtomicBool>,
}

impl ScheduledHandle {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 取消任务；返回 `true` 表示本次调用完成了取消。
    pub fn cancel(&self) -> bool {
        self.cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 任务是否已被取消。
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

pub(crate) fn rejected(executor: &str) -> crate::CoreError {
    crate::CoreError::new(
        crate::error::codes::EXECUTOR_REJECTED,
        format!("event executor `{executor}` is shut down"),
    )
}
