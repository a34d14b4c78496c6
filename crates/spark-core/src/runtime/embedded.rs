use std::{
    collections::VecDeque,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use parking_lot::Mutex;

use super::{EventExecutor, ScheduledHandle, Task, rejected, scheduled::ScheduledQueue};
use crate::Result;

#[derive(Default)]
struct EmbeddedState {
    tasks: VecDeque<Task>,
    scheduled: ScheduledQueue,
    now: Duration,
}

/// 确定性的嵌入式事件循环。
///
/// # 意图（Why）
/// - 单元测试需要在调用线程上完全控制任务的执行时机：何时运行队列、何时推进时钟。
///
/// # 逻辑（How）
/// - `in_event_loop` 恒为 `true`，因此 Pipeline 的分发全部内联执行；
/// - 显式 `execute` 的任务排入 FIFO 队列，由 [`run_pending_tasks`](Self::run_pending_tasks) 驱动；
/// - 定时任务挂在虚拟时钟上，[`advance_time_by`](Self::advance_time_by) 推进时钟后执行到期者。
///
/// # 契约（What）
/// - 任务执行期间不持有内部锁，任务可以继续提交新任务，新任务在同一轮中被执行。
pub struct EmbeddedEventLoop {
    name: String,
    state: Mutex<EmbeddedState>,
    shutdown: AtomicBool,
}

impl EmbeddedEventLoop {
    /// 创建嵌入式事件循环。
    pub fn new() -> Self {
        Self::with_name("embedded")
    }

    /// 创建带名称的嵌入式事件循环。
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(EmbeddedState::default()),
            shutdown: AtomicBool::new(false),
        }
    }

    /// 运行队列中的所有任务以及已到期的定时任务，返回执行的任务数。
    pub fn run_pending_tasks(&self) -> usize {
        let mut executed = 0;
        loop {
            let next = {
                let mut state = self.state.lock();
                let now = state.now;
                match state.tasks.pop_front() {
                    Some(task) => Some(task),
                    None => state.scheduled.pop_due(now),
                }
            };
            match next {
                Some(task) => {
                    task();
                    executed += 1;
                }
                None => return executed,
            }
        }
    }

    /// 推进虚拟时钟并运行到期任务。
    pub fn advance_time_by(&self, delta: Duration) -> usize {
        self.state.lock().now += delta;
        self.run_pending_tasks()
    }

    /// 距最近一个定时任务到期的剩余时间。
    pub fn next_scheduled_delay(&self) -> Option<Duration> {
        let mut state = self.state.lock();
        let now = state.now;
        state
            .scheduled
            .next_deadline()
            .map(|deadline| deadline.saturating_sub(now))
    }

    /// 队列中尚未执行的任务数（不含定时任务）。
    pub fn pending_tasks(&self) -> usize {
        self.state.lock().tasks.len()
    }

    /// 标记关闭；此后提交的任务被拒绝，已排队任务仍可被运行。
    pub fn shutdown_gracefully(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.state.lock().scheduled.clear();
    }
}

impl Default for EmbeddedEventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventExecutor for EmbeddedEventLoop {
    fn name(&self) -> &str {
        &self.name
    }

    fn in_event_loop(&self) -> bool {
        true
    }

    fn execute(&self, task: Task) -> Result<()> {
        if self.is_shutdown() {
            return Err(rejected(&self.name));
        }
        self.state.lock().tasks.push_back(task);
        Ok(())
    }

    fn schedule(&self, delay: Duration, task: Task) -> Result<ScheduledHandle> {
        if self.is_shutdown() {
            return Err(rejected(&self.name));
        }
        let handle = ScheduledHandle::new();
        let mut state = self.state.lock();
        let deadline = state.now + delay;
        state.scheduled.push(deadline, handle.clone(), task);
        Ok(handle)
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    #[test]
    fn tasks_submitted_by_tasks_run_in_same_pass() {
        let event_loop = Arc::new(EmbeddedEventLoop::new());
        let log = Arc::new(StdMutex::new(Vec::new()));
        let inner_loop = Arc::clone(&event_loop);
        let inner_log = Arc::clone(&log);
        event_loop
            .execute(Box::new(move || {
                inner_log.lock().unwrap().push(1);
                let nested = Arc::clone(&inner_log);
                inner_loop
                    .execute(Box::new(move || nested.lock().unwrap().push(2)))
                    .unwrap();
            }))
            .unwrap();
        assert_eq!(event_loop.run_pending_tasks(), 2);
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn scheduled_tasks_follow_virtual_clock() {
        let event_loop = EmbeddedEventLoop::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        event_loop
            .schedule(
                Duration::from_millis(10),
                Box::new(move || flag.store(true, Ordering::SeqCst)),
            )
            .unwrap();
        let cancelled = event_loop
            .schedule(Duration::from_millis(5), Box::new(|| panic!("已取消的任务不应执行")))
            .unwrap();
        assert!(cancelled.cancel());
        assert_eq!(event_loop.advance_time_by(Duration::from_millis(9)), 0);
        assert_eq!(
            event_loop.next_scheduled_delay(),
            Some(Duration::from_millis(1))
        );
        assert_eq!(event_loop.advance_time_by(Duration::from_millis(1)), 1);
        assert!(fired.load(Ordering::SeqCst));
    }
}
