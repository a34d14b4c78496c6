use std::{
    cell::Cell,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};

use super::{EventExecutor, ScheduledHandle, Task, rejected, scheduled::ScheduledQueue};
use crate::{CoreError, Result, error::codes};

static NEXT_LOOP_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    // 当前线程所属事件循环的标识，0 表示不在任何事件循环上。
    static CURRENT_LOOP: Cell<usize> = const { Cell::new(0) };
}

/// 投递给循环线程的指令；定时任务也经同一通道送达，由循环线程挂入本地定时堆。
enum Command {
    Run(Task),
    Schedule {
        deadline: Duration,
        handle: ScheduledHandle,
        task: Task,
    },
}

struct LoopShared {
    id: usize,
    name: String,
    started_at: Instant,
    // `None` 表示已关闭：发送端被释放后，通道在排空剩余指令后断开，循环线程随之退出。
    sender: RwLock<Option<Sender<Command>>>,
    receiver: Receiver<Command>,
}

impl LoopShared {
    fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn submit(&self, command: Command) -> Result<()> {
        let sender = self.sender.read();
        let Some(sender) = sender.as_ref() else {
            tracing::warn!(executor = %self.name, "事件循环已关闭，拒绝任务");
            return Err(rejected(&self.name));
        };
        sender.send(command).map_err(|_| rejected(&self.name))
    }

    fn run_task(&self, task: Task) {
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            tracing::warn!(executor = %self.name, "事件循环任务发生 panic，已隔离");
        }
    }

    fn run(&self) {
        CURRENT_LOOP.with(|current| current.set(self.id));
        tracing::debug!(executor = %self.name, "事件循环启动");
        let mut scheduled = ScheduledQueue::default();
        loop {
            while let Some(task) = scheduled.pop_due(self.elapsed()) {
                self.run_task(task);
            }
            let received = match scheduled.next_deadline() {
                Some(deadline) => {
                    match self.receiver.recv_deadline(self.started_at + deadline) {
                        Ok(command) => Some(command),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match self.receiver.recv() {
                    Ok(command) => Some(command),
                    Err(_) => break,
                },
            };
            match received {
                Some(Command::Run(task)) => self.run_task(task),
                Some(Command::Schedule {
                    deadline,
                    handle,
                    task,
                }) => scheduled.push(deadline, handle, task),
                None => {}
            }
        }
        let dropped = scheduled.len();
        scheduled.clear();
        CURRENT_LOOP.with(|current| current.set(0));
        tracing::debug!(executor = %self.name, dropped_scheduled = dropped, "事件循环退出");
    }
}

/// 单线程事件循环：一个专属线程串行执行 FIFO 任务与定时任务。
///
/// # 教案式说明
/// - **意图（Why）**：为每个 Channel 提供“同一时刻只有一个线程触碰其状态”的串行化保证，
///   Pipeline 借此免去事件分发路径上的锁。
/// - **逻辑（How）**：提交方经 `crossbeam_channel` 无界通道投递指令；循环线程独占定时堆，
///   以 `recv_deadline` 等待至下一个到期时间。线程局部变量记录当前线程所属循环，
///   `in_event_loop` 据此判定。
/// - **契约（What）**：同一提交者的任务按提交顺序执行；任务 panic 被隔离并记录日志，
///   不会终止循环；[`shutdown_gracefully`](Self::shutdown_gracefully) 之后拒绝新任务，
///   已排队任务仍会执行完毕，未到期的定时任务被丢弃。
/// - **风险与权衡（Trade-offs）**：`Drop` 时会等待线程退出；若最后一个句柄在循环线程内部被释放，
///   只发出关闭信号而不等待，避免自我 join。
pub struct SingleThreadEventLoop {
    shared: Arc<LoopShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SingleThreadEventLoop {
    /// 启动一个新的事件循环线程。
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let shared = Arc::new(LoopShared {
            id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            started_at: Instant::now(),
            sender: RwLock::new(Some(sender)),
            receiver,
        });
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(shared.name.clone())
            .spawn(move || worker.run())
            .map_err(|err| {
                CoreError::new(codes::EXECUTOR_REJECTED, "failed to spawn event loop thread")
                    .with_cause(err)
            })?;
        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// 发出关闭信号：拒绝新任务，排队任务执行完毕后线程退出。
    pub fn shutdown_gracefully(&self) {
        self.shared.sender.write().take();
    }

    /// 等待循环线程退出；在循环线程内部调用时立即返回 `false`。
    pub fn await_termination(&self) -> bool {
        if self.in_event_loop() {
            return false;
        }
        let handle = self.thread.lock().take();
        match handle {
            Some(handle) => handle.join().is_ok(),
            None => true,
        }
    }

    /// 通道中尚未被循环线程取走的指令数。
    pub fn pending_tasks(&self) -> usize {
        self.shared.receiver.len()
    }
}

impl EventExecutor for SingleThreadEventLoop {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn in_event_loop(&self) -> bool {
        CURRENT_LOOP.with(|current| current.get() == self.shared.id)
    }

    fn execute(&self, task: Task) -> Result<()> {
        self.shared.submit(Command::Run(task))
    }

    fn schedule(&self, delay: Duration, task: Task) -> Result<ScheduledHandle> {
        let handle = ScheduledHandle::new();
        self.shared.submit(Command::Schedule {
            deadline: self.shared.elapsed() + delay,
            handle: handle.clone(),
            task,
        })?;
        Ok(handle)
    }

    fn is_shutdown(&self) -> bool {
        self.shared.sender.read().is_none()
    }
}

impl Drop for SingleThreadEventLoop {
    fn drop(&mut self) {
        self.shutdown_gracefully();
        if !self.in_event_loop() {
            if let Some(handle) = self.thread.lock().take() {
                let _ = handle.join();
            }
        }
    }
}
