use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use super::{EventExecutor, SingleThreadEventLoop};
use crate::{CoreError, Result, error::codes};

/// 一组单线程事件循环，按轮询方式分配给新注册的 Channel。
pub struct EventLoopGroup {
    loops: Vec<Arc<SingleThreadEventLoop>>,
    cursor: AtomicUsize,
}

impl EventLoopGroup {
    /// 启动 `threads` 个事件循环，线程名为 `{prefix}-{index}`。
    pub fn new(prefix: &str, threads: usize) -> Result<Self> {
        if threads == 0 {
            return Err(CoreError::new(
                codes::EXECUTOR_REJECTED,
                "event loop group requires at least one thread",
            ));
        }
        let loops = (0..threads)
            .map(|index| SingleThreadEventLoop::new(format!("{prefix}-{index}")).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            loops,
            cursor: AtomicUsize::new(0),
        })
    }

    /// 轮询选出下一个事件循环。
    pub fn next(&self) -> Arc<dyn EventExecutor> {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        self.loops[index].clone()
    }

    /// 事件循环数量。
    pub fn len(&self) -> usize {
        self.loops.len()
    }

    /// 组是否为空；构造函数保证至少一个循环，因此恒为 `false`。
    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// 关闭全部事件循环并等待线程退出。
    pub fn shutdown_gracefully(&self) {
        for event_loop in &self.loops {
            event_loop.shutdown_gracefully();
        }
        for event_loop in &self.loops {
            event_loop.await_termination();
        }
    }
}
