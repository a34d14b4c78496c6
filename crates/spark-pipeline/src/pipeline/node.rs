use std::{
    collections::HashSet,
    sync::{
        Arc, LazyLock,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
};

use parking_lot::Mutex;
use spark_core::EventExecutor;

use crate::{
    error::PipelineError,
    handler::{ChannelHandler, EventMask},
};

const INIT: u8 = 0;
const ADD_PENDING: u8 = 1;
const ADD_COMPLETE: u8 = 2;
const REMOVE_COMPLETE: u8 = 3;

// 已加入某条 Pipeline 的非共享 Handler 实例地址。
static EXCLUSIVE_HANDLERS: LazyLock<Mutex<HashSet<usize>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

fn handler_addr(handler: &Arc<dyn ChannelHandler>) -> usize {
    Arc::as_ptr(handler) as *const () as usize
}

/// 链路中的一个 Handler 节点。
///
/// 状态单调推进：`INIT → ADD_PENDING → ADD_COMPLETE → REMOVE_COMPLETE`，
/// 只有处于 `ADD_COMPLETE` 的节点会收到事件。
pub(crate) struct HandlerNode {
    name: Arc<str>,
    handler: Arc<dyn ChannelHandler>,
    mask: EventMask,
    executor: Option<Arc<dyn EventExecutor>>,
    state: AtomicU8,
    exclusive: AtomicBool,
}

impl HandlerNode {
    /// 构造用户节点；非共享 Handler 在此登记，已被登记时失败。
    pub(crate) fn new(
        name: String,
        handler: Arc<dyn ChannelHandler>,
        executor: Option<Arc<dyn EventExecutor>>,
    ) -> Result<Self, PipelineError> {
        let exclusive = !handler.is_sharable();
        if exclusive && !EXCLUSIVE_HANDLERS.lock().insert(handler_addr(&handler)) {
            return Err(PipelineError::HandlerAlreadyAdded(name));
        }
        let mask = handler.interest();
        Ok(Self {
            name: name.into(),
            handler,
            mask,
            executor,
            state: AtomicU8::new(INIT),
            exclusive: AtomicBool::new(exclusive),
        })
    }

    /// 构造哨兵节点：不参与名称与共享性登记，生来即处于 `ADD_COMPLETE`。
    pub(crate) fn sentinel(name: &str, handler: Arc<dyn ChannelHandler>) -> Self {
        let mask = handler.interest();
        Self {
            name: name.into(),
            handler,
            mask,
            executor: None,
            state: AtomicU8::new(ADD_COMPLETE),
            exclusive: AtomicBool::new(false),
        }
    }

    pub(crate) fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub(crate) fn handler(&self) -> &Arc<dyn ChannelHandler> {
        &self.handler
    }

    pub(crate) fn mask(&self) -> EventMask {
        self.mask
    }

    pub(crate) fn executor(&self) -> Option<&Arc<dyn EventExecutor>> {
        self.executor.as_ref()
    }

    pub(crate) fn is_same_handler(&self, handler: &Arc<dyn ChannelHandler>) -> bool {
        Arc::ptr_eq(&self.handler, handler)
    }

    pub(crate) fn set_add_pending(&self) {
        let _ = self
            .state
            .compare_exchange(INIT, ADD_PENDING, Ordering::AcqRel, Ordering::Acquire);
    }

    /// 推进到 `ADD_COMPLETE`；只有首次推进成功的调用者返回 `true`。
    pub(crate) fn set_add_complete(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current == ADD_COMPLETE || current == REMOVE_COMPLETE {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                ADD_COMPLETE,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// 标记为已移除，返回此前的状态是否为 `ADD_COMPLETE`。
    pub(crate) fn set_removed(&self) -> bool {
        self.state.swap(REMOVE_COMPLETE, Ordering::AcqRel) == ADD_COMPLETE
    }

    pub(crate) fn is_added(&self) -> bool {
        self.state.load(Ordering::Acquire) == ADD_COMPLETE
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.state.load(Ordering::Acquire) == REMOVE_COMPLETE
    }

    /// 归还非共享登记，使同一实例可以再次被添加。
    pub(crate) fn release_exclusive(&self) {
        if self.exclusive.swap(false, Ordering::AcqRel) {
            EXCLUSIVE_HANDLERS.lock().remove(&handler_addr(&self.handler));
        }
    }
}

impl Drop for HandlerNode {
    fn drop(&mut self) {
        self.release_exclusive();
    }
}
