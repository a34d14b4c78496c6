//! Channel Pipeline：绑定在单个 Channel 上、可并发修改的 Handler 链。
//!
//! # 模块定位（Why）
//! - 入站事件自 head 流向 tail，出站操作自 tail 流向 head；每个节点只在自己声明关心的
//!   事件上被调用，并在自己绑定的执行器上串行执行。
//! - 结构变更（增删改）与事件分发可以来自任意线程；变更在写锁内原子完成，
//!   分发只在解析“下一个节点”时短暂持有读锁，调用 Handler 时不持有任何锁。
//!
//! # 结构概要（How）
//! - [`chain`]：槽位竞技场，head/tail 固定在 0/1 号槽位；
//! - [`node`]：节点状态机与非共享 Handler 登记；
//! - [`event`]：入站事件与出站操作的内部表示；
//! - [`sentinel`]：头尾哨兵与未处理事件策略。

mod chain;
mod event;
mod node;
mod sentinel;

pub use sentinel::{LoggingUnhandledPolicy, UnhandledEventPolicy};

pub(crate) use chain::{HEAD, Link, TAIL};
pub(crate) use event::{InboundEvent, OutboundOp};
pub(crate) use node::HandlerNode;

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use spark_core::{
    ChannelFuture, ChannelPromise, CoreError, EventExecutor, PipelineMessage, error::codes,
};

use crate::{
    channel::{Channel, ChannelInner},
    context::ChannelHandlerContext,
    error::PipelineError,
    handler::{ChannelHandler, EventMask, UserEvent, downcast_handler, handler_is, simple_type_name},
};

use self::{
    chain::{Chain, PendingCallback},
    sentinel::{HeadHandler, TailHandler},
};

/// 新 Handler 的插入位置。
#[derive(Clone, Copy, Debug)]
pub enum Position<'a> {
    /// 紧跟 head 之后。
    First,
    /// 紧挨 tail 之前。
    Last,
    /// 指定名称的 Handler 之前。
    Before(&'a str),
    /// 指定名称的 Handler 之后。
    After(&'a str),
}

struct DispatchGuard<'a>(&'a AtomicUsize);

impl<'a> DispatchGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Pipeline 的共享状态，由 [`ChannelPipeline`] 与各个上下文共同引用。
pub(crate) struct PipelineShared {
    channel: Weak<ChannelInner>,
    chain: RwLock<Chain>,
    in_flight: AtomicUsize,
}

impl PipelineShared {
    pub(crate) fn new(
        channel: Weak<ChannelInner>,
        policy: Arc<dyn UnhandledEventPolicy>,
    ) -> Arc<Self> {
        let head = Arc::new(HandlerNode::sentinel("head", Arc::new(HeadHandler)));
        let tail = Arc::new(HandlerNode::sentinel("tail", Arc::new(TailHandler::new(policy))));
        Arc::new(Self {
            channel,
            chain: RwLock::new(Chain::new(head, tail)),
            in_flight: AtomicUsize::new(0),
        })
    }

    pub(crate) fn channel(&self) -> Option<Channel> {
        self.channel.upgrade().map(Channel::from_inner)
    }

    pub(crate) fn context(self: &Arc<Self>, link: Link, node: &Arc<HandlerNode>) -> ChannelHandlerContext {
        ChannelHandlerContext::new(Arc::downgrade(self), Arc::downgrade(node), link, Arc::clone(node.name()))
    }

    fn executor_for(&self, node: &HandlerNode) -> Option<Arc<dyn EventExecutor>> {
        if let Some(executor) = node.executor() {
            return Some(Arc::clone(executor));
        }
        self.channel.upgrade().and_then(|inner| inner.event_loop())
    }

    fn write_chain(&self) -> RwLockWriteGuard<'_, Chain> {
        let mut chain = self.chain.write();
        if self.in_flight.load(Ordering::Acquire) == 0 {
            chain.reclaim();
        }
        chain
    }

    pub(crate) fn is_linked(&self, link: Link) -> bool {
        self.chain.read().is_linked(link)
    }

    pub(crate) fn node_executor(&self, link: Link) -> Option<Arc<dyn EventExecutor>> {
        let node = self.chain.read().entry(link).map(|entry| Arc::clone(&entry.node))?;
        self.executor_for(&node)
    }

    // ---- 分发 ----

    fn find_next(&self, from: Link, mask: EventMask) -> (Link, Arc<HandlerNode>) {
        let chain = self.chain.read();
        let mut cursor = match chain.next_of(from) {
            Some(next) => next,
            None => {
                tracing::trace!(?from, "上下文链接已回收，入站事件直接交给 tail");
                TAIL
            }
        };
        loop {
            let Some(entry) = chain.entry(cursor) else {
                tracing::trace!(?from, stale = ?cursor, "墓碑保留的后继已回收，入站事件直接交给 tail");
                cursor = TAIL;
                continue;
            };
            if cursor == TAIL || (entry.linked && entry.node.mask().contains(mask)) {
                return (cursor, Arc::clone(&entry.node));
            }
            cursor = entry.next;
        }
    }

    fn find_prev(&self, from: Link, mask: EventMask) -> Option<(Link, Arc<HandlerNode>)> {
        let chain = self.chain.read();
        let Some(mut cursor) = chain.prev_of(from) else {
            tracing::trace!(?from, "上下文链接已回收，出站操作无处可去");
            return None;
        };
        loop {
            let Some(entry) = chain.entry(cursor) else {
                tracing::trace!(?from, stale = ?cursor, "墓碑保留的前驱已回收，出站操作无处可去");
                return None;
            };
            if cursor == HEAD || (entry.linked && entry.node.mask().contains(mask)) {
                return Some((cursor, Arc::clone(&entry.node)));
            }
            cursor = entry.prev;
        }
    }

    /// 自 `from` 之后的第一个关心该事件的节点开始传播入站事件。
    pub(crate) fn fire_inbound(self: &Arc<Self>, from: Link, event: InboundEvent) {
        let (link, node) = self.find_next(from, event.mask());
        self.deliver_inbound(link, node, event);
    }

    /// 自头哨兵本身开始传播入站事件，头哨兵借此观察激活与注销。
    pub(crate) fn fire_inbound_from_head(self: &Arc<Self>, event: InboundEvent) {
        let head = self.chain.read().entry(HEAD).map(|entry| Arc::clone(&entry.node));
        match head {
            Some(node) => self.deliver_inbound(HEAD, node, event),
            None => event.discard(),
        }
    }

    fn deliver_inbound(self: &Arc<Self>, link: Link, node: Arc<HandlerNode>, event: InboundEvent) {
        match self.executor_for(&node) {
            Some(executor) if !executor.in_event_loop() => {
                let slot = Arc::new(Mutex::new(Some(event)));
                let task_slot = Arc::clone(&slot);
                let shared = Arc::clone(self);
                let task_node = Arc::clone(&node);
                let submitted = executor.execute(Box::new(move || {
                    if let Some(event) = task_slot.lock().take() {
                        shared.run_inbound(link, &task_node, event);
                    }
                }));
                if let Err(err) = submitted {
                    if let Some(event) = slot.lock().take() {
                        tracing::warn!(
                            handler = %node.name(),
                            executor = executor.name(),
                            error.code = err.code(),
                            "执行器拒绝入站事件 {}，事件被丢弃",
                            event.name()
                        );
                        event.discard();
                    }
                }
            }
            _ => self.run_inbound(link, &node, event),
        }
    }

    fn run_inbound(self: &Arc<Self>, link: Link, node: &Arc<HandlerNode>, event: InboundEvent) {
        let _guard = DispatchGuard::enter(&self.in_flight);
        if !node.is_added() {
            self.fire_inbound(link, event);
            return;
        }
        let ctx = self.context(link, node);
        let handler = node.handler();
        let name = event.name();
        let is_exception = matches!(event, InboundEvent::ExceptionCaught(_));
        let result = match event {
            InboundEvent::Registered => handler.channel_registered(&ctx),
            InboundEvent::Unregistered => handler.channel_unregistered(&ctx),
            InboundEvent::Active => handler.channel_active(&ctx),
            InboundEvent::Inactive => handler.channel_inactive(&ctx),
            InboundEvent::Read(msg) => handler.channel_read(&ctx, msg),
            InboundEvent::ReadComplete => handler.channel_read_complete(&ctx),
            InboundEvent::UserEvent(event) => handler.user_event_triggered(&ctx, event),
            InboundEvent::WritabilityChanged => handler.channel_writability_changed(&ctx),
            InboundEvent::ExceptionCaught(cause) => handler.exception_caught(&ctx, cause),
        };
        if let Err(cause) = result {
            if is_exception {
                tracing::warn!(
                    handler = %node.name(),
                    error.code = cause.code(),
                    "exception_caught 自身失败，错误被丢弃: {cause}"
                );
            } else {
                tracing::debug!(handler = %node.name(), event = name, error.code = cause.code(), "入站回调失败");
                self.fire_inbound(link, InboundEvent::ExceptionCaught(cause));
            }
        }
    }

    /// 自 `from` 之前的第一个关心该操作的节点开始传播出站操作。
    pub(crate) fn fire_outbound(self: &Arc<Self>, from: Link, op: OutboundOp) {
        let Some((link, node)) = self.find_prev(from, op.mask()) else {
            op.fail(CoreError::new(
                codes::PIPELINE_CONTEXT_REMOVED,
                "handler context was removed from the pipeline",
            ));
            return;
        };
        match self.executor_for(&node) {
            Some(executor) if !executor.in_event_loop() => {
                let accounted = self.account_pending_write(&op);
                let slot = Arc::new(Mutex::new(Some(op)));
                let task_slot = Arc::clone(&slot);
                let shared = Arc::clone(self);
                let task_node = Arc::clone(&node);
                let submitted = executor.execute(Box::new(move || {
                    if let Some(op) = task_slot.lock().take() {
                        shared.release_pending_write(accounted);
                        shared.run_outbound(link, &task_node, op);
                    }
                }));
                if let Err(err) = submitted {
                    if let Some(op) = slot.lock().take() {
                        self.release_pending_write(accounted);
                        tracing::warn!(
                            handler = %node.name(),
                            executor = executor.name(),
                            "执行器拒绝出站操作 {}",
                            op.name()
                        );
                        op.fail(err);
                    }
                }
            }
            _ => self.run_outbound(link, &node, op),
        }
    }

    // 跨执行器投递的写入在真正执行前计入出站缓冲的挂起字节。
    fn account_pending_write(&self, op: &OutboundOp) -> usize {
        let OutboundOp::Write(msg, _) = op else {
            return 0;
        };
        let Some(inner) = self.channel.upgrade() else {
            return 0;
        };
        let Some(buffer) = inner.outbound_buffer() else {
            return 0;
        };
        let size = msg.estimate_size(inner.config().unknown_message_size);
        buffer.increment_pending_outbound_bytes(size);
        size
    }

    fn release_pending_write(&self, size: usize) {
        if size == 0 {
            return;
        }
        if let Some(buffer) = self.channel.upgrade().and_then(|inner| inner.outbound_buffer()) {
            buffer.decrement_pending_outbound_bytes(size);
        }
    }

    fn run_outbound(self: &Arc<Self>, link: Link, node: &Arc<HandlerNode>, op: OutboundOp) {
        let _guard = DispatchGuard::enter(&self.in_flight);
        if !node.is_added() {
            self.fire_outbound(link, op);
            return;
        }
        let ctx = self.context(link, node);
        let handler = node.handler();
        let name = op.name();
        let promise = op.promise().cloned();
        let result = match op {
            OutboundOp::Bind(local, promise) => handler.bind(&ctx, local, promise),
            OutboundOp::Connect(remote, local, promise) => {
                handler.connect(&ctx, remote, local, promise)
            }
            OutboundOp::Disconnect(promise) => handler.disconnect(&ctx, promise),
            OutboundOp::Close(promise) => handler.close(&ctx, promise),
            OutboundOp::Deregister(promise) => handler.deregister(&ctx, promise),
            OutboundOp::Read => handler.read(&ctx),
            OutboundOp::Write(msg, promise) => handler.write(&ctx, msg, promise),
            OutboundOp::Flush => handler.flush(&ctx),
        };
        let Err(cause) = result else {
            return;
        };
        tracing::debug!(handler = %node.name(), op = name, error.code = cause.code(), "出站回调失败");
        match promise {
            Some(promise) if !promise.is_void() => {
                if !promise.try_failure(cause) {
                    tracing::debug!(handler = %node.name(), op = name, "Promise 已完成，忽略出站失败");
                }
            }
            _ => self.fire_inbound(link, InboundEvent::ExceptionCaught(cause)),
        }
    }

    // ---- 生命周期回调 ----

    fn call_handler_added(self: &Arc<Self>, link: Link, node: &Arc<HandlerNode>) {
        if !node.set_add_complete() {
            return;
        }
        let ctx = self.context(link, node);
        if let Err(cause) = node.handler().handler_added(&ctx) {
            tracing::warn!(handler = %node.name(), error.code = cause.code(), "handler_added 失败");
            let failure = CoreError::new(
                codes::PIPELINE_HANDLER_FAILED,
                format!("handler_added of `{}` failed", node.name()),
            )
            .with_cause(cause);
            self.fire_inbound(link, InboundEvent::ExceptionCaught(failure));
        }
    }

    fn call_handler_removed(self: &Arc<Self>, link: Link, node: &Arc<HandlerNode>) {
        if node.set_removed() {
            let ctx = self.context(link, node);
            if let Err(cause) = node.handler().handler_removed(&ctx) {
                tracing::warn!(handler = %node.name(), error.code = cause.code(), "handler_removed 失败");
                let failure = CoreError::new(
                    codes::PIPELINE_HANDLER_FAILED,
                    format!("handler_removed of `{}` failed", node.name()),
                )
                .with_cause(cause);
                self.fire_inbound(link, InboundEvent::ExceptionCaught(failure));
            }
        }
        node.release_exclusive();
    }

    fn dispatch_added(self: &Arc<Self>, link: Link, node: Arc<HandlerNode>) {
        match self.executor_for(&node) {
            Some(executor) if !executor.in_event_loop() => {
                node.set_add_pending();
                let shared = Arc::clone(self);
                let task_node = Arc::clone(&node);
                let submitted = executor.execute(Box::new(move || {
                    shared.call_handler_added(link, &task_node);
                }));
                if let Err(err) = submitted {
                    tracing::warn!(
                        handler = %node.name(),
                        executor = executor.name(),
                        error.code = err.code(),
                        "无法投递 handler_added，Handler 被移出 Pipeline"
                    );
                    self.chain.write().unlink(link);
                    node.set_removed();
                    node.release_exclusive();
                }
            }
            _ => self.call_handler_added(link, &node),
        }
    }

    fn dispatch_removed(self: &Arc<Self>, link: Link, node: Arc<HandlerNode>) {
        match self.executor_for(&node) {
            Some(executor) if !executor.in_event_loop() => {
                let shared = Arc::clone(self);
                let task_node = Arc::clone(&node);
                let submitted = executor.execute(Box::new(move || {
                    shared.call_handler_removed(link, &task_node);
                }));
                if submitted.is_err() {
                    tracing::warn!(
                        handler = %node.name(),
                        executor = executor.name(),
                        "无法投递 handler_removed，改为在当前线程调用"
                    );
                    self.call_handler_removed(link, &node);
                }
            }
            _ => self.call_handler_removed(link, &node),
        }
    }

    /// 注册完成：放行挂起的生命周期回调，按入队顺序执行。
    pub(crate) fn run_pending_callbacks(self: &Arc<Self>) {
        let pending = {
            let mut chain = self.chain.write();
            chain.registered = true;
            std::mem::take(&mut chain.pending)
        };
        for callback in pending {
            match callback {
                PendingCallback::Added(link, node) => self.dispatch_added(link, node),
                PendingCallback::Removed(link, node) => self.dispatch_removed(link, node),
            }
        }
    }

    /// 拆除全部用户 Handler：先整体解除链接，再自 tail 向 head 回调 `handler_removed`。
    pub(crate) fn destroy(self: &Arc<Self>) {
        let removed = {
            let mut chain = self.write_chain();
            let links = chain.user_links();
            for (link, _) in &links {
                chain.unlink(*link);
            }
            links
        };
        if !removed.is_empty() {
            tracing::debug!(count = removed.len(), "销毁 Pipeline");
        }
        for (link, node) in removed.into_iter().rev() {
            self.dispatch_removed(link, node);
        }
    }

    // ---- 结构变更 ----

    fn generate_name(chain: &Chain, handler: &dyn ChannelHandler) -> String {
        let base = simple_type_name(handler);
        let mut seq = 0usize;
        loop {
            let candidate = format!("{base}#{seq}");
            if !chain.contains_name(&candidate) {
                return candidate;
            }
            seq += 1;
        }
    }

    fn resolve_name(
        chain: &Chain,
        name: Option<&str>,
        handler: &dyn ChannelHandler,
    ) -> Result<String, PipelineError> {
        match name {
            Some(name) if chain.contains_name(name) => {
                Err(PipelineError::DuplicateName(name.to_owned()))
            }
            Some(name) => Ok(name.to_owned()),
            None => Ok(Self::generate_name(chain, handler)),
        }
    }

    fn add(
        self: &Arc<Self>,
        position: Position<'_>,
        name: Option<&str>,
        handler: Arc<dyn ChannelHandler>,
        executor: Option<Arc<dyn EventExecutor>>,
    ) -> Result<(), PipelineError> {
        let (link, node) = {
            let mut chain = self.write_chain();
            let prev = match position {
                Position::First => HEAD,
                Position::Last => chain.prev_of(TAIL).unwrap_or(HEAD),
                Position::Before(target) => {
                    let target_link = chain
                        .lookup(target)
                        .ok_or_else(|| PipelineError::NoSuchElement(target.to_owned()))?;
                    chain.prev_of(target_link).unwrap_or(HEAD)
                }
                Position::After(target) => chain
                    .lookup(target)
                    .ok_or_else(|| PipelineError::NoSuchElement(target.to_owned()))?,
            };
            let name = Self::resolve_name(&chain, name, handler.as_ref())?;
            let node = Arc::new(HandlerNode::new(name, handler, executor)?);
            let link = chain.link_after(prev, Arc::clone(&node));
            tracing::trace!(handler = %node.name(), "Handler 已链接");
            if !chain.registered {
                node.set_add_pending();
                chain.pending.push_back(PendingCallback::Added(link, node));
                return Ok(());
            }
            (link, node)
        };
        self.dispatch_added(link, node);
        Ok(())
    }

    fn remove_link(
        self: &Arc<Self>,
        link: Link,
        label: &str,
    ) -> Result<Arc<HandlerNode>, PipelineError> {
        let node = {
            let mut chain = self.write_chain();
            let node = chain
                .unlink(link)
                .ok_or_else(|| PipelineError::NoSuchElement(label.to_owned()))?;
            if !chain.registered {
                chain
                    .pending
                    .push_back(PendingCallback::Removed(link, Arc::clone(&node)));
                return Ok(node);
            }
            node
        };
        self.dispatch_removed(link, Arc::clone(&node));
        Ok(node)
    }

    fn replace_link(
        self: &Arc<Self>,
        old: Link,
        label: &str,
        new_name: Option<&str>,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<Arc<HandlerNode>, PipelineError> {
        let (link, node, removed) = {
            let mut chain = self.write_chain();
            if !chain.is_linked(old) {
                return Err(PipelineError::NoSuchElement(label.to_owned()));
            }
            // 新 Handler 沿用被替换者绑定的执行器。
            let old_executor = chain
                .entry(old)
                .and_then(|entry| entry.node.executor().cloned());
            let name = match new_name {
                Some(name) if name == label => name.to_owned(),
                other => Self::resolve_name(&chain, other, handler.as_ref())?,
            };
            let node = Arc::new(HandlerNode::new(name, handler, old_executor)?);
            let (link, removed) = chain
                .replace(old, Arc::clone(&node))
                .ok_or_else(|| PipelineError::NoSuchElement(label.to_owned()))?;
            if !chain.registered {
                node.set_add_pending();
                chain
                    .pending
                    .push_back(PendingCallback::Removed(old, Arc::clone(&removed)));
                chain.pending.push_back(PendingCallback::Added(link, node));
                return Ok(removed);
            }
            (link, node, removed)
        };
        self.dispatch_removed(old, Arc::clone(&removed));
        self.dispatch_added(link, node);
        Ok(removed)
    }

    fn find_user(&self, predicate: impl Fn(&HandlerNode) -> bool) -> Option<(Link, Arc<HandlerNode>)> {
        self.chain
            .read()
            .user_links()
            .into_iter()
            .find(|(_, node)| predicate(node))
    }

    fn lookup(&self, name: &str) -> Option<(Link, Arc<HandlerNode>)> {
        let chain = self.chain.read();
        let link = chain.lookup(name)?;
        let node = Arc::clone(&chain.entry(link)?.node);
        Some((link, node))
    }
}

/// Channel 的 Handler 链。
///
/// # 教案式说明
/// - **意图（Why）**：把协议处理拆成可组合、可在运行期增删的 Handler，
///   让入站数据与出站操作按确定的顺序穿过它们。
/// - **逻辑（How）**：
///   - 结构变更在写锁内完成链接/解除链接，随后在 Handler 的执行器上回调 `handler_added` /
///     `handler_removed`；通道尚未注册时回调排队，注册时按入队顺序补发；
///   - 被移除的节点立即从后续分发中消失，但正在其回调中的事件仍能沿它保留的链接继续传播；
///   - `fire_*` 自 head 开始入站传播，出站操作自 tail 开始。
/// - **契约（What）**：
///   - 名称在 Pipeline 内唯一；未显式命名时生成 `类型名#序号`；
///   - 非共享 Handler（[`ChannelHandler::is_sharable`] 为 `false`）同一时刻只能加入一处；
///   - 结构变更失败时不产生任何副作用；
///   - 每个 Handler 的 `handler_added` 与 `handler_removed` 各恰好调用一次且先后有序。
/// - **风险与权衡（Trade-offs）**：Handler 绑定到其他执行器时，事件以任务形式投递，
///   与该执行器上其他来源的任务交错执行。
#[derive(Clone)]
pub struct ChannelPipeline {
    shared: Arc<PipelineShared>,
}

impl ChannelPipeline {
    pub(crate) fn from_shared(shared: Arc<PipelineShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<PipelineShared> {
        &self.shared
    }

    /// 所属 Channel；Channel 已被释放时返回 `None`。
    pub fn channel(&self) -> Option<Channel> {
        self.shared.channel()
    }

    /// 在 head 之后插入。
    pub fn add_first(
        &self,
        name: Option<&str>,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<&Self, PipelineError> {
        self.add(Position::First, name, handler, None)
    }

    /// 在 tail 之前插入。
    pub fn add_last(
        &self,
        name: Option<&str>,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<&Self, PipelineError> {
        self.add(Position::Last, name, handler, None)
    }

    /// 在名为 `base` 的 Handler 之前插入。
    pub fn add_before(
        &self,
        base: &str,
        name: Option<&str>,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<&Self, PipelineError> {
        self.add(Position::Before(base), name, handler, None)
    }

    /// 在名为 `base` 的 Handler 之后插入。
    pub fn add_after(
        &self,
        base: &str,
        name: Option<&str>,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<&Self, PipelineError> {
        self.add(Position::After(base), name, handler, None)
    }

    /// 通用插入：可指定 Handler 专属的执行器，缺省使用 Channel 的事件循环。
    pub fn add(
        &self,
        position: Position<'_>,
        name: Option<&str>,
        handler: Arc<dyn ChannelHandler>,
        executor: Option<Arc<dyn EventExecutor>>,
    ) -> Result<&Self, PipelineError> {
        self.shared.add(position, name, handler, executor)?;
        Ok(self)
    }

    /// 按名称移除，返回被移除的 Handler。
    pub fn remove(&self, name: &str) -> Result<Arc<dyn ChannelHandler>, PipelineError> {
        let (link, _) = self
            .shared
            .lookup(name)
            .ok_or_else(|| PipelineError::NoSuchElement(name.to_owned()))?;
        let node = self.shared.remove_link(link, name)?;
        Ok(Arc::clone(node.handler()))
    }

    /// 按实例移除。
    pub fn remove_handler(&self, handler: &Arc<dyn ChannelHandler>) -> Result<(), PipelineError> {
        let label = simple_type_name(handler.as_ref());
        let (link, _) = self
            .shared
            .find_user(|node| node.is_same_handler(handler))
            .ok_or_else(|| PipelineError::NoSuchElement(label.to_owned()))?;
        self.shared.remove_link(link, label)?;
        Ok(())
    }

    /// 移除链上第一个类型为 `T` 的 Handler。
    pub fn remove_by_type<T: ChannelHandler>(&self) -> Result<Arc<T>, PipelineError> {
        let label = std::any::type_name::<T>();
        let (link, _) = self
            .shared
            .find_user(|node| handler_is::<T>(node.handler().as_ref()))
            .ok_or_else(|| PipelineError::NoSuchElement(label.to_owned()))?;
        let node = self.shared.remove_link(link, label)?;
        downcast_handler::<T>(node.handler())
            .ok_or_else(|| PipelineError::NoSuchElement(label.to_owned()))
    }

    /// 移除紧跟 head 的 Handler。
    pub fn remove_first(&self) -> Result<Arc<dyn ChannelHandler>, PipelineError> {
        let (link, node) = self
            .first_entry()
            .ok_or_else(|| PipelineError::NoSuchElement("<first>".to_owned()))?;
        self.shared.remove_link(link, node.name())?;
        Ok(Arc::clone(node.handler()))
    }

    /// 移除紧挨 tail 的 Handler。
    pub fn remove_last(&self) -> Result<Arc<dyn ChannelHandler>, PipelineError> {
        let (link, node) = self
            .last_entry()
            .ok_or_else(|| PipelineError::NoSuchElement("<last>".to_owned()))?;
        self.shared.remove_link(link, node.name())?;
        Ok(Arc::clone(node.handler()))
    }

    /// 原位替换名为 `old_name` 的 Handler，返回被替换者。
    ///
    /// 回调顺序为旧 Handler 的 `handler_removed`，随后新 Handler 的 `handler_added`。
    pub fn replace(
        &self,
        old_name: &str,
        new_name: Option<&str>,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<Arc<dyn ChannelHandler>, PipelineError> {
        let (link, _) = self
            .shared
            .lookup(old_name)
            .ok_or_else(|| PipelineError::NoSuchElement(old_name.to_owned()))?;
        let removed = self.shared.replace_link(link, old_name, new_name, handler)?;
        Ok(Arc::clone(removed.handler()))
    }

    /// 原位替换链上第一个类型为 `T` 的 Handler。
    pub fn replace_by_type<T: ChannelHandler>(
        &self,
        new_name: Option<&str>,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<Arc<T>, PipelineError> {
        let label = std::any::type_name::<T>();
        let (link, node) = self
            .shared
            .find_user(|node| handler_is::<T>(node.handler().as_ref()))
            .ok_or_else(|| PipelineError::NoSuchElement(label.to_owned()))?;
        let removed = self
            .shared
            .replace_link(link, node.name(), new_name, handler)?;
        downcast_handler::<T>(removed.handler())
            .ok_or_else(|| PipelineError::NoSuchElement(label.to_owned()))
    }

    /// 按名称取 Handler。
    pub fn get(&self, name: &str) -> Option<Arc<dyn ChannelHandler>> {
        self.shared
            .lookup(name)
            .map(|(_, node)| Arc::clone(node.handler()))
    }

    /// 取链上第一个类型为 `T` 的 Handler。
    pub fn get_by_type<T: ChannelHandler>(&self) -> Option<Arc<T>> {
        self.shared
            .find_user(|node| handler_is::<T>(node.handler().as_ref()))
            .and_then(|(_, node)| downcast_handler::<T>(node.handler()))
    }

    /// 按名称取上下文。
    pub fn context(&self, name: &str) -> Option<ChannelHandlerContext> {
        self.shared
            .lookup(name)
            .map(|(link, node)| self.shared.context(link, &node))
    }

    /// 按实例取上下文。
    pub fn context_of(&self, handler: &Arc<dyn ChannelHandler>) -> Option<ChannelHandlerContext> {
        self.shared
            .find_user(|node| node.is_same_handler(handler))
            .map(|(link, node)| self.shared.context(link, &node))
    }

    /// 按类型取上下文。
    pub fn context_by_type<T: ChannelHandler>(&self) -> Option<ChannelHandlerContext> {
        self.shared
            .find_user(|node| handler_is::<T>(node.handler().as_ref()))
            .map(|(link, node)| self.shared.context(link, &node))
    }

    /// 按链上顺序列出用户 Handler 名称（不含哨兵）。
    pub fn names(&self) -> Vec<String> {
        self.shared
            .chain
            .read()
            .user_links()
            .into_iter()
            .map(|(_, node)| node.name().to_string())
            .collect()
    }

    /// 紧跟 head 的 Handler。
    pub fn first(&self) -> Option<Arc<dyn ChannelHandler>> {
        self.first_entry().map(|(_, node)| Arc::clone(node.handler()))
    }

    /// 紧挨 tail 的 Handler。
    pub fn last(&self) -> Option<Arc<dyn ChannelHandler>> {
        self.last_entry().map(|(_, node)| Arc::clone(node.handler()))
    }

    /// 紧跟 head 的上下文。
    pub fn first_context(&self) -> Option<ChannelHandlerContext> {
        self.first_entry()
            .map(|(link, node)| self.shared.context(link, &node))
    }

    /// 紧挨 tail 的上下文。
    pub fn last_context(&self) -> Option<ChannelHandlerContext> {
        self.last_entry()
            .map(|(link, node)| self.shared.context(link, &node))
    }

    /// 用户 Handler 数量。
    pub fn len(&self) -> usize {
        self.shared.chain.read().user_links().len()
    }

    /// 是否没有任何用户 Handler。
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn first_entry(&self) -> Option<(Link, Arc<HandlerNode>)> {
        self.shared.chain.read().user_links().into_iter().next()
    }

    fn last_entry(&self) -> Option<(Link, Arc<HandlerNode>)> {
        self.shared.chain.read().user_links().into_iter().last()
    }

    // ---- 入站 ----

    /// 传播 `channel_registered`。
    pub fn fire_channel_registered(&self) -> &Self {
        self.shared.fire_inbound_from_head(InboundEvent::Registered);
        self
    }

    /// 传播 `channel_unregistered`。
    pub fn fire_channel_unregistered(&self) -> &Self {
        self.shared.fire_inbound_from_head(InboundEvent::Unregistered);
        self
    }

    /// 传播 `channel_active`。
    pub fn fire_channel_active(&self) -> &Self {
        self.shared.fire_inbound_from_head(InboundEvent::Active);
        self
    }

    /// 传播 `channel_inactive`。
    pub fn fire_channel_inactive(&self) -> &Self {
        self.shared.fire_inbound_from_head(InboundEvent::Inactive);
        self
    }

    /// 传播一条读到的消息，转移一次引用。
    pub fn fire_channel_read(&self, msg: PipelineMessage) -> &Self {
        self.shared.fire_inbound_from_head(InboundEvent::Read(msg));
        self
    }

    /// 传播 `channel_read_complete`。
    pub fn fire_channel_read_complete(&self) -> &Self {
        self.shared.fire_inbound_from_head(InboundEvent::ReadComplete);
        self
    }

    /// 传播用户事件。
    pub fn fire_user_event_triggered(&self, event: UserEvent) -> &Self {
        self.shared.fire_inbound_from_head(InboundEvent::UserEvent(event));
        self
    }

    /// 传播可写性变化。
    pub fn fire_channel_writability_changed(&self) -> &Self {
        self.shared.fire_inbound_from_head(InboundEvent::WritabilityChanged);
        self
    }

    /// 传播异常。
    pub fn fire_exception_caught(&self, cause: CoreError) -> &Self {
        self.shared
            .fire_inbound_from_head(InboundEvent::ExceptionCaught(cause));
        self
    }

    // ---- 出站 ----

    /// 绑定本地地址。
    pub fn bind(&self, local: SocketAddr, promise: ChannelPromise) -> ChannelFuture {
        let future = promise.future();
        self.shared.fire_outbound(TAIL, OutboundOp::Bind(local, promise));
        future
    }

    /// 连接远端。
    pub fn connect(
        &self,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        promise: ChannelPromise,
    ) -> ChannelFuture {
        let future = promise.future();
        self.shared
            .fire_outbound(TAIL, OutboundOp::Connect(remote, local, promise));
        future
    }

    /// 断开连接。
    pub fn disconnect(&self, promise: ChannelPromise) -> ChannelFuture {
        let future = promise.future();
        self.shared.fire_outbound(TAIL, OutboundOp::Disconnect(promise));
        future
    }

    /// 关闭。
    pub fn close(&self, promise: ChannelPromise) -> ChannelFuture {
        let future = promise.future();
        self.shared.fire_outbound(TAIL, OutboundOp::Close(promise));
        future
    }

    /// 从事件循环注销。
    pub fn deregister(&self, promise: ChannelPromise) -> ChannelFuture {
        let future = promise.future();
        self.shared.fire_outbound(TAIL, OutboundOp::Deregister(promise));
        future
    }

    /// 请求读取。
    pub fn read(&self) -> &Self {
        self.shared.fire_outbound(TAIL, OutboundOp::Read);
        self
    }

    /// 写入消息（不冲刷），转移一次引用。
    pub fn write(&self, msg: PipelineMessage, promise: ChannelPromise) -> ChannelFuture {
        let future = promise.future();
        if promise.is_done() {
            msg.release_quietly();
            return future;
        }
        self.shared.fire_outbound(TAIL, OutboundOp::Write(msg, promise));
        future
    }

    /// 冲刷。
    pub fn flush(&self) -> &Self {
        self.shared.fire_outbound(TAIL, OutboundOp::Flush);
        self
    }

    /// 写入并冲刷。
    pub fn write_and_flush(&self, msg: PipelineMessage, promise: ChannelPromise) -> ChannelFuture {
        let future = self.write(msg, promise);
        self.flush();
        future
    }
}

impl fmt::Debug for ChannelPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelPipeline")
            .field("handlers", &self.names())
            .finish()
    }
}
