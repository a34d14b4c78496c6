use std::{
    fmt,
    net::SocketAddr,
    sync::{Arc, Weak},
};

use spark_core::{ChannelFuture, ChannelPromise, CoreError, EventExecutor, PipelineMessage};

use crate::{
    channel::Channel,
    handler::{ChannelHandler, UserEvent},
    pipeline::{ChannelPipeline, HandlerNode, InboundEvent, Link, OutboundOp, PipelineShared},
};

/// Handler 在 Pipeline 中的位置句柄。
///
/// # 设计背景（Why）
/// - Handler 通过上下文把事件继续传给下一个节点；上下文记住“自己在哪里”，
///   因此传播总是从当前节点的后继（入站）或前驱（出站）开始，而不是从链首重来。
///
/// # 契约说明（What）
/// - 上下文可以被 Handler 保存并在之后任意线程使用；它只持有 Pipeline 与节点的弱引用，
///   Handler 保存自己的上下文不会形成引用环；
/// - 节点被移除后仍沿其保留的前驱/后继继续传播；节点槽位被回收后，入站事件直接交给 tail，
///   出站操作以 `pipeline.context_removed` 失败；
///   Pipeline 已释放时，消息被释放、Promise 以 `channel.closed` 失败；
/// - `write` 接收已完成（通常是已取消）的 Promise 时释放消息并跳过写入。
#[derive(Clone)]
pub struct ChannelHandlerContext {
    pipeline: Weak<PipelineShared>,
    node: Weak<HandlerNode>,
    link: Link,
    name: Arc<str>,
}

impl ChannelHandlerContext {
    pub(crate) fn new(
        pipeline: Weak<PipelineShared>,
        node: Weak<HandlerNode>,
        link: Link,
        name: Arc<str>,
    ) -> Self {
        Self {
            pipeline,
            node,
            link,
            name,
        }
    }

    /// Handler 在 Pipeline 中的名称。
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 所属 Channel。
    pub fn channel(&self) -> Option<Channel> {
        self.pipeline.upgrade().and_then(|shared| shared.channel())
    }

    /// 所属 Pipeline。
    pub fn pipeline(&self) -> Option<ChannelPipeline> {
        self.pipeline.upgrade().map(ChannelPipeline::from_shared)
    }

    /// 上下文包装的 Handler；节点已回收时返回 `None`。
    pub fn handler(&self) -> Option<Arc<dyn ChannelHandler>> {
        self.node.upgrade().map(|node| Arc::clone(node.handler()))
    }

    /// 回调执行所在的执行器；Channel 尚未注册且 Handler 未绑定执行器时返回 `None`。
    pub fn executor(&self) -> Option<Arc<dyn EventExecutor>> {
        self.pipeline
            .upgrade()
            .and_then(|shared| shared.node_executor(self.link))
    }

    /// 节点是否已从 Pipeline 移除。
    pub fn is_removed(&self) -> bool {
        let node_removed = self.node.upgrade().is_none_or(|node| node.is_removed());
        node_removed
            || !self
                .pipeline
                .upgrade()
                .is_some_and(|shared| shared.is_linked(self.link))
    }

    /// 新建 Promise。
    pub fn new_promise(&self) -> ChannelPromise {
        ChannelPromise::new()
    }

    /// 调用方不关心结果时使用的 void Promise。
    pub fn void_promise(&self) -> ChannelPromise {
        ChannelPromise::void()
    }

    fn inbound(&self, event: InboundEvent) {
        match self.pipeline.upgrade() {
            Some(shared) => shared.fire_inbound(self.link, event),
            None => event.discard(),
        }
    }

    fn outbound(&self, op: OutboundOp) {
        match self.pipeline.upgrade() {
            Some(shared) => shared.fire_outbound(self.link, op),
            None => op.fail(CoreError::channel_closed()),
        }
    }

    /// 向后传播 `channel_registered`。
    pub fn fire_channel_registered(&self) {
        self.inbound(InboundEvent::Registered);
    }

    /// 向后传播 `channel_unregistered`。
    pub fn fire_channel_unregistered(&self) {
        self.inbound(InboundEvent::Unregistered);
    }

    /// 向后传播 `channel_active`。
    pub fn fire_channel_active(&self) {
        self.inbound(InboundEvent::Active);
    }

    /// 向后传播 `channel_inactive`。
    pub fn fire_channel_inactive(&self) {
        self.inbound(InboundEvent::Inactive);
    }

    /// 向后传播读到的消息，转移一次引用。
    pub fn fire_channel_read(&self, msg: PipelineMessage) {
        self.inbound(InboundEvent::Read(msg));
    }

    /// 向后传播 `channel_read_complete`。
    pub fn fire_channel_read_complete(&self) {
        self.inbound(InboundEvent::ReadComplete);
    }

    /// 向后传播用户事件。
    pub fn fire_user_event_triggered(&self, event: UserEvent) {
        self.inbound(InboundEvent::UserEvent(event));
    }

    /// 向后传播可写性变化。
    pub fn fire_channel_writability_changed(&self) {
        self.inbound(InboundEvent::WritabilityChanged);
    }

    /// 向后传播异常。
    pub fn fire_exception_caught(&self, cause: CoreError) {
        self.inbound(InboundEvent::ExceptionCaught(cause));
    }

    /// 向前传播 `bind`。
    pub fn bind(&self, local: SocketAddr, promise: ChannelPromise) -> ChannelFuture {
        let future = promise.future();
        self.outbound(OutboundOp::Bind(local, promise));
        future
    }

    /// 向前传播 `connect`。
    pub fn connect(
        &self,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        promise: ChannelPromise,
    ) -> ChannelFuture {
        let future = promise.future();
        self.outbound(OutboundOp::Connect(remote, local, promise));
        future
    }

    /// 向前传播 `disconnect`。
    pub fn disconnect(&self, promise: ChannelPromise) -> ChannelFuture {
        let future = promise.future();
        self.outbound(OutboundOp::Disconnect(promise));
        future
    }

    /// 向前传播 `close`。
    pub fn close(&self, promise: ChannelPromise) -> ChannelFuture {
        let future = promise.future();
        self.outbound(OutboundOp::Close(promise));
        future
    }

    /// 向前传播 `deregister`。
    pub fn deregister(&self, promise: ChannelPromise) -> ChannelFuture {
        let future = promise.future();
        self.outbound(OutboundOp::Deregister(promise));
        future
    }

    /// 向前传播 `read`。
    pub fn read(&self) {
        self.outbound(OutboundOp::Read);
    }

    /// 向前传播 `write`，转移一次引用。
    pub fn write(&self, msg: PipelineMessage, promise: ChannelPromise) -> ChannelFuture {
        let future = promise.future();
        if promise.is_done() {
            if !promise.is_cancelled() {
                tracing::debug!(handler = %self.name, "写入使用了已完成的 Promise，消息被释放");
            }
            msg.release_quietly();
            return future;
        }
        self.outbound(OutboundOp::Write(msg, promise));
        future
    }

    /// 向前传播 `flush`。
    pub fn flush(&self) {
        self.outbound(OutboundOp::Flush);
    }

    /// 写入并冲刷。
    pub fn write_and_flush(&self, msg: PipelineMessage, promise: ChannelPromise) -> ChannelFuture {
        let future = self.write(msg, promise);
        self.flush();
        future
    }
}

impl fmt::Debug for ChannelHandlerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandlerContext")
            .field("name", &self.name)
            .field("removed", &self.is_removed())
            .finish()
    }
}
