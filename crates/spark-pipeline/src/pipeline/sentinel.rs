use std::{net::SocketAddr, sync::Arc};

use spark_core::{ChannelPromise, CoreError, PipelineMessage, Result};

use crate::{
    channel::Channel,
    context::ChannelHandlerContext,
    handler::{ChannelHandler, EventMask, UserEvent},
};

/// 落到 tail 的入站事件的兜底处理策略。
///
/// # 契约说明（What）
/// - `unhandled_message`：接收消息的所有权，默认记录 `debug` 日志后释放；
/// - `unhandled_exception`：默认记录 `warn` 日志；若 [`is_fatal`](Self::is_fatal) 返回 `true`，
///   tail 随后关闭 Channel；
/// - 策略在 Channel 的事件循环上调用，实现不得阻塞。
pub trait UnhandledEventPolicy: Send + Sync + 'static {
    /// 没有 Handler 消费的入站消息。
    fn unhandled_message(&self, channel: Option<&Channel>, msg: PipelineMessage) {
        tracing::debug!(
            channel.id = %channel_label(channel),
            "入站消息到达 tail 未被处理，已释放: {msg:?}"
        );
        msg.release_quietly();
    }

    /// 没有 Handler 处理的异常。
    fn unhandled_exception(&self, channel: Option<&Channel>, cause: &CoreError) {
        tracing::warn!(
            channel.id = %channel_label(channel),
            error.code = cause.code(),
            "异常到达 tail 未被处理: {cause}"
        );
    }

    /// 没有 Handler 处理的用户事件。
    fn unhandled_user_event(&self, channel: Option<&Channel>, event: UserEvent) {
        let _ = event;
        tracing::debug!(
            channel.id = %channel_label(channel),
            "用户事件到达 tail 未被处理"
        );
    }

    /// 该异常是否代表必须关闭 Channel 的致命 I/O 状况。
    fn is_fatal(&self, cause: &CoreError) -> bool {
        let _ = cause;
        false
    }
}

fn channel_label(channel: Option<&Channel>) -> String {
    channel.map_or_else(|| "<detached>".to_owned(), |c| c.id().as_short_text())
}

/// 只记录日志的默认策略。
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingUnhandledPolicy;

impl UnhandledEventPolicy for LoggingUnhandledPolicy {}

/// 头哨兵：出站操作的终点，调用 Channel 的底层操作。
pub(crate) struct HeadHandler;

impl ChannelHandler for HeadHandler {
    fn is_sharable(&self) -> bool {
        true
    }

    fn channel_active(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        ctx.fire_channel_active();
        if let Some(channel) = ctx.channel() {
            if channel.config().auto_read {
                channel.read();
            }
        }
        Ok(())
    }

    fn channel_unregistered(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        ctx.fire_channel_unregistered();
        if let Some(channel) = ctx.channel() {
            if !channel.is_open() {
                channel.pipeline().shared().destroy();
            }
        }
        Ok(())
    }

    fn bind(&self, ctx: &ChannelHandlerContext, local: SocketAddr, promise: ChannelPromise) -> Result<()> {
        match ctx.channel() {
            Some(channel) => channel.bind0(local, promise),
            None => fail_detached(promise),
        }
        Ok(())
    }

    fn connect(
        &self,
        ctx: &ChannelHandlerContext,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        promise: ChannelPromise,
    ) -> Result<()> {
        match ctx.channel() {
            Some(channel) => channel.connect0(remote, local, promise),
            None => fail_detached(promise),
        }
        Ok(())
    }

    fn disconnect(&self, ctx: &ChannelHandlerContext, promise: ChannelPromise) -> Result<()> {
        match ctx.channel() {
            Some(channel) => channel.disconnect0(promise),
            None => fail_detached(promise),
        }
        Ok(())
    }

    fn close(&self, ctx: &ChannelHandlerContext, promise: ChannelPromise) -> Result<()> {
        match ctx.channel() {
            Some(channel) => channel.close0(promise),
            None => fail_detached(promise),
        }
        Ok(())
    }

    fn deregister(&self, ctx: &ChannelHandlerContext, promise: ChannelPromise) -> Result<()> {
        match ctx.channel() {
            Some(channel) => channel.deregister0(promise),
            None => fail_detached(promise),
        }
        Ok(())
    }

    fn read(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        if let Some(channel) = ctx.channel() {
            channel.begin_read0();
        }
        Ok(())
    }

    fn write(&self, ctx: &ChannelHandlerContext, msg: PipelineMessage, promise: ChannelPromise) -> Result<()> {
        match ctx.channel() {
            Some(channel) => channel.write0(msg, promise),
            None => {
                msg.release_quietly();
                fail_detached(promise);
            }
        }
        Ok(())
    }

    fn flush(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        if let Some(channel) = ctx.channel() {
            channel.flush0();
        }
        Ok(())
    }
}

fn fail_detached(promise: ChannelPromise) {
    promise.try_failure(CoreError::channel_closed());
}

/// 尾哨兵：入站事件的终点，交给 [`UnhandledEventPolicy`] 兜底。
pub(crate) struct TailHandler {
    policy: Arc<dyn UnhandledEventPolicy>,
}

impl TailHandler {
    pub(crate) fn new(policy: Arc<dyn UnhandledEventPolicy>) -> Self {
        Self { policy }
    }
}

impl ChannelHandler for TailHandler {
    fn interest(&self) -> EventMask {
        EventMask::INBOUND
    }

    fn is_sharable(&self) -> bool {
        true
    }

    fn channel_registered(&self, _ctx: &ChannelHandlerContext) -> Result<()> {
        Ok(())
    }

    fn channel_unregistered(&self, _ctx: &ChannelHandlerContext) -> Result<()> {
        Ok(())
    }

    fn channel_active(&self, _ctx: &ChannelHandlerContext) -> Result<()> {
        Ok(())
    }

    fn channel_inactive(&self, _ctx: &ChannelHandlerContext) -> Result<()> {
        Ok(())
    }

    fn channel_read(&self, ctx: &ChannelHandlerContext, msg: PipelineMessage) -> Result<()> {
        self.policy.unhandled_message(ctx.channel().as_ref(), msg);
        Ok(())
    }

    fn channel_read_complete(&self, _ctx: &ChannelHandlerContext) -> Result<()> {
        Ok(())
    }

    fn user_event_triggered(&self, ctx: &ChannelHandlerContext, event: UserEvent) -> Result<()> {
        self.policy.unhandled_user_event(ctx.channel().as_ref(), event);
        Ok(())
    }

    fn channel_writability_changed(&self, _ctx: &ChannelHandlerContext) -> Result<()> {
        Ok(())
    }

    fn exception_caught(&self, ctx: &ChannelHandlerContext, cause: CoreError) -> Result<()> {
        let channel = ctx.channel();
        self.policy.unhandled_exception(channel.as_ref(), &cause);
        if self.policy.is_fatal(&cause) {
            if let Some(channel) = channel {
                channel.close();
            }
        }
        Ok(())
    }
}
