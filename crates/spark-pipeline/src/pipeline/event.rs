use std::net::SocketAddr;

use spark_core::{ChannelPromise, CoreError, PipelineMessage};

use crate::handler::{EventMask, UserEvent};

/// 沿 head→tail 方向传播的入站事件。
pub(crate) enum InboundEvent {
    Registered,
    Unregistered,
    Active,
    Inactive,
    Read(PipelineMessage),
    ReadComplete,
    UserEvent(UserEvent),
    WritabilityChanged,
    ExceptionCaught(CoreError),
}

impl InboundEvent {
    pub(crate) fn mask(&self) -> EventMask {
        match self {
            InboundEvent::Registered => EventMask::CHANNEL_REGISTERED,
            InboundEvent::Unregistered => EventMask::CHANNEL_UNREGISTERED,
            InboundEvent::Active => EventMask::CHANNEL_ACTIVE,
            InboundEvent::Inactive => EventMask::CHANNEL_INACTIVE,
            InboundEvent::Read(_) => EventMask::CHANNEL_READ,
            InboundEvent::ReadComplete => EventMask::CHANNEL_READ_COMPLETE,
            InboundEvent::UserEvent(_) => EventMask::USER_EVENT_TRIGGERED,
            InboundEvent::WritabilityChanged => EventMask::CHANNEL_WRITABILITY_CHANGED,
            InboundEvent::ExceptionCaught(_) => EventMask::EXCEPTION_CAUGHT,
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            InboundEvent::Registered => "channel_registered",
            InboundEvent::Unregistered => "channel_unregistered",
            InboundEvent::Active => "channel_active",
            InboundEvent::Inactive => "channel_inactive",
            InboundEvent::Read(_) => "channel_read",
            InboundEvent::ReadComplete => "channel_read_complete",
            InboundEvent::UserEvent(_) => "user_event_triggered",
            InboundEvent::WritabilityChanged => "channel_writability_changed",
            InboundEvent::ExceptionCaught(_) => "exception_caught",
        }
    }

    /// 事件无法送达时释放其携带的资源。
    pub(crate) fn discard(self) {
        if let InboundEvent::Read(msg) = self {
            msg.release_quietly();
        }
    }
}

/// 沿 tail→head 方向传播的出站操作。
pub(crate) enum OutboundOp {
    Bind(SocketAddr, ChannelPromise),
    Connect(SocketAddr, Option<SocketAddr>, ChannelPromise),
    Disconnect(ChannelPromise),
    Close(ChannelPromise),
    Deregister(ChannelPromise),
    Read,
    Write(PipelineMessage, ChannelPromise),
    Flush,
}

impl OutboundOp {
    pub(crate) fn mask(&self) -> EventMask {
        match self {
            OutboundOp::Bind(..) => EventMask::BIND,
            OutboundOp::Connect(..) => EventMask::CONNECT,
            OutboundOp::Disconnect(_) => EventMask::DISCONNECT,
            OutboundOp::Close(_) => EventMask::CLOSE,
            OutboundOp::Deregister(_) => EventMask::DEREGISTER,
            OutboundOp::Read => EventMask::READ,
            OutboundOp::Write(..) => EventMask::WRITE,
            OutboundOp::Flush => EventMask::FLUSH,
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            OutboundOp::Bind(..) => "bind",
            OutboundOp::Connect(..) => "connect",
            OutboundOp::Disconnect(_) => "disconnect",
            OutboundOp::Close(_) => "close",
            OutboundOp::Deregister(_) => "deregister",
            OutboundOp::Read => "read",
            OutboundOp::Write(..) => "write",
            OutboundOp::Flush => "flush",
        }
    }

    /// 操作携带的 Promise。
    pub(crate) fn promise(&self) -> Option<&ChannelPromise> {
        match self {
            OutboundOp::Bind(_, promise)
            | OutboundOp::Connect(_, _, promise)
            | OutboundOp::Disconnect(promise)
            | OutboundOp::Close(promise)
            | OutboundOp::Deregister(promise)
            | OutboundOp::Write(_, promise) => Some(promise),
            OutboundOp::Read | OutboundOp::Flush => None,
        }
    }

    /// 操作无法执行时释放消息并以 `cause` 失败 Promise。
    pub(crate) fn fail(self, cause: CoreError) {
        if let OutboundOp::Write(msg, _) = &self {
            msg.release_quietly();
        }
        if let Some(promise) = self.promise() {
            promise.try_failure(cause);
        }
    }
}
