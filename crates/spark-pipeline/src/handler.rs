use std::{
    any::Any,
    fmt,
    net::SocketAddr,
    ops::{BitOr, BitOrAssign},
    sync::Arc,
};

use spark_core::{ChannelPromise, CoreError, PipelineMessage, Result};

use crate::context::ChannelHandlerContext;

/// 用户自定义事件，经 `user_event_triggered` 沿入站方向传播。
pub type UserEvent = Arc<dyn Any + Send + Sync>;

/// Handler 声明关心的事件集合。
///
/// # 设计背景（Why）
/// - Pipeline 在每次分发时需要判断“下一个 Handler 是否处理该事件”；
///   在添加 Handler 时计算一次能力位图，分发路径只做一次位与运算，无需任何运行时反射。
///
/// # 契约说明（What）
/// - 位图在 Handler 加入 Pipeline 时通过 [`ChannelHandler::interest`] 读取一次并缓存；
/// - 未声明某一事件的 Handler 在该事件分发时被整体跳过，其对应回调不会被调用。
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventMask(u32);

impl EventMask {
    /// 空集合。
    pub const EMPTY: Self = Self(0);

    /// 通道注册到事件循环。
    pub const CHANNEL_REGISTERED: Self = Self(1 << 0);
    /// 通道从事件循环注销。
    pub const CHANNEL_UNREGISTERED: Self = Self(1 << 1);
    /// 通道激活。
    pub const CHANNEL_ACTIVE: Self = Self(1 << 2);
    /// 通道失活。
    pub const CHANNEL_INACTIVE: Self = Self(1 << 3);
    /// 读到消息。
    pub const CHANNEL_READ: Self = Self(1 << 4);
    /// 一批读取结束。
    pub const CHANNEL_READ_COMPLETE: Self = Self(1 << 5);
    /// 用户事件。
    pub const USER_EVENT_TRIGGERED: Self = Self(1 << 6);
    /// 可写性变化。
    pub const CHANNEL_WRITABILITY_CHANGED: Self = Self(1 << 7);
    /// 异常。
    pub const EXCEPTION_CAUGHT: Self = Self(1 << 8);

    /// 绑定本地地址。
    pub const BIND: Self = Self(1 << 9);
    /// 连接远端。
    pub const CONNECT: Self = Self(1 << 10);
    /// 断开连接。
    pub const DISCONNECT: Self = Self(1 << 11);
    /// 关闭。
    pub const CLOSE: Self = Self(1 << 12);
    /// 注销。
    pub const DEREGISTER: Self = Self(1 << 13);
    /// 请求读取。
    pub const READ: Self = Self(1 << 14);
    /// 写入。
    pub const WRITE: Self = Self(1 << 15);
    /// 冲刷。
    pub const FLUSH: Self = Self(1 << 16);

    /// 全部入站事件。
    pub const INBOUND: Self = Self(0x1FF);
    /// 全部出站操作。
    pub const OUTBOUND: Self = Self(0xFF << 9);
    /// 全部事件。
    pub const ALL: Self = Self(Self::INBOUND.0 | Self::OUTBOUND.0);

    /// 原始位。
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// 是否包含 `other` 的全部位。
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// 并集。
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// 去掉 `other` 中的位。
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// 是否为空。
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for EventMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs);
    }
}

impl fmt::Debug for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventMask({:#07x})", self.0)
    }
}

/// 为 Handler 提供类型擦除后的下转型与类型名能力，所有 `'static` 类型自动实现。
pub trait AsAny: Any + Send + Sync {
    /// 借用为 `&dyn Any`。
    fn as_any(&self) -> &dyn Any;
    /// 转为 `Arc<dyn Any>`，用于按具体类型取回共享句柄。
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    /// 具体类型名。
    fn type_name(&self) -> &'static str;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// 处理 Channel 入站事件、出站操作与生命周期回调的统一合约。
///
/// # 设计背景（Why）
/// - 一个 Handler 可以只关心入站、只关心出站或两者兼有；以单一 trait 承载全部回调，
///   配合 [`EventMask`] 声明实际覆写了哪些回调。
///
/// # 逻辑解析（How）
/// - 所有回调都有“原样转发给下一个 Handler”的默认实现，实现者只覆写关心的部分；
/// - 回调返回 `Err` 时：入站事件转为从下一个上下文开始的 `exception_caught` 传播；
///   出站操作以该错误失败其 Promise；`exception_caught` 自身返回的错误只记录日志后丢弃。
///
/// # 契约说明（What）
/// - **线程模型**：回调在上下文绑定的执行器上串行调用；实现需 `Send + Sync`，可变状态使用内部可变性；
/// - **所有权**：`channel_read` / `write` 接收消息的一次引用，必须转发或释放；
///   `write` 等操作接收的 Promise 同样必须转发或完成；
/// - **生命周期**：`handler_added` 在链接完成后、任何事件送达前恰好调用一次；
///   `handler_removed` 在解除链接后恰好调用一次，且只在 `handler_added` 完成之后。
///
/// # 风险提示（Trade-offs）
/// - 默认 `interest` 为 [`EventMask::ALL`]，意味着所有事件都会经过该 Handler 的默认转发；
///   只处理少数事件的 Handler 应收窄位图以缩短分发路径。
/// - 把 [`ChannelHandlerContext`] 保存在 Handler 内部是允许的，上下文只持有 Pipeline 的弱引用，不会形成循环。
#[allow(unused_variables)]
pub trait ChannelHandler: AsAny {
    /// 声明关心的事件集合，在加入 Pipeline 时读取一次。
    fn interest(&self) -> EventMask {
        EventMask::ALL
    }

    /// 同一实例能否同时加入多条 Pipeline 或同一 Pipeline 多次。
    fn is_sharable(&self) -> bool {
        false
    }

    /// 已链接进 Pipeline，可以开始接收事件。
    fn handler_added(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        Ok(())
    }

    /// 已从 Pipeline 解除链接。
    fn handler_removed(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        Ok(())
    }

    /// 通道注册到事件循环。
    fn channel_registered(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        ctx.fire_channel_registered();
        Ok(())
    }

    /// 通道从事件循环注销。
    fn channel_unregistered(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        ctx.fire_channel_unregistered();
        Ok(())
    }

    /// 通道激活。
    fn channel_active(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        ctx.fire_channel_active();
        Ok(())
    }

    /// 通道失活。
    fn channel_inactive(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        ctx.fire_channel_inactive();
        Ok(())
    }

    /// 读到一条消息。
    fn channel_read(&self, ctx: &ChannelHandlerContext, msg: PipelineMessage) -> Result<()> {
        ctx.fire_channel_read(msg);
        Ok(())
    }

    /// 一批读取结束。
    fn channel_read_complete(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        ctx.fire_channel_read_complete();
        Ok(())
    }

    /// 用户事件。
    fn user_event_triggered(&self, ctx: &ChannelHandlerContext, event: UserEvent) -> Result<()> {
        ctx.fire_user_event_triggered(event);
        Ok(())
    }

    /// 可写性变化，新状态可通过 `ctx.channel()` 查询。
    fn channel_writability_changed(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        ctx.fire_channel_writability_changed();
        Ok(())
    }

    /// 异常。
    fn exception_caught(&self, ctx: &ChannelHandlerContext, cause: CoreError) -> Result<()> {
        ctx.fire_exception_caught(cause);
        Ok(())
    }

    /// 绑定本地地址。
    fn bind(
        &self,
        ctx: &ChannelHandlerContext,
        local: SocketAddr,
        promise: ChannelPromise,
    ) -> Result<()> {
        ctx.bind(local, promise);
        Ok(())
    }

    /// 连接远端。
    fn connect(
        &self,
        ctx: &ChannelHandlerContext,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        promise: ChannelPromise,
    ) -> Result<()> {
        ctx.connect(remote, local, promise);
        Ok(())
    }

    /// 断开连接。
    fn disconnect(&self, ctx: &ChannelHandlerContext, promise: ChannelPromise) -> Result<()> {
        ctx.disconnect(promise);
        Ok(())
    }

    /// 关闭。
    fn close(&self, ctx: &ChannelHandlerContext, promise: ChannelPromise) -> Result<()> {
        ctx.close(promise);
        Ok(())
    }

    /// 从事件循环注销。
    fn deregister(&self, ctx: &ChannelHandlerContext, promise: ChannelPromise) -> Result<()> {
        ctx.deregister(promise);
        Ok(())
    }

    /// 请求读取。
    fn read(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        ctx.read();
        Ok(())
    }

    /// 写入消息（尚未冲刷）。
    fn write(
        &self,
        ctx: &ChannelHandlerContext,
        msg: PipelineMessage,
        promise: ChannelPromise,
    ) -> Result<()> {
        ctx.write(msg, promise);
        Ok(())
    }

    /// 冲刷已写入的消息。
    fn flush(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        ctx.flush();
        Ok(())
    }
}

/// 取回 Handler 的具体类型。
pub(crate) fn downcast_handler<T: ChannelHandler>(
    handler: &Arc<dyn ChannelHandler>,
) -> Option<Arc<T>> {
    Arc::clone(handler).into_any_arc().downcast::<T>().ok()
}

/// Handler 是否为类型 `T`。
pub(crate) fn handler_is<T: ChannelHandler>(handler: &dyn ChannelHandler) -> bool {
    handler.as_any().is::<T>()
}

/// 自动命名使用的短类型名：去掉模块路径与泛型参数。
pub(crate) fn simple_type_name(handler: &dyn ChannelHandler) -> &'static str {
    let full = handler.type_name();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
