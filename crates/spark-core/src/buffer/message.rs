use std::{any::Any, fmt, sync::Arc};

use super::{ByteBuf, ReferenceCounted};
use crate::Result;

/// `PipelineMessage` 统一承载网络层字节与业务层对象。
///
/// # 设计背景（Why）
/// - Pipeline 中既有需要手工释放的字节缓冲，也有不参与引用计数的业务对象；
///   两者要沿同一条链路流动，因此以枚举合流。
///
/// # 逻辑解析（How）
/// - `Buffer` 变体封装 [`ByteBuf`]，所有计数操作转发到缓冲；
/// - `User` 变体以 `Arc<dyn Any>` 保存，扇出写时只克隆指针，`release` 恒为 no-op。
///
/// # 契约说明（What）
/// - 把消息交给 Pipeline 的 `write`/`fire_channel_read` 即转移一次引用的所有权；
///   最终由某个 Handler、出站缓冲或尾部哨兵负责释放。
/// - `Debug` 刻意隐藏载荷内容，避免在日志中泄漏数据。
pub enum PipelineMessage {
    /// 字节缓冲。
    Buffer(ByteBuf),
    /// 业务对象。
    User(Arc<dyn Any + Send + Sync>),
}

impl PipelineMessage {
    /// 由任意线程安全对象构造业务消息。
    pub fn user<T: Any + Send + Sync>(value: T) -> Self {
        Self::User(Arc::new(value))
    }

    /// 借用内部缓冲。
    pub fn as_buffer(&self) -> Option<&ByteBuf> {
        match self {
            Self::Buffer(buf) => Some(buf),
            Self::User(_) => None,
        }
    }

    /// 取出内部缓冲；业务消息原样返回。
    pub fn into_buffer(self) -> std::result::Result<ByteBuf, Self> {
        match self {
            Self::Buffer(buf) => Ok(buf),
            other => Err(other),
        }
    }

    /// 尝试把业务消息下转型为 `T`。
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Self::User(value) => value.downcast_ref::<T>(),
            Self::Buffer(_) => None,
        }
    }

    /// 为另一个目的地复制一份消息：缓冲增加一次引用，业务对象共享指针。
    pub fn retained_duplicate(&self) -> Result<Self> {
        match self {
            Self::Buffer(buf) => Ok(Self::Buffer(buf.retained_duplicate()?)),
            Self::User(value) => Ok(Self::User(Arc::clone(value))),
        }
    }

    /// 释放一次引用；业务消息始终返回 `false`。
    pub fn release(&self) -> Result<bool> {
        match self {
            Self::Buffer(buf) => buf.release(),
            Self::User(_) => Ok(false),
        }
    }

    /// 释放一次引用，失败时仅记录日志。
    pub fn release_quietly(&self) {
        if let Err(err) = self.release() {
            tracing::warn!(error.code = err.code(), "释放消息失败: {err}");
        }
    }

    /// 估算消息在出站缓冲中占用的字节数；业务对象使用 `unknown_size`。
    pub fn estimate_size(&self, unknown_size: usize) -> usize {
        match self {
            Self::Buffer(buf) => buf.readable_bytes(),
            Self::User(_) => unknown_size,
        }
    }
}

impl From<ByteBuf> for PipelineMessage {
    fn from(buf: ByteBuf) -> Self {
        Self::Buffer(buf)
    }
}

impl fmt::Debug for PipelineMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineMessage::Buffer(buf) => f.debug_tuple("Buffer").field(buf).finish(),
            PipelineMessage::User(_) => f.debug_tuple("User").field(&"<erased-user>").finish(),
        }
    }
}
