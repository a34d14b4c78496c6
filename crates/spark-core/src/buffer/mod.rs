//! 引用计数缓冲与 Pipeline 消息。
//!
//! # 模块定位（Why）
//! - Pipeline 中流动的载荷需要确定性的释放时机（池化内存要在最后一次使用后立即归还），
//!   因此在 `Arc` 的所有权之外额外维护一个显式的引用计数。
//! - 所有接收缓冲的 API 都需在文档中写明“取得所有权（消费一次引用）”还是“借用”。
//!
//! # 结构概要（How）
//! - [`ByteBuf`]：`bytes::Bytes` 只读视图 + 共享原子计数；`duplicate` 系列共享同一个计数。
//! - [`ByteBuf::compose`]：把多个缓冲合并为一个组合缓冲，组合缓冲持有每个分量的一次引用，
//!   自身归零时逐个释放分量。
//! - [`BufferAllocator`]：分配策略的最小契约，内置 [`UnpooledAllocator`]。
//! - [`PipelineMessage`]：缓冲或任意用户对象。

mod allocator;
mod byte_buf;
mod message;

pub use allocator::{BufferAllocator, UnpooledAllocator};
pub use byte_buf::ByteBuf;
pub use message::PipelineMessage;

use crate::Result;

/// 手工引用计数契约。
///
/// # 契约说明（What）
/// - 新建对象的计数为 1；
/// - [`retain`](Self::retain) 在计数已归零时失败，返回 `buffer.illegal_refcount`；
/// - [`release`](Self::release) 返回 `true` 表示本次释放是最后一次引用，底层资源已经回收；
///   对计数为 0 的对象再次释放同样返回 `buffer.illegal_refcount`。
pub trait ReferenceCounted {
    /// 当前引用计数。
    fn ref_count(&self) -> usize;

    /// 计数加一。
    fn retain(&self) -> Result<()>;

    /// 计数减一；归零时回收资源并返回 `true`。
    fn release(&self) -> Result<bool>;
}

/// `BufferRecycler` 描述缓冲在计数归零时的回收入口。
///
/// # 使用方式（How）
/// - 缓冲池实现应当将自身或内部的回收句柄封装为 `Arc<dyn BufferRecycler>`，
///   在构造 [`ByteBuf::with_recycler`] 时一并注入；
/// - 共享同一计数的所有视图中最后一次 `release` 会触发且仅触发一次 `reclaim`。
///
/// # 契约定义（What）
/// - 实现必须线程安全，且不得 panic：回收发生在任意线程的 `release` 调用栈上。
pub trait BufferRecycler: Send + Sync + 'static {
    /// 通知池归还指定容量。
    fn reclaim(&self, capacity: usize);
}
