#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]

//! `spark-pipeline`：Channel、Handler 链、出站缓冲与水位线背压。
//!
//! # 教案式说明
//! - **意图（Why）**：把“一条连接上的事件如何在 Handler 之间流动、写入如何排队并受背压约束”
//!   收拢在一个 crate 中，传输层只需实现 [`ChannelTransport`] 即可复用全部语义。
//! - **逻辑（How）**：
//!   - [`ChannelPipeline`]：head/tail 哨兵之间的双向 Handler 链，可在任意线程并发增删改；
//!   - [`ChannelHandlerContext`]：Handler 在链上的位置，负责把事件转发给下一个关心该事件的节点；
//!   - [`OutboundBuffer`]：“未冲刷/可发送”两段式写队列，按高低水位线翻转可写性；
//!   - [`CoalescingBufferQueue`]：把小写入合并成大块写出的队列；
//!   - [`EmbeddedChannel`]：内存传输，供 Handler 单元测试使用。
//! - **契约（What）**：所有事件在 Handler 绑定的执行器上串行调用；消息与 Promise 的所有权沿链路转移，
//!   最终由某个 Handler、出站缓冲或 tail 负责释放与完成。
//! - **风险与权衡（Trade-offs）**：结构变更与事件分发共用一把读写锁，分发只在解析下一个节点时持读锁；
//!   Handler 回调期间不持有任何锁，因此回调内可以安全地修改 Pipeline。

pub mod channel;
pub mod config;
pub mod context;
pub mod embedded;
pub mod error;
pub mod handler;
pub mod outbound;
pub mod pipeline;

pub use channel::{Channel, ChannelId, ChannelTransport, WeakChannel};
pub use config::{ChannelConfig, ConfigError, WriteBufferWaterMark};
pub use context::ChannelHandlerContext;
pub use embedded::EmbeddedChannel;
pub use error::PipelineError;
pub use handler::{ChannelHandler, EventMask, UserEvent};
pub use outbound::{CoalescingBufferQueue, OutboundBuffer, WritabilityListener};
pub use pipeline::{ChannelPipeline, LoggingUnhandledPolicy, Position, UnhandledEventPolicy};
