#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = "spark-core: 异步传输内核的基础契约。"]
#![doc = ""]
#![doc = "本 crate 只承载被 Pipeline、出站缓冲与 ChannelGroup 共同消费的能力：稳定错误域、"]
#![doc = "手工引用计数缓冲、单次赋值的 Promise/Future，以及事件执行器契约与参考实现。"]
#![doc = "具体 Socket I/O、编解码与引导装配不在本 crate 的职责范围内。"]

pub mod buffer;
pub mod error;
pub mod future;
pub mod runtime;

pub use buffer::{BufferAllocator, ByteBuf, PipelineMessage, ReferenceCounted, UnpooledAllocator};
pub use error::{CoreError, ErrorCause, Result};
pub use future::{ChannelFuture, ChannelPromise};
pub use runtime::{EventExecutor, Task};
