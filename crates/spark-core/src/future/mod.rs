//! 单次赋值的完成句柄。
//!
//! # 模块定位（Why）
//! - 写入、连接、关闭与 ChannelGroup 批量操作都不阻塞调用线程，而是返回一个在未来某时刻
//!   恰好完成一次的句柄；完成状态只有成功、失败（携带原因）、取消三种。
//!
//! # 结构概要（How）
//! - [`ChannelPromise`]：写端，持有 `try_success`/`try_failure`/`cancel`；
//! - [`ChannelFuture`]：读端，提供查询、监听器、阻塞等待，并实现 `std::future::Future`；
//! - [`combine`]：把一组 Future 聚合为一个，全部完成后才完成；
//! - [`timeout::fail_after`]：以定时任务表达超时，完成与超时谁先到达谁生效。

mod combiner;
mod promise;
pub mod timeout;

pub use combiner::combine;
pub use promise::{ChannelFuture, ChannelPromise};
