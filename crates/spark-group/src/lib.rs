#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]

//! `spark-group`：活跃 Channel 的并发集合与批量操作。
//!
//! # 教案式说明
//! - **意图（Why）**：广播、优雅停机等场景需要对成百上千条连接做同一件事，并知道哪些连接失败了。
//! - **逻辑（How）**：
//!   - [`ChannelGroup`]：按服务端与非服务端分表的并发集合，Channel 关闭后自动移出；
//!   - [`ChannelMatcher`]：可组合的过滤谓词，限定批量操作的目标；
//!   - [`ChannelGroupFuture`]：固定成员快照的聚合完成句柄；
//!   - [`ChannelGroupError`]：列出每个失败成员及其原因的组合错误。
//! - **契约（What）**：批量操作从不同步抛错，所有失败都经由聚合 Future 报告。

pub mod error;
pub mod future;
pub mod group;
pub mod matcher;

pub use error::ChannelGroupError;
pub use future::ChannelGroupFuture;
pub use group::ChannelGroup;
pub use matcher::ChannelMatcher;
