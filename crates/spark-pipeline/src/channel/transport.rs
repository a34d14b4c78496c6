use std::net::SocketAddr;

use spark_core::{CoreError, Result, error::codes};

use crate::outbound::OutboundBuffer;

/// Channel 依赖的传输层契约。
///
/// # 契约说明（What）
/// - 所有 `do_*` 方法只由 Pipeline 的头哨兵在 Channel 的事件循环上调用，实现无需自行同步；
/// - `do_connect` 同步返回连接结果；需要异步握手的传输应在内部排队并在完成后再返回；
/// - `do_write` 从 [`OutboundBuffer`] 的可发送区取走条目（`remove`、`remove_bytes`、
///   `remove_and_write_all` 等），未能写出的条目留在缓冲中等待下一次冲刷；
///   返回 `Err` 时 Channel 以 `channel.write_failed` 失败剩余的可发送条目。
pub trait ChannelTransport: Send + Sync + 'static {
    /// 是否为接受连接的服务端 Channel。
    fn is_server(&self) -> bool {
        false
    }

    /// 底层资源是否仍然打开。
    fn is_open(&self) -> bool;

    /// 是否已连接或绑定、可以收发数据。
    fn is_active(&self) -> bool;

    /// 本地地址。
    fn local_address(&self) -> Option<SocketAddr>;

    /// 远端地址。
    fn remote_address(&self) -> Option<SocketAddr>;

    /// 注册到事件循环。
    fn do_register(&self) -> Result<()> {
        Ok(())
    }

    /// 绑定本地地址。
    fn do_bind(&self, local: SocketAddr) -> Result<()>;

    /// 连接远端。
    fn do_connect(&self, remote: SocketAddr, local: Option<SocketAddr>) -> Result<()> {
        let _ = (remote, local);
        Err(CoreError::new(
            codes::CHANNEL_UNSUPPORTED,
            "transport does not support connect",
        ))
    }

    /// 断开连接。
    fn do_disconnect(&self) -> Result<()>;

    /// 关闭底层资源。
    fn do_close(&self) -> Result<()>;

    /// 从事件循环注销。
    fn do_deregister(&self) -> Result<()> {
        Ok(())
    }

    /// 开始读取。
    fn do_begin_read(&self) -> Result<()>;

    /// 写出可发送区的数据。
    fn do_write(&self, buffer: &OutboundBuffer) -> Result<()>;
}
