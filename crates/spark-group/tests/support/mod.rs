//! 分组测试共用的替身传输。

#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use spark_core::{CoreError, EventExecutor, Result};
use spark_pipeline::{Channel, ChannelConfig, ChannelHandler, ChannelTransport, OutboundBuffer};

/// 只记录关闭次数与写出字节的传输；`server` 决定 Channel 是否为服务端。
#[derive(Default)]
pub struct StubTransport {
    server: bool,
    closed: AtomicBool,
    fail_close: AtomicBool,
    pub close_calls: AtomicUsize,
    pub written: AtomicUsize,
}

impl StubTransport {
    pub fn client() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn server() -> Arc<Self> {
        Arc::new(Self {
            server: true,
            ..Self::default()
        })
    }

    pub fn fail_close(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }
}

impl ChannelTransport for StubTransport {
    fn is_server(&self) -> bool {
        self.server
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn is_active(&self) -> bool {
        self.is_open()
    }

    fn local_address(&self) -> Option<SocketAddr> {
        None
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        None
    }

    fn do_bind(&self, _local: SocketAddr) -> Result<()> {
        Ok(())
    }

    fn do_disconnect(&self) -> Result<()> {
        self.do_close()
    }

    fn do_close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(CoreError::new("test.close", "simulated close failure"));
        }
        Ok(())
    }

    fn do_begin_read(&self) -> Result<()> {
        Ok(())
    }

    fn do_write(&self, buffer: &OutboundBuffer) -> Result<()> {
        let _ = buffer.remove_and_write_all(|msg, promise| {
            if let Some(buf) = msg.as_buffer() {
                self.written.fetch_add(buf.readable_bytes(), Ordering::SeqCst);
            }
            msg.release_quietly();
            promise.try_success();
        });
        Ok(())
    }
}

/// 构造 Channel、追加 Handler 并注册到给定事件循环，等待注册完成。
pub fn registered(
    transport: Arc<StubTransport>,
    handlers: Vec<Arc<dyn ChannelHandler>>,
    event_loop: &Arc<dyn EventExecutor>,
) -> Channel {
    let channel = Channel::new(transport, ChannelConfig::default());
    for handler in handlers {
        channel
            .pipeline()
            .add_last(None, handler)
            .expect("插入成功");
    }
    let registered = channel.register(Arc::clone(event_loop));
    assert!(registered.wait_timeout(Duration::from_secs(5)), "注册在期限内完成");
    assert!(registered.is_success(), "注册成功");
    channel
}
