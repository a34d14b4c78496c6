//! 集成测试共用的替身：记录事件的 Handler 与可控的内存传输。

#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::Mutex;
use spark_core::{ByteBuf, ChannelPromise, CoreError, PipelineMessage, Result};
use spark_pipeline::{ChannelHandler, ChannelHandlerContext, ChannelTransport, EventMask, OutboundBuffer};

/// 共享事件日志。
pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn bytes(data: &[u8]) -> PipelineMessage {
    PipelineMessage::Buffer(ByteBuf::copy_from_slice(data))
}

/// 把经过的事件记入日志并原样转发的 Handler。
pub struct Recorder {
    label: &'static str,
    log: EventLog,
    interest: EventMask,
}

impl Recorder {
    pub fn new(label: &'static str, log: &EventLog) -> Arc<Self> {
        Self::with_interest(label, log, EventMask::ALL)
    }

    pub fn with_interest(label: &'static str, log: &EventLog, interest: EventMask) -> Arc<Self> {
        Arc::new(Self {
            label,
            log: Arc::clone(log),
            interest,
        })
    }

    fn record(&self, event: impl AsRef<str>) {
        self.log.lock().push(format!("{}:{}", self.label, event.as_ref()));
    }
}

impl ChannelHandler for Recorder {
    fn interest(&self) -> EventMask {
        self.interest
    }

    fn handler_added(&self, _ctx: &ChannelHandlerContext) -> Result<()> {
        self.record("added");
        Ok(())
    }

    fn handler_removed(&self, _ctx: &ChannelHandlerContext) -> Result<()> {
        self.record("removed");
        Ok(())
    }

    fn channel_read(&self, ctx: &ChannelHandlerContext, msg: PipelineMessage) -> Result<()> {
        self.record("read");
        ctx.fire_channel_read(msg);
        Ok(())
    }

    fn exception_caught(&self, ctx: &ChannelHandlerContext, cause: CoreError) -> Result<()> {
        self.record(format!("exception:{}", cause.code()));
        ctx.fire_exception_caught(cause);
        Ok(())
    }

    fn channel_writability_changed(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        let writable = ctx.channel().is_some_and(|channel| channel.is_writable());
        self.record(format!("writable={writable}"));
        ctx.fire_channel_writability_changed();
        Ok(())
    }

    fn write(
        &self,
        ctx: &ChannelHandlerContext,
        msg: PipelineMessage,
        promise: ChannelPromise,
    ) -> Result<()> {
        self.record("write");
        ctx.write(msg, promise);
        Ok(())
    }
}

/// 内存传输：写出的字节收进 `written`，可随时切换激活状态或让写出失败；`bind`/`connect` 使其激活。
#[derive(Default)]
pub struct MemoryTransport {
    closed: AtomicBool,
    inactive: AtomicBool,
    fail_writes: AtomicBool,
    hold_writes: AtomicBool,
    pub written: Mutex<Vec<Vec<u8>>>,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 冲刷时不写出任何数据，条目留在缓冲中。
    pub fn hold_writes(&self, hold: bool) {
        self.hold_writes.store(hold, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_active(&self, active: bool) {
        self.inactive.store(!active, Ordering::SeqCst);
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().clone()
    }
}

impl ChannelTransport for MemoryTransport {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn is_active(&self) -> bool {
        self.is_open() && !self.inactive.load(Ordering::SeqCst)
    }

    fn local_address(&self) -> Option<SocketAddr> {
        None
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        None
    }

    fn do_bind(&self, _local: SocketAddr) -> Result<()> {
        self.set_active(true);
        Ok(())
    }

    fn do_connect(&self, _remote: SocketAddr, _local: Option<SocketAddr>) -> Result<()> {
        self.set_active(true);
        Ok(())
    }

    fn do_disconnect(&self) -> Result<()> {
        self.do_close()
    }

    fn do_close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn do_begin_read(&self) -> Result<()> {
        Ok(())
    }

    fn do_write(&self, buffer: &OutboundBuffer) -> Result<()> {
        if self.hold_writes.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CoreError::new("test.io", "simulated write failure"));
        }
        let _ = buffer.remove_and_write_all(|msg, promise| {
            if let Some(buf) = msg.as_buffer() {
                self.written.lock().push(buf.to_vec());
            }
            msg.release_quietly();
            promise.try_success();
        });
        Ok(())
    }
}
