//! Channel 生命周期：注册、激活、断开、关闭与注销在 Pipeline 上产生的事件序列。

mod support;

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use spark_core::{CoreError, EventExecutor, Result, error::codes, runtime::EmbeddedEventLoop};
use spark_pipeline::{
    Channel, ChannelConfig, ChannelHandler, ChannelHandlerContext, EmbeddedChannel,
};

use support::{EventLog, MemoryTransport, event_log};

/// 记录生命周期事件的 Handler。
struct LifecycleProbe {
    log: EventLog,
}

impl LifecycleProbe {
    fn new(log: &EventLog) -> Arc<Self> {
        Arc::new(Self {
            log: Arc::clone(log),
        })
    }

    fn record(&self, event: &str) {
        self.log.lock().push(event.to_owned());
    }
}

impl ChannelHandler for LifecycleProbe {
    fn handler_removed(&self, _ctx: &ChannelHandlerContext) -> Result<()> {
        self.record("removed");
        Ok(())
    }

    fn channel_registered(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        self.record("registered");
        ctx.fire_channel_registered();
        Ok(())
    }

    fn channel_unregistered(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        self.record("unregistered");
        ctx.fire_channel_unregistered();
        Ok(())
    }

    fn channel_active(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        self.record("active");
        ctx.fire_channel_active();
        Ok(())
    }

    fn channel_inactive(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        self.record("inactive");
        ctx.fire_channel_inactive();
        Ok(())
    }
}

fn local() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 7000))
}

fn inactive_channel(log: &EventLog) -> (Channel, Arc<EmbeddedEventLoop>) {
    let transport = MemoryTransport::new();
    transport.set_active(false);
    let channel = Channel::new(transport, ChannelConfig::default());
    channel
        .pipeline()
        .add_last(Some("probe"), LifecycleProbe::new(log))
        .expect("插入成功");
    let event_loop = Arc::new(EmbeddedEventLoop::new());
    let executor: Arc<dyn EventExecutor> = event_loop.clone();
    assert!(channel.register(executor).is_success());
    (channel, event_loop)
}

#[test]
fn close_runs_inactive_unregistered_then_destroys_pipeline() {
    let log = event_log();
    let channel = EmbeddedChannel::new(vec![LifecycleProbe::new(&log)]).expect("构造成功");
    assert_eq!(*log.lock(), vec!["registered", "active"]);
    log.lock().clear();

    let closed = channel.close();
    assert!(closed.is_success());
    assert_eq!(
        *log.lock(),
        vec!["inactive", "unregistered", "removed"],
        "关闭后依次失活、注销并拆除 Pipeline"
    );
    assert!(channel.pipeline().is_empty());
    assert!(!channel.channel().is_registered());

    let again = channel.close();
    assert!(again.is_success(), "重复关闭同样成功");
    assert_eq!(log.lock().len(), 3, "重复关闭不再产生事件");
}

#[test]
fn bind_fires_active_once() {
    let log = event_log();
    let (channel, event_loop) = inactive_channel(&log);
    assert_eq!(*log.lock(), vec!["registered"], "未激活的通道注册时不触发 active");

    assert!(channel.bind(local()).is_success());
    event_loop.run_pending_tasks();
    assert_eq!(*log.lock(), vec!["registered", "active"]);

    assert!(channel.bind(local()).is_success());
    event_loop.run_pending_tasks();
    assert_eq!(log.lock().len(), 2, "已激活时再次绑定不重复触发");
}

#[test]
fn connect_fires_active_inline() {
    let log = event_log();
    let (channel, _event_loop) = inactive_channel(&log);
    assert!(channel.connect(local()).is_success());
    assert_eq!(*log.lock(), vec!["registered", "active"]);
    assert!(channel.is_active());
}

#[test]
fn disconnect_fires_inactive_once_and_closes() {
    let log = event_log();
    let (channel, event_loop) = inactive_channel(&log);
    assert!(channel.connect(local()).is_success());
    log.lock().clear();

    assert!(channel.disconnect().is_success());
    event_loop.run_pending_tasks();
    assert!(!channel.is_open(), "不支持半关闭的传输断开即关闭");
    assert!(channel.close_future().is_success());
    assert_eq!(
        log.lock().iter().filter(|event| *event == "inactive").count(),
        1,
        "inactive 恰好一次"
    );
    assert_eq!(log.lock().last().map(String::as_str), Some("removed"));
}

#[test]
fn deregister_keeps_pipeline_of_open_channel() {
    let log = event_log();
    let (channel, event_loop) = inactive_channel(&log);
    log.lock().clear();

    let deregistered = channel.deregister();
    event_loop.run_pending_tasks();
    assert!(deregistered.is_success());
    assert!(!channel.is_registered());
    assert!(channel.is_open());
    assert_eq!(*log.lock(), vec!["unregistered"]);
    assert_eq!(channel.pipeline().names(), vec!["probe"], "仍打开的通道保留 Handler");
}

#[test]
fn operations_on_closed_channel_fail() {
    let log = event_log();
    let (channel, event_loop) = inactive_channel(&log);
    channel.close();
    event_loop.run_pending_tasks();

    assert_eq!(
        channel.bind(local()).cause().map(|err| err.code()),
        Some(codes::CHANNEL_CLOSED)
    );
    assert_eq!(
        channel.connect(local()).cause().map(|err| err.code()),
        Some(codes::CHANNEL_CLOSED)
    );
    assert!(!channel.is_writable());
}

/// `handler_added` 失败的 Handler。
struct BrokenSetup {
    log: EventLog,
}

impl ChannelHandler for BrokenSetup {
    fn handler_added(&self, _ctx: &ChannelHandlerContext) -> Result<()> {
        Err(CoreError::new("test.setup", "setup failed"))
    }

    fn handler_removed(&self, _ctx: &ChannelHandlerContext) -> Result<()> {
        self.log.lock().push("broken:removed".to_owned());
        Ok(())
    }
}

#[test]
fn failing_handler_added_is_reported_and_still_removable() {
    let log = event_log();
    let channel = EmbeddedChannel::new(Vec::new()).expect("构造成功");
    channel
        .pipeline()
        .add_last(
            Some("broken"),
            Arc::new(BrokenSetup {
                log: Arc::clone(&log),
            }),
        )
        .expect("结构变更本身成功");

    let err = channel.check_exception().expect_err("失败进入异常传播");
    assert_eq!(err.code(), codes::PIPELINE_HANDLER_FAILED);
    assert!(err.cause().is_some_and(|cause| cause.to_string().contains("test.setup")));

    channel.pipeline().remove("broken").expect("仍可移除");
    assert_eq!(*log.lock(), vec!["broken:removed"], "视为已添加，移除时回调一次");
}
