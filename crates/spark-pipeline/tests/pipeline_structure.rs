//! Pipeline 结构变更契约：插入位置、命名、移除与替换、错误的原子性。
//!
//! - **Why**：结构变更可以发生在事件分发途中，任一失败都不能留下半完成的链路；
//!   生命周期回调必须与链接/解除链接严格有序。
//! - **How**：借助 `EmbeddedChannel` 在单线程上确定性地观察回调顺序与名称表。
//! - **What**：名称唯一、非共享 Handler 只能加入一处、失败的变更无副作用、
//!   替换保持位置且先 `removed` 后 `added`。

mod support;

use std::sync::Arc;

use spark_core::{PipelineMessage, Result, error::codes};
use spark_pipeline::{
    ChannelHandler, ChannelHandlerContext, EmbeddedChannel, PipelineError, Position,
};

use support::{Recorder, bytes, event_log};

struct Shared;

impl ChannelHandler for Shared {
    fn is_sharable(&self) -> bool {
        true
    }
}

#[test]
fn insert_positions_and_generated_names() {
    let channel = EmbeddedChannel::new(Vec::new()).expect("构造成功");
    let log = event_log();
    let pipeline = channel.pipeline();
    pipeline
        .add_last(Some("b"), Recorder::new("b", &log))
        .and_then(|p| p.add_first(Some("a"), Recorder::new("a", &log)))
        .and_then(|p| p.add_after("b", Some("d"), Recorder::new("d", &log)))
        .and_then(|p| p.add_before("d", Some("c"), Recorder::new("c", &log)))
        .expect("插入成功");
    pipeline
        .add_last(None, Recorder::new("auto", &log))
        .and_then(|p| p.add_last(None, Recorder::new("auto", &log)))
        .expect("自动命名插入成功");

    assert_eq!(
        pipeline.names(),
        vec!["a", "b", "c", "d", "Recorder#0", "Recorder#1"],
        "插入位置与自动命名"
    );
    assert_eq!(pipeline.len(), 6);
    assert_eq!(
        *log.lock(),
        vec!["b:added", "a:added", "d:added", "c:added", "auto:added", "auto:added"],
        "已注册的 Channel 上 handler_added 同步调用"
    );
    assert_eq!(pipeline.first_context().map(|ctx| ctx.name().to_owned()), Some("a".into()));
    assert_eq!(
        pipeline.last_context().map(|ctx| ctx.name().to_owned()),
        Some("Recorder#1".into())
    );
}

#[test]
fn structural_errors_leave_pipeline_untouched() {
    let channel = EmbeddedChannel::new(Vec::new()).expect("构造成功");
    let log = event_log();
    let pipeline = channel.pipeline();
    let exclusive = Recorder::new("x", &log);
    pipeline
        .add_last(Some("x"), exclusive.clone())
        .expect("首次加入成功");

    let duplicate = pipeline
        .add_last(Some("x"), Recorder::new("y", &log))
        .expect_err("重名必须失败");
    assert_eq!(duplicate, PipelineError::DuplicateName("x".into()));

    let again = pipeline
        .add_last(Some("x2"), exclusive.clone())
        .expect_err("非共享 Handler 不能加入两次");
    assert_eq!(again.code(), codes::PIPELINE_HANDLER_ALREADY_ADDED);

    let missing = pipeline
        .add_before("nope", None, Recorder::new("z", &log))
        .expect_err("基准不存在");
    assert_eq!(missing.code(), codes::PIPELINE_NO_SUCH_ELEMENT);

    assert!(matches!(
        pipeline.remove("nope"),
        Err(PipelineError::NoSuchElement(_))
    ));
    assert!(pipeline.replace("nope", None, Recorder::new("w", &log)).is_err());

    assert_eq!(pipeline.names(), vec!["x"], "失败的变更不改变链路");
    assert_eq!(*log.lock(), vec!["x:added"], "失败的变更不触发任何回调");

    pipeline.remove("x").expect("移除成功");
    pipeline
        .add_last(Some("x"), exclusive)
        .expect("移除后同一实例可以再次加入");
}

#[test]
fn sharable_handler_joins_twice() {
    let channel = EmbeddedChannel::new(Vec::new()).expect("构造成功");
    let shared: Arc<dyn ChannelHandler> = Arc::new(Shared);
    channel
        .pipeline()
        .add_last(Some("one"), Arc::clone(&shared))
        .and_then(|p| p.add_last(Some("two"), Arc::clone(&shared)))
        .expect("共享 Handler 可以多次加入");
    assert_eq!(channel.pipeline().names(), vec!["one", "two"]);
    assert_eq!(
        channel.pipeline().context_of(&shared).map(|ctx| ctx.name().to_owned()),
        Some("one".into()),
        "按实例查找返回链上第一个"
    );
}

#[test]
fn replace_keeps_position_and_orders_callbacks() {
    let log = event_log();
    let channel = EmbeddedChannel::new(vec![
        Recorder::new("a", &log),
        Recorder::new("b", &log),
        Recorder::new("c", &log),
    ])
    .expect("构造成功");
    let pipeline = channel.pipeline();
    log.lock().clear();

    pipeline
        .replace("Recorder#1", Some("b2"), Recorder::new("b2", &log))
        .expect("替换成功");
    assert_eq!(pipeline.names(), vec!["Recorder#0", "b2", "Recorder#2"]);
    assert_eq!(*log.lock(), vec!["b:removed", "b2:added"], "先移除旧的再添加新的");

    log.lock().clear();
    channel
        .write_inbound([bytes(b"x")])
        .expect("入站无异常");
    assert_eq!(*log.lock(), vec!["a:read", "b2:read", "c:read"], "新 Handler 位于原位置");
    channel.release_inbound();
}

#[test]
fn remove_by_type_first_and_last() {
    let log = event_log();
    let channel = EmbeddedChannel::new(vec![
        Recorder::new("a", &log),
        Arc::new(Shared),
        Recorder::new("c", &log),
    ])
    .expect("构造成功");
    let pipeline = channel.pipeline();

    let _removed: Arc<Shared> = pipeline.remove_by_type::<Shared>().expect("按类型移除");
    assert_eq!(pipeline.len(), 2);
    assert!(pipeline.get_by_type::<Shared>().is_none());

    pipeline.remove_first().expect("移除首个");
    pipeline.remove_last().expect("移除末个");
    assert!(pipeline.is_empty());
    assert!(pipeline.remove_first().is_err(), "空链上移除首个失败");
}

/// 初始化器：在 `handler_added` 中展开更多 Handler 后移除自己。
struct Initializer {
    log: support::EventLog,
}

impl ChannelHandler for Initializer {
    fn handler_added(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        let pipeline = ctx.pipeline().expect("Pipeline 存活");
        pipeline.add_after(ctx.name(), Some("inner"), Recorder::new("inner", &self.log))?;
        pipeline.add_after("inner", Some("outer"), Recorder::new("outer", &self.log))?;
        pipeline.remove(ctx.name())?;
        Ok(())
    }
}

#[test]
fn initializer_expands_and_removes_itself() {
    let log = event_log();
    let channel = EmbeddedChannel::new(vec![Arc::new(Initializer {
        log: Arc::clone(&log),
    })])
    .expect("构造成功");

    assert_eq!(channel.pipeline().names(), vec!["inner", "outer"]);
    channel
        .write_inbound([PipelineMessage::user(7u32)])
        .expect("入站无异常");
    assert_eq!(
        *log.lock(),
        vec!["inner:added", "outer:added", "inner:read", "outer:read"],
        "展开出的 Handler 各自恰好收到一次 handler_added，随后参与分发"
    );
    let msg = channel.read_inbound().expect("消息到达 tail");
    assert_eq!(msg.downcast_ref::<u32>(), Some(&7));
}

#[test]
fn handlers_added_before_registration_are_deferred() {
    use spark_core::{EventExecutor, runtime::EmbeddedEventLoop};
    use spark_pipeline::{Channel, ChannelConfig};

    let log = event_log();
    let transport = support::MemoryTransport::new();
    let channel = Channel::new(transport, ChannelConfig::default());
    channel
        .pipeline()
        .add(Position::Last, Some("a"), Recorder::new("a", &log), None)
        .and_then(|p| p.add_last(Some("b"), Recorder::new("b", &log)))
        .expect("注册前可以插入");
    channel.pipeline().remove("b").expect("注册前可以移除");
    assert!(log.lock().is_empty(), "注册前不调用生命周期回调");

    let event_loop: Arc<dyn EventExecutor> = Arc::new(EmbeddedEventLoop::new());
    let registered = channel.register(Arc::clone(&event_loop));
    assert!(registered.is_success());
    assert_eq!(
        *log.lock(),
        vec!["a:added", "b:added", "b:removed"],
        "注册时按入队顺序补发"
    );

    let again = channel.register(event_loop);
    assert_eq!(
        again.cause().map(|err| err.code()),
        Some(codes::CHANNEL_ALREADY_REGISTERED)
    );
}
