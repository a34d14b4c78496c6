//! 生命周期回调的对称性：注册与移除并发发生时，`handler_added` 与 `handler_removed`
//! 各恰好一次，且 `added` 总在 `removed` 之前。

mod support;

use std::{
    sync::{Arc, mpsc},
    thread,
    time::Duration,
};

use spark_core::{EventExecutor, runtime::SingleThreadEventLoop};
use spark_pipeline::{Channel, ChannelConfig};

use support::{MemoryTransport, Recorder, event_log};

fn barrier(executor: &Arc<dyn EventExecutor>) {
    let (tx, rx) = mpsc::channel();
    executor
        .execute(Box::new(move || {
            let _ = tx.send(());
        }))
        .expect("事件循环接受任务");
    rx.recv_timeout(Duration::from_secs(5)).expect("事件循环排空");
}

#[test]
fn registration_racing_removal_keeps_callbacks_ordered() {
    let event_loop: Arc<dyn EventExecutor> =
        Arc::new(SingleThreadEventLoop::new("lifecycle-loop").expect("启动事件循环"));

    for round in 0..200 {
        let log = event_log();
        let channel = Channel::new(MemoryTransport::new(), ChannelConfig::default());
        channel
            .pipeline()
            .add_last(Some("probe"), Recorder::new("probe", &log))
            .expect("插入成功");

        let registering = {
            let channel = channel.clone();
            let event_loop = Arc::clone(&event_loop);
            thread::spawn(move || channel.register(event_loop))
        };
        channel.pipeline().remove("probe").expect("移除成功");

        let registered = registering.join().expect("注册线程未崩溃");
        assert!(
            registered.wait_timeout(Duration::from_secs(5)),
            "第 {round} 轮注册在期限内完成"
        );
        assert!(registered.is_success(), "第 {round} 轮注册成功");
        barrier(&event_loop);

        assert_eq!(
            *log.lock(),
            vec!["probe:added", "probe:removed"],
            "第 {round} 轮回调各一次且先添加后移除"
        );
        assert!(channel.close().wait_timeout(Duration::from_secs(5)), "关闭在期限内完成");
    }
}

#[test]
fn removal_on_registered_channel_is_posted_to_the_loop() {
    let event_loop: Arc<dyn EventExecutor> =
        Arc::new(SingleThreadEventLoop::new("posted-removal").expect("启动事件循环"));
    let log = event_log();
    let channel = Channel::new(MemoryTransport::new(), ChannelConfig::default());
    assert!(
        channel
            .register(Arc::clone(&event_loop))
            .wait_timeout(Duration::from_secs(5)),
        "注册完成"
    );

    channel
        .pipeline()
        .add_last(Some("probe"), Recorder::new("probe", &log))
        .expect("插入成功");
    channel.pipeline().remove("probe").expect("移除成功");
    assert!(channel.pipeline().is_empty(), "解除链接立即生效");

    barrier(&event_loop);
    assert_eq!(*log.lock(), vec!["probe:added", "probe:removed"]);
}
