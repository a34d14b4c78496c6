//! 分组成员：分表存放、关闭后自动移出、stay-closed 分组与加入并发时不漏关。

mod support;

use std::{
    sync::{
        Arc, Barrier,
        atomic::Ordering,
    },
    thread,
    time::Duration,
};

use spark_core::{EventExecutor, runtime::{EmbeddedEventLoop, SingleThreadEventLoop}};
use spark_group::{ChannelGroup, ChannelMatcher};

use support::{StubTransport, registered};

fn embedded_loop() -> Arc<dyn EventExecutor> {
    Arc::new(EmbeddedEventLoop::new())
}

#[test]
fn closed_channel_leaves_the_group() {
    let event_loop = embedded_loop();
    let group = ChannelGroup::new("clients");
    let channel = registered(StubTransport::client(), Vec::new(), &event_loop);
    assert!(group.add(channel.clone()));
    assert!(group.contains(&channel));
    assert_eq!(group.len(), 1);

    assert!(channel.close().is_success());
    assert!(!group.contains(&channel), "关闭完成后无需手动移除");
    assert_eq!(group.len(), 0);
    assert!(group.find(channel.id()).is_none());
}

#[test]
fn server_and_client_channels_are_kept_apart() {
    let event_loop = embedded_loop();
    let group = ChannelGroup::new("mixed");
    let server = registered(StubTransport::server(), Vec::new(), &event_loop);
    let client = registered(StubTransport::client(), Vec::new(), &event_loop);
    assert!(group.add(client.clone()));
    assert!(group.add(server.clone()));
    assert!(!group.add(server.clone()), "重复加入返回 false");

    let snapshot = group.channels();
    assert_eq!(snapshot.len(), 2);
    assert!(snapshot[0].ptr_eq(&server), "快照中服务端 Channel 在前");
    assert!(group.find(client.id()).is_some_and(|found| found.ptr_eq(&client)));

    assert!(group.remove(&server));
    assert!(!group.remove(&server), "已移除的 Channel 再次移除返回 false");
    assert!(server.is_open(), "移除不会关闭 Channel");
    assert_eq!(group.len(), 1);

    group.clear();
    assert!(group.is_empty());
    assert!(client.is_open());
}

#[test]
fn removed_channel_closing_later_is_harmless() {
    let event_loop = embedded_loop();
    let group = ChannelGroup::new("removed");
    let kept = registered(StubTransport::client(), Vec::new(), &event_loop);
    let removed = registered(StubTransport::client(), Vec::new(), &event_loop);
    group.add(kept.clone());
    group.add(removed.clone());

    assert!(group.remove_by_id(removed.id()).is_some());
    assert!(removed.close().is_success());
    assert_eq!(group.len(), 1, "自动移出只针对自身标识");
    assert!(group.contains(&kept));
}

#[test]
fn dropped_group_does_not_keep_channels_alive() {
    let event_loop = embedded_loop();
    let channel = registered(StubTransport::client(), Vec::new(), &event_loop);
    {
        let group = ChannelGroup::new("short-lived");
        group.add(channel.clone());
    }
    assert!(channel.close().is_success(), "分组已释放时关闭监听器什么也不做");
}

/// stay-closed 分组的 `close` 与 `add` 并发：新 Channel 在所有交错下都会被关闭。
///
/// 两条路径都可能对同一个 Channel 发起关闭（`close` 的快照包含了它，`add` 又读到了 closed），
/// 这是被接受的行为：`Channel::close` 幂等，底层资源只关闭一次。
#[test]
fn add_racing_stay_closed_close_never_escapes() {
    let event_loop: Arc<dyn EventExecutor> =
        Arc::new(SingleThreadEventLoop::new("group-race").expect("启动事件循环"));

    for round in 0..200 {
        let group = ChannelGroup::with_stay_closed(format!("race-{round}"), true);
        let existing = registered(StubTransport::client(), Vec::new(), &event_loop);
        group.add(existing.clone());

        let transport = StubTransport::client();
        let newcomer = registered(Arc::clone(&transport), Vec::new(), &event_loop);
        let start = Arc::new(Barrier::new(2));

        let closing = {
            let group = group.clone();
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                group.close(&ChannelMatcher::all())
            })
        };
        start.wait();
        group.add(newcomer.clone());

        let closed = closing.join().expect("关闭线程未崩溃");
        assert!(
            closed.wait_timeout(Duration::from_secs(5)),
            "第 {round} 轮分组关闭在期限内完成"
        );
        assert!(
            newcomer.close_future().wait_timeout(Duration::from_secs(5)),
            "第 {round} 轮新 Channel 未逃脱关闭"
        );
        assert!(!newcomer.is_open());
        assert!(!existing.is_open());
        assert_eq!(
            transport.close_calls.load(Ordering::SeqCst),
            1,
            "第 {round} 轮可能收到两次关闭请求，但底层资源只关闭一次"
        );
    }
}
