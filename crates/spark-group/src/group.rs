use std::{
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use dashmap::{DashMap, mapref::entry::Entry};
use spark_core::{ChannelFuture, PipelineMessage};
use spark_pipeline::{Channel, ChannelId};

use crate::{ChannelGroupFuture, ChannelMatcher};

struct GroupInner {
    name: Arc<str>,
    server_channels: DashMap<ChannelId, Channel>,
    non_server_channels: DashMap<ChannelId, Channel>,
    stay_closed: bool,
    closed: AtomicBool,
}

impl GroupInner {
    fn map_for(&self, channel: &Channel) -> &DashMap<ChannelId, Channel> {
        if channel.is_server() {
            &self.server_channels
        } else {
            &self.non_server_channels
        }
    }

    fn remove_by_id(&self, id: ChannelId) -> Option<Channel> {
        self.server_channels
            .remove(&id)
            .or_else(|| self.non_server_channels.remove(&id))
            .map(|(_, channel)| channel)
    }
}

/// 活跃 Channel 的并发集合，支持按匹配器批量写入、冲刷与关闭。
///
/// # 教案式说明
/// - **意图（Why）**：服务端需要“向所有连接广播”“关闭全部连接”这类操作，而连接随时在建立与断开。
/// - **逻辑（How）**：
///   - 服务端 Channel 与普通 Channel 分存两张 `DashMap`，以 `ChannelId` 为键；
///   - 加入时在 `close_future` 上挂监听器，Channel 关闭后自动移出，无需手动清扫；
///   - 批量操作先取匹配 Channel 的快照，再逐个调用，最后交给 [`ChannelGroupFuture`] 聚合。
/// - **契约（What）**：
///   - 同一 Channel 至多出现在一张表中；重复加入返回 `false`；
///   - 写入只发往非服务端 Channel，每个目标拿到一份独立持有引用的副本，原消息在分发后释放一次；
///   - `stay_closed` 分组一旦 `close` 过，之后加入的 Channel 立即被关闭。
/// - **风险与权衡（Trade-offs）**：`close` 先置位 `closed` 再遍历，`add` 先插入再检查 `closed`，
///   因此与 `close` 并发加入的 Channel 可能被关闭两次；`Channel::close` 幂等，重复关闭无副作用。
#[derive(Clone)]
pub struct ChannelGroup {
    inner: Arc<GroupInner>,
}

impl ChannelGroup {
    /// 创建普通分组。
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self::with_stay_closed(name, false)
    }

    /// 创建分组；`stay_closed` 为 `true` 时分组关闭后拒绝存活的新成员。
    pub fn with_stay_closed(name: impl Into<Arc<str>>, stay_closed: bool) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                name: name.into(),
                server_channels: DashMap::new(),
                non_server_channels: DashMap::new(),
                stay_closed,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// 分组名称。
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// 加入 Channel；已存在时返回 `false`。
    pub fn add(&self, channel: Channel) -> bool {
        let id = channel.id();
        let added = match self.inner.map_for(&channel).entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(channel.clone());
                true
            }
        };

        if added {
            tracing::debug!(group = %self.inner.name, channel.id = %id, "Channel 加入分组");
            let group: Weak<GroupInner> = Arc::downgrade(&self.inner);
            channel.close_future().add_listener(move |_| {
                if let Some(group) = group.upgrade()
                    && group.remove_by_id(id).is_some()
                {
                    tracing::debug!(group = %group.name, channel.id = %id, "已关闭的 Channel 移出分组");
                }
            });
        }

        // 插入之后再读 closed，与 close 先置位再遍历配对。
        if self.inner.stay_closed && self.inner.closed.load(Ordering::SeqCst) {
            tracing::debug!(group = %self.inner.name, channel.id = %id, "分组已关闭，新加入的 Channel 随即关闭");
            channel.close();
        }
        added
    }

    /// 移出 Channel；不存在时返回 `false`。
    pub fn remove(&self, channel: &Channel) -> bool {
        self.inner
            .map_for(channel)
            .remove_if(&channel.id(), |_, member| member.ptr_eq(channel))
            .is_some()
    }

    /// 按标识移出。
    pub fn remove_by_id(&self, id: ChannelId) -> Option<Channel> {
        self.inner.remove_by_id(id)
    }

    /// 按标识查找。
    pub fn find(&self, id: ChannelId) -> Option<Channel> {
        self.inner
            .non_server_channels
            .get(&id)
            .or_else(|| self.inner.server_channels.get(&id))
            .map(|member| member.value().clone())
    }

    /// 是否包含该 Channel 实例。
    pub fn contains(&self, channel: &Channel) -> bool {
        self.inner
            .map_for(channel)
            .get(&channel.id())
            .is_some_and(|member| member.ptr_eq(channel))
    }

    /// 成员数量。
    pub fn len(&self) -> usize {
        self.inner.server_channels.len() + self.inner.non_server_channels.len()
    }

    /// 是否没有成员。
    pub fn is_empty(&self) -> bool {
        self.inner.server_channels.is_empty() && self.inner.non_server_channels.is_empty()
    }

    /// 当前成员的快照，服务端 Channel 在前。
    pub fn channels(&self) -> Vec<Channel> {
        let mut channels = snapshot(&self.inner.server_channels, &ChannelMatcher::all());
        channels.extend(snapshot(&self.inner.non_server_channels, &ChannelMatcher::all()));
        channels
    }

    /// 移出全部成员，不关闭它们。
    pub fn clear(&self) {
        self.inner.server_channels.clear();
        self.inner.non_server_channels.clear();
    }

    /// 向匹配的非服务端 Channel 写入消息副本。
    pub fn write(&self, msg: PipelineMessage, matcher: &ChannelMatcher) -> ChannelGroupFuture {
        self.broadcast(msg, matcher, Channel::write)
    }

    /// 写入并冲刷。
    pub fn write_and_flush(
        &self,
        msg: PipelineMessage,
        matcher: &ChannelMatcher,
    ) -> ChannelGroupFuture {
        self.broadcast(msg, matcher, Channel::write_and_flush)
    }

    /// 冲刷匹配的非服务端 Channel。
    pub fn flush(&self, matcher: &ChannelMatcher) -> &Self {
        for channel in snapshot(&self.inner.non_server_channels, matcher) {
            channel.flush();
        }
        self
    }

    /// 断开匹配的 Channel。
    pub fn disconnect(&self, matcher: &ChannelMatcher) -> ChannelGroupFuture {
        self.for_each(matcher, Channel::disconnect)
    }

    /// 关闭匹配的 Channel。
    pub fn close(&self, matcher: &ChannelMatcher) -> ChannelGroupFuture {
        if self.inner.stay_closed {
            // 必须先于遍历置位，见 add。
            self.inner.closed.store(true, Ordering::SeqCst);
        }
        self.for_each(matcher, Channel::close)
    }

    /// 注销匹配的 Channel。
    pub fn deregister(&self, matcher: &ChannelMatcher) -> ChannelGroupFuture {
        self.for_each(matcher, Channel::deregister)
    }

    /// 匹配 Channel 的关闭完成聚合。
    pub fn new_close_future(&self, matcher: &ChannelMatcher) -> ChannelGroupFuture {
        self.for_each(matcher, Channel::close_future)
    }

    fn for_each(
        &self,
        matcher: &ChannelMatcher,
        op: impl Fn(&Channel) -> ChannelFuture,
    ) -> ChannelGroupFuture {
        let mut targets = snapshot(&self.inner.server_channels, matcher);
        targets.extend(snapshot(&self.inner.non_server_channels, matcher));
        let futures: Vec<(ChannelId, ChannelFuture)> = targets
            .iter()
            .map(|channel| (channel.id(), op(channel)))
            .collect();
        ChannelGroupFuture::new(Arc::clone(&self.inner.name), futures)
    }

    fn broadcast(
        &self,
        msg: PipelineMessage,
        matcher: &ChannelMatcher,
        op: impl Fn(&Channel, PipelineMessage) -> ChannelFuture,
    ) -> ChannelGroupFuture {
        let targets = snapshot(&self.inner.non_server_channels, matcher);
        let futures: Vec<(ChannelId, ChannelFuture)> = targets
            .iter()
            .map(|channel| {
                let future = match msg.retained_duplicate() {
                    Ok(copy) => op(channel, copy),
                    Err(err) => ChannelFuture::failed(err),
                };
                (channel.id(), future)
            })
            .collect();
        msg.release_quietly();
        tracing::trace!(group = %self.inner.name, targets = futures.len(), "分组广播写入");
        ChannelGroupFuture::new(Arc::clone(&self.inner.name), futures)
    }
}

/// 取匹配成员的快照；不持有分片锁调用 Channel 操作，关闭监听器移出成员时才不会自锁。
fn snapshot(map: &DashMap<ChannelId, Channel>, matcher: &ChannelMatcher) -> Vec<Channel> {
    map.iter()
        .map(|member| member.value().clone())
        .filter(|channel| matcher.matches(channel))
        .collect()
}

impl fmt::Debug for ChannelGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelGroup")
            .field("name", &self.name())
            .field("size", &self.len())
            .field("stay_closed", &self.inner.stay_closed)
            .finish()
    }
}
