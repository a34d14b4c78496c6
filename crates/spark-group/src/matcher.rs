use std::{fmt, sync::Arc};

use spark_pipeline::Channel;

type Predicate = dyn Fn(&Channel) -> bool + Send + Sync;

/// 批量操作的 Channel 过滤器。
///
/// # 教案式说明
/// - **意图（Why）**：广播时常见“除发送者外”“只关服务端”等筛选，需要可组合的谓词而不是
///   为每种组合新增一组方法。
/// - **逻辑（How）**：内部持有共享闭包，克隆只增加一次原子计数；组合子返回新的匹配器，
///   原匹配器不受影响。
/// - **契约（What）**：`matches` 在批量操作所在线程上对快照中的每个 Channel 调用一次，
///   实现必须无副作用且不阻塞。
#[derive(Clone)]
pub struct ChannelMatcher {
    predicate: Arc<Predicate>,
}

impl ChannelMatcher {
    /// 以闭包构造。
    pub fn from_fn(predicate: impl Fn(&Channel) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Arc::new(predicate),
        }
    }

    /// 匹配所有 Channel。
    pub fn all() -> Self {
        Self::from_fn(|_| true)
    }

    /// 只匹配服务端 Channel。
    pub fn is_server() -> Self {
        Self::from_fn(Channel::is_server)
    }

    /// 只匹配非服务端 Channel。
    pub fn is_not_server() -> Self {
        Self::is_server().invert()
    }

    /// 只匹配给定的 Channel 实例。
    pub fn is_instance(channel: &Channel) -> Self {
        let target = channel.downgrade();
        Self::from_fn(move |candidate| {
            target
                .upgrade()
                .is_some_and(|target| target.ptr_eq(candidate))
        })
    }

    /// 匹配除给定实例之外的所有 Channel。
    pub fn is_not_instance(channel: &Channel) -> Self {
        Self::is_instance(channel).invert()
    }

    /// 取反。
    pub fn invert(self) -> Self {
        Self::from_fn(move |channel| !self.matches(channel))
    }

    /// 全部成员都匹配时才匹配；空集合匹配所有 Channel。
    pub fn compose(matchers: impl IntoIterator<Item = ChannelMatcher>) -> Self {
        let matchers: Vec<ChannelMatcher> = matchers.into_iter().collect();
        match matchers.len() {
            0 => Self::all(),
            1 => matchers.into_iter().next().unwrap_or_else(Self::all),
            _ => Self::from_fn(move |channel| matchers.iter().all(|m| m.matches(channel))),
        }
    }

    /// 判断 Channel 是否匹配。
    pub fn matches(&self, channel: &Channel) -> bool {
        (self.predicate)(channel)
    }
}

impl Default for ChannelMatcher {
    fn default() -> Self {
        Self::all()
    }
}

impl fmt::Debug for ChannelMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChannelMatcher")
    }
}
