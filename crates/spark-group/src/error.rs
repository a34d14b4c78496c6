use std::sync::Arc;

use spark_core::{CoreError, error::codes};
use spark_pipeline::ChannelId;
use thiserror::Error;

/// 批量操作中至少一个 Channel 失败时的组合错误。
///
/// # 教案式说明
/// - **意图（Why）**：一次 `write`/`close` 会扇出到许多 Channel，调用方需要逐个知道
///   哪条连接因何失败，而不是只拿到“第一个错误”。
/// - **契约（What）**：
///   - `failures` 收录每一个失败或被取消的 `(ChannelId, CoreError)`，不保证顺序；
///   - 通过 [`From`] 转换为 `group.partial_failure` 码的 [`CoreError`]，自身作为底层原因保留，
///     可用 [`ChannelGroupError::from_core`] 取回。
/// - **风险与权衡（Trade-offs）**：失败列表按值保存，大规模广播全部失败时占用与 Channel 数成正比。
#[derive(Debug, Clone, Error)]
#[error("{} of {total} channel operations failed in group `{group}`", .failures.len())]
pub struct ChannelGroupError {
    group: Arc<str>,
    total: usize,
    failures: Vec<(ChannelId, CoreError)>,
}

impl ChannelGroupError {
    pub(crate) fn new(group: Arc<str>, total: usize, failures: Vec<(ChannelId, CoreError)>) -> Self {
        Self {
            group,
            total,
            failures,
        }
    }

    /// 所属分组名称。
    pub fn group(&self) -> &str {
        &self.group
    }

    /// 参与本次批量操作的 Channel 总数。
    pub fn total(&self) -> usize {
        self.total
    }

    /// 全部失败项。
    pub fn failures(&self) -> &[(ChannelId, CoreError)] {
        &self.failures
    }

    /// 遍历失败项。
    pub fn iter(&self) -> impl Iterator<Item = (ChannelId, &CoreError)> + '_ {
        self.failures.iter().map(|(id, cause)| (*id, cause))
    }

    /// 指定 Channel 的失败原因。
    pub fn cause_of(&self, id: ChannelId) -> Option<&CoreError> {
        self.iter()
            .find(|(failed, _)| *failed == id)
            .map(|(_, cause)| cause)
    }

    /// 从聚合 Future 的失败原因中取回组合错误。
    pub fn from_core(err: &CoreError) -> Option<&ChannelGroupError> {
        if !err.is(codes::GROUP_PARTIAL_FAILURE) {
            return None;
        }
        err.cause()
            .and_then(|cause| cause.downcast_ref::<ChannelGroupError>())
    }
}

impl<'a> IntoIterator for &'a ChannelGroupError {
    type Item = &'a (ChannelId, CoreError);
    type IntoIter = std::slice::Iter<'a, (ChannelId, CoreError)>;

    fn into_iter(self) -> Self::IntoIter {
        self.failures.iter()
    }
}

impl From<ChannelGroupError> for CoreError {
    fn from(err: ChannelGroupError) -> Self {
        CoreError::new(codes::GROUP_PARTIAL_FAILURE, err.to_string()).with_cause(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spark_pipeline::EmbeddedChannel;

    #[test]
    fn converts_into_partial_failure_and_back() {
        let channel = EmbeddedChannel::new(Vec::new()).expect("构造成功");
        let id = channel.channel().id();
        let err = ChannelGroupError::new(
            Arc::from("workers"),
            3,
            vec![(id, CoreError::channel_closed())],
        );
        assert_eq!(err.to_string(), "1 of 3 channel operations failed in group `workers`");

        let core: CoreError = err.into();
        assert_eq!(core.code(), codes::GROUP_PARTIAL_FAILURE);
        let restored = ChannelGroupError::from_core(&core).expect("底层原因保留组合错误");
        assert_eq!(restored.group(), "workers");
        assert_eq!(
            restored.cause_of(id).map(CoreError::code),
            Some(codes::CHANNEL_CLOSED)
        );
        assert!(ChannelGroupError::from_core(&CoreError::channel_closed()).is_none());
    }
}
