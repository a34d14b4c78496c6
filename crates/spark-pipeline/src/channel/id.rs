use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// 进程内唯一的 Channel 标识。
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    pub(crate) fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// 原始数值。
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// 短文本形式，用于日志。
    pub fn as_short_text(self) -> String {
        format!("{:08x}", self.0)
    }

    /// 带进程号的长文本形式。
    pub fn as_long_text(self) -> String {
        format!("{:016x}-{:08x}", self.0, std::process::id())
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", self.as_short_text())
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_short_text())
    }
}
