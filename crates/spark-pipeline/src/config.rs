//! Channel 配置。
//!
//! # 设计背景（Why）
//! - 出站缓冲的水位线、每个条目的簿记开销与未知消息的估算大小共同决定可写性翻转的时机，
//!   需要集中配置并在构造时校验，而不是散落在各组件中。
//!
//! # 契约说明（What）
//! - 配置可由代码构造，也可通过 [`ChannelConfig::from_toml_str`] 从 TOML 文本加载；
//! - 缺省字段取默认值；`low > high` 的水位线在反序列化阶段即被拒绝。

use serde::Deserialize;
use spark_core::{CoreError, error::codes};
use thiserror::Error;

/// 默认低水位线（32 KiB）。
pub const DEFAULT_LOW_WATER_MARK: usize = 32 * 1024;
/// 默认高水位线（64 KiB）。
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024;
/// 每个出站条目额外计入的簿记开销（字节）。
pub const DEFAULT_OUTBOUND_ENTRY_OVERHEAD: usize = 96;
/// 非字节缓冲消息的估算大小（字节）。
pub const DEFAULT_UNKNOWN_MESSAGE_SIZE: usize = 8;

/// 配置错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 低水位线高于高水位线。
    #[error("write buffer water mark low ({low}) must not exceed high ({high})")]
    InvalidWaterMark {
        /// 低水位线。
        low: usize,
        /// 高水位线。
        high: usize,
    },
    /// TOML 文本解析失败。
    #[error("failed to parse channel config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl From<ConfigError> for CoreError {
    fn from(err: ConfigError) -> Self {
        let code = match &err {
            ConfigError::InvalidWaterMark { .. } => codes::CONFIG_INVALID_WATERMARK,
            ConfigError::Parse(_) => codes::CONFIG_PARSE,
        };
        CoreError::new(code, err.to_string()).with_cause(err)
    }
}

/// 出站缓冲的高低水位线。
///
/// # 逻辑（How）
/// - 挂起字节数 **超过** `high` 时通道变为不可写；
/// - 回落到 **低于** `low` 时恢复可写；两者之间保持原状态，形成滞回区间。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawWaterMark")]
pub struct WriteBufferWaterMark {
    low: usize,
    high: usize,
}

#[derive(Deserialize)]
struct RawWaterMark {
    low: usize,
    high: usize,
}

impl TryFrom<RawWaterMark> for WriteBufferWaterMark {
    type Error = ConfigError;

    fn try_from(raw: RawWaterMark) -> Result<Self, Self::Error> {
        Self::new(raw.low, raw.high)
    }
}

impl WriteBufferWaterMark {
    /// 构造并校验水位线。
    pub fn new(low: usize, high: usize) -> Result<Self, ConfigError> {
        if low > high {
            return Err(ConfigError::InvalidWaterMark { low, high });
        }
        Ok(Self { low, high })
    }

    /// 低水位线。
    pub fn low(&self) -> usize {
        self.low
    }

    /// 高水位线。
    pub fn high(&self) -> usize {
        self.high
    }
}

impl Default for WriteBufferWaterMark {
    fn default() -> Self {
        Self {
            low: DEFAULT_LOW_WATER_MARK,
            high: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

/// 单个 Channel 的配置快照，构造 Channel 时复制一份，运行期不可变。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// 出站缓冲水位线。
    pub write_buffer_water_mark: WriteBufferWaterMark,
    /// 每个出站条目的簿记开销。
    pub outbound_entry_overhead: usize,
    /// 非字节缓冲消息的估算大小。
    pub unknown_message_size: usize,
    /// 通道激活后是否自动请求读取。
    pub auto_read: bool,
    /// 写出失败时是否自动关闭通道。
    pub auto_close: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            write_buffer_water_mark: WriteBufferWaterMark::default(),
            outbound_entry_overhead: DEFAULT_OUTBOUND_ENTRY_OVERHEAD,
            unknown_message_size: DEFAULT_UNKNOWN_MESSAGE_SIZE,
            auto_read: true,
            auto_close: true,
        }
    }
}

impl ChannelConfig {
    /// 从 TOML 文本加载配置。
    ///
    /// ```rust
    /// use spark_pipeline::config::ChannelConfig;
    ///
    /// let config = ChannelConfig::from_toml_str(
    ///     "auto_read = false\n[write_buffer_water_mark]\nlow = 8\nhigh = 16\n",
    /// )
    /// .expect("合法配置");
    /// assert!(!config.auto_read);
    /// assert_eq!(config.write_buffer_water_mark.high(), 16);
    /// assert_eq!(config.outbound_entry_overhead, 96);
    /// ```
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// 校验组合约束；由代码拼装的配置在交给 Channel 之前应调用一次。
    pub fn validate(&self) -> Result<(), ConfigError> {
        let water_mark = self.write_buffer_water_mark;
        WriteBufferWaterMark::new(water_mark.low(), water_mark.high()).map(|_| ())
    }

    /// 替换水位线。
    pub fn with_water_mark(mut self, water_mark: WriteBufferWaterMark) -> Self {
        self.write_buffer_water_mark = water_mark;
        self
    }

    /// 替换条目簿记开销。
    pub fn with_entry_overhead(mut self, overhead: usize) -> Self {
        self.outbound_entry_overhead = overhead;
        self
    }

    /// 设置自动读取。
    pub fn with_auto_read(mut self, auto_read: bool) -> Self {
        self.auto_read = auto_read;
        self
    }

    /// 设置写失败自动关闭。
    pub fn with_auto_close(mut self, auto_close: bool) -> Self {
        self.auto_close = auto_close;
        self
    }
}
