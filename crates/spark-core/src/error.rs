use std::{borrow::Cow, error::Error, fmt, sync::Arc};

/// 共享的底层原因类型。
///
/// 使用 `Arc` 而非 `Box`，使同一个故障可以被扇出到多个 Promise（例如关闭通道时批量失败所有挂起写入）。
pub type ErrorCause = Arc<dyn Error + Send + Sync + 'static>;

/// `CoreError` 表示传输内核跨层共享的稳定错误域，是所有可观察错误的最终形态。
///
/// # 设计背景（Why）
/// - Pipeline、出站缓冲与 ChannelGroup 在不同层次产生的故障需要合流为统一的错误码，
///   以便日志与测试能够按码值精确断言，而不是解析消息字符串。
/// - 一次失败经常需要同时交付给多个等待者（出站缓冲在关闭时按 FIFO 失败所有条目），
///   因此错误本身必须可廉价克隆。
///
/// # 逻辑解析（How）
/// - `code` 始终为 `'static` 字符串，承载稳定语义；`message` 面向排障人员；
/// - `cause` 以 [`ErrorCause`] 共享保存，`Clone` 只增加一次原子计数。
///
/// # 契约说明（What）
/// - **前置条件**：调用方应使用 [`codes`] 模块中的码值或遵循 `<域>.<语义>` 约定；
/// - **后置条件**：除非显式调用 [`with_cause`](Self::with_cause)，错误不含底层原因。
///
/// # 风险提示（Trade-offs）
/// - 结构体仅负责承载信息，不执行任何格式化或上报逻辑，日志由调用点通过 `tracing` 完成。
#[derive(Clone)]
pub struct CoreError {
    code: &'static str,
    message: Cow<'static, str>,
    cause: Option<ErrorCause>,
}

impl CoreError {
    /// 构造核心错误。
    ///
    /// # 示例（Examples）
    /// ```rust
    /// use spark_core::CoreError;
    /// use spark_core::error::codes;
    ///
    /// let err = CoreError::new(codes::CHANNEL_CLOSED, "channel closed");
    /// assert_eq!(err.code(), codes::CHANNEL_CLOSED);
    /// assert_eq!(err.message(), "channel closed");
    /// assert!(err.cause().is_none(), "初始错误默认不含底层原因");
    /// ```
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    /// 附带底层原因并返回新的核心错误。
    pub fn with_cause(mut self, cause: impl Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// 附带一个已经共享的底层原因。
    pub fn with_shared_cause(mut self, cause: ErrorCause) -> Self {
        self.cause = Some(cause);
        self
    }

    /// 获取稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 获取人类可读的错误描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 获取底层原因。
    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }

    /// 判断错误码是否等于给定值。
    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }

    /// Promise 被取消时使用的标准错误。
    pub fn cancelled() -> Self {
        Self::new(codes::FUTURE_CANCELLED, "operation was cancelled")
    }

    /// 通道已关闭时使用的标准错误。
    pub fn channel_closed() -> Self {
        Self::new(codes::CHANNEL_CLOSED, "channel is closed")
    }
}

impl fmt::Debug for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreError")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("cause", &self.cause.as_ref().map(|cause| cause.to_string()))
            .finish()
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl Error for CoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| cause.as_ref() as &(dyn Error + 'static))
    }
}

/// 框架内置的稳定错误码集合。
///
/// # 命名约定
/// - 统一采用 `<域>.<语义>`，域名对应出错的子系统（`buffer`、`future`、`pipeline`……）。
/// - 码值一经发布不得修改含义；新增语义请追加新常量。
pub mod codes {
    /// 引用计数非法：对已释放缓冲执行 `retain`/`release`/读取。
    pub const BUFFER_ILLEGAL_REFCOUNT: &str = "buffer.illegal_refcount";
    /// 读取或切片越过可读区域。
    pub const BUFFER_OUT_OF_BOUNDS: &str = "buffer.out_of_bounds";

    /// Promise 被取消。
    pub const FUTURE_CANCELLED: &str = "future.cancelled";
    /// Promise 在截止时间前未完成。
    pub const FUTURE_TIMEOUT: &str = "future.timeout";
    /// 在 void Promise 上执行了需要真实完成状态的操作（等待、读取结果）。
    pub const FUTURE_VOID: &str = "future.void";

    /// 执行器已关闭或拒绝接收任务。
    pub const EXECUTOR_REJECTED: &str = "executor.rejected";

    /// 通道已关闭。
    pub const CHANNEL_CLOSED: &str = "channel.closed";
    /// 通道尚未注册到事件循环。
    pub const CHANNEL_NOT_REGISTERED: &str = "channel.not_registered";
    /// 通道已经注册过。
    pub const CHANNEL_ALREADY_REGISTERED: &str = "channel.already_registered";
    /// 传输层不支持的操作。
    pub const CHANNEL_UNSUPPORTED: &str = "channel.unsupported_operation";
    /// 通道尚未连接（已打开但未激活）。
    pub const CHANNEL_NOT_CONNECTED: &str = "channel.not_connected";
    /// 传输层写出失败。
    pub const CHANNEL_WRITE_FAILED: &str = "channel.write_failed";

    /// 同名 Handler 已存在。
    pub const PIPELINE_DUPLICATE_NAME: &str = "pipeline.duplicate_name";
    /// 非共享 Handler 被重复添加。
    pub const PIPELINE_HANDLER_ALREADY_ADDED: &str = "pipeline.handler_already_added";
    /// 按名称、实例或类型查找 Handler 失败。
    pub const PIPELINE_NO_SUCH_ELEMENT: &str = "pipeline.no_such_element";
    /// `handler_added` / `handler_removed` 回调失败。
    pub const PIPELINE_HANDLER_FAILED: &str = "pipeline.handler_failed";
    /// 上下文已从链路移除，事件无法继续传播。
    pub const PIPELINE_CONTEXT_REMOVED: &str = "pipeline.context_removed";

    /// 用户自定义可写性位的下标越界（合法范围 1..=31）。
    pub const OUTBOUND_INVALID_WRITABILITY_INDEX: &str = "outbound.invalid_writability_index";

    /// 水位线配置非法（`low > high`）。
    pub const CONFIG_INVALID_WATERMARK: &str = "config.invalid_watermark";
    /// 配置文本无法解析。
    pub const CONFIG_PARSE: &str = "config.parse";

    /// ChannelGroup 批量操作中存在失败的成员。
    pub const GROUP_PARTIAL_FAILURE: &str = "group.partial_failure";
}

/// 框架统一的结果类型别名。
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
