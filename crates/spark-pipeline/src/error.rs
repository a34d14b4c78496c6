use spark_core::{CoreError, error::codes};
use thiserror::Error;

/// Pipeline 结构性变更（增删改）的同步错误。
///
/// # 契约说明（What）
/// - 出现任一错误时，变更完全未生效：链路结构、名称表与 Handler 注册状态都保持调用前的样子；
/// - 错误同步返回给调用方，从不进入 `exception_caught` 传播路径。
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// 同名 Handler 已存在。
    #[error("duplicate handler name: {0}")]
    DuplicateName(String),
    /// 非共享 Handler 已被添加到某条 Pipeline。
    #[error("handler {0} is not sharable and was already added")]
    HandlerAlreadyAdded(String),
    /// 按名称、实例或类型未找到 Handler。
    #[error("no such handler: {0}")]
    NoSuchElement(String),
}

impl PipelineError {
    /// 对应的稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::DuplicateName(_) => codes::PIPELINE_DUPLICATE_NAME,
            PipelineError::HandlerAlreadyAdded(_) => codes::PIPELINE_HANDLER_ALREADY_ADDED,
            PipelineError::NoSuchElement(_) => codes::PIPELINE_NO_SUCH_ELEMENT,
        }
    }
}

impl From<PipelineError> for CoreError {
    fn from(err: PipelineError) -> Self {
        CoreError::new(err.code(), err.to_string())
    }
}
