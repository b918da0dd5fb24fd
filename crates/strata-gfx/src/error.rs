use thiserror::Error;

/// 失败发生在哪个阶段
///
/// 构建流程中每一步都会立即检查，调用方可以据此区分是 prebuild 查询、资源分配还是提交失败。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedStep {
    Query,
    Allocation,
    Submission,
    Other,
}

#[derive(Error, Debug)]
pub enum GfxError {
    #[error("failed to create buffer `{name}` ({size} bytes): {reason}")]
    BufferCreation { name: String, size: u64, reason: String },

    #[error("failed to create acceleration structure `{name}`: {reason}")]
    AccelerationCreation { name: String, reason: String },

    #[error("prebuild size query failed: {0}")]
    PrebuildQuery(String),

    #[error("queue submission `{name}` failed: {reason}")]
    Submission { name: String, reason: String },

    #[error("failed to map buffer: {0}")]
    Map(String),

    #[error("range out of bounds: offset {offset} + len {len} > size {size}")]
    OutOfRange { offset: u64, len: u64, size: u64 },

    #[error("invalid or released handle")]
    InvalidHandle,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to create pipeline `{name}`: {reason}")]
    PipelineCreation {
        name: String,
        reason: String,
        diagnostic: Option<String>,
    },

    #[error("shader identifier not found for export `{0}`")]
    ShaderIdentifierNotFound(String),

    /// 设备不支持某个必需的接口，调用方没有降级路径
    #[error("required feature not supported: {0}")]
    Unsupported(String),

    #[error("interop failure: {reason}")]
    Interop { reason: String, diagnostic: Option<String> },

    #[error("invalid config: {0}")]
    Config(String),

    #[error("device lost")]
    DeviceLost,

    #[cfg(feature = "vulkan")]
    #[error("vulkan error: {0}")]
    Vulkan(#[from] ash::vk::Result),
}

pub type GfxResult<T> = Result<T, GfxError>;

impl GfxError {
    pub fn step(&self) -> FailedStep {
        match self {
            GfxError::PrebuildQuery(_) | GfxError::Unsupported(_) => FailedStep::Query,
            GfxError::BufferCreation { .. }
            | GfxError::AccelerationCreation { .. }
            | GfxError::PipelineCreation { .. } => FailedStep::Allocation,
            GfxError::Submission { .. } | GfxError::DeviceLost => FailedStep::Submission,
            _ => FailedStep::Other,
        }
    }

    /// 序列化类失败附带的诊断信息
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            GfxError::Interop { diagnostic, .. } | GfxError::PipelineCreation { diagnostic, .. } => {
                diagnostic.as_deref()
            }
            _ => None,
        }
    }

    /// 把查询阶段之外的错误归入 prebuild 查询失败
    pub(crate) fn into_query_error(self) -> Self {
        match self {
            GfxError::PrebuildQuery(_) | GfxError::Unsupported(_) => self,
            other => GfxError::PrebuildQuery(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_classification() {
        assert_eq!(GfxError::PrebuildQuery("x".into()).step(), FailedStep::Query);
        assert_eq!(
            GfxError::BufferCreation { name: "a".into(), size: 4, reason: "oom".into() }.step(),
            FailedStep::Allocation
        );
        assert_eq!(GfxError::Submission { name: "b".into(), reason: "rejected".into() }.step(), FailedStep::Submission);
        assert_eq!(GfxError::InvalidHandle.step(), FailedStep::Other);
    }

    #[test]
    fn test_diagnostic_message() {
        let err = GfxError::Interop { reason: "import".into(), diagnostic: Some("bad handle type".into()) };
        assert_eq!(err.diagnostic(), Some("bad handle type"));
        assert_eq!(GfxError::DeviceLost.diagnostic(), None);

        let err = GfxError::PipelineCreation {
            name: "rt".into(),
            reason: "missing shader".into(),
            diagnostic: Some("MissMain0.spv: not found".into()),
        };
        assert_eq!(err.diagnostic(), Some("MissMain0.spv: not found"));
        assert_eq!(err.step(), FailedStep::Allocation);
    }

    #[test]
    fn test_into_query_error() {
        let err = GfxError::InvalidHandle.into_query_error();
        assert!(matches!(err, GfxError::PrebuildQuery(_)));
        assert_eq!(err.step(), FailedStep::Query);
    }
}
