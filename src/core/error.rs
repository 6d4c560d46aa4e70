//! 错误类型
//!
//! GenerationError 描述一次模型调用的失败（超时、后端故障）；ServiceError 是对外入口使用的统一错误，
//! Validation / NotFound 必须在开始流式输出前返回。

use std::time::Duration;

use thiserror::Error;

use crate::stage::StageId;

/// 模型调用失败：超时与后端传输/协议错误一视同仁地终止当前阶段，不自动重试
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("Generation timed out after {}s", .0.as_secs_f32())]
    Timeout(Duration),

    #[error("Backend error: {0}")]
    Backend(String),

    /// 上游阶段文档缺失（控制器已做校验，这里兜底）
    #[error("Missing upstream document for stage {0}")]
    MissingUpstream(StageId),
}

impl GenerationError {
    pub fn backend(detail: impl ToString) -> Self {
        Self::Backend(detail.to_string())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// 入口层错误
#[derive(Error, Debug)]
pub enum ServiceError {
    /// 请求不合法（如只请求阶段 3 却没有阶段 1/2 文档）
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    /// 非流式流水线中某阶段失败
    #[error("{}生成失败: {source}", .stage.title())]
    StageFailed {
        stage: StageId,
        source: GenerationError,
    },

    #[error("Storage error: {0}")]
    Storage(String),
}

impl ServiceError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}

impl From<rusqlite::Error> for ServiceError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}
