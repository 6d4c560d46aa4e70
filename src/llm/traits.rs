//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 LlmClient：complete（非流式）、complete_stream（流式增量文本）。
//! 超时不在这一层处理，由 ModelAdapter 统一加上截止时间。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::core::GenerationError;
use crate::llm::Message;

/// 增量文本流：有限、不可重放；出现错误项后不再产出
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String, GenerationError>> + Send>>;

/// 采样参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// 覆盖客户端默认模型
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            model: None,
            temperature: 0.7,
            max_tokens: 4000,
        }
    }
}

/// LLM 客户端 trait：非流式完成与流式完成（返回增量文本流）
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(
        &self,
        messages: &[Message],
        params: &SamplingParams,
    ) -> Result<String, GenerationError>;

    /// 流式完成；所有增量拼接后应等于 complete 的返回
    async fn complete_stream(
        &self,
        messages: &[Message],
        params: &SamplingParams,
    ) -> Result<DeltaStream, GenerationError>;
}
