//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 DeepSeek、OpenAI、自建代理等。
//! complete_stream 走真正的 SSE 流式接口，逐个增量返回 delta.content。

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CompletionUsage, CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use futures_util::{future, StreamExt};

use crate::core::GenerationError;
use crate::llm::{DeltaStream, LlmClient, Message, Role, SamplingParams};

/// OpenAI 兼容客户端：持有 Client 与默认 model 名
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new()
                .with_api_base(url)
                .with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
        }
    }

    fn build_request(
        &self,
        messages: &[Message],
        params: &SamplingParams,
    ) -> Result<CreateChatCompletionRequest, OpenAIError> {
        let model = params.model.as_deref().unwrap_or(&self.model);
        CreateChatCompletionRequestArgs::default()
            .model(model)
            .messages(to_openai_messages(messages)?)
            .temperature(params.temperature)
            .max_completion_tokens(params.max_tokens)
            .build()
    }
}

/// 后端返回 usage 时记录一条日志（流式时通常只在最后一帧出现）
fn log_usage(model: &str, usage: &CompletionUsage) {
    tracing::debug!(
        model,
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens,
        total_tokens = usage.total_tokens,
        "token usage"
    );
}

fn to_openai_messages(
    messages: &[Message],
) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
    messages
        .iter()
        .map(|m| {
            Ok(match m.role {
                Role::System => ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone())
                        .build()?,
                ),
                Role::User => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()?,
                ),
                Role::Assistant => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.content.clone())
                        .build()?,
                ),
            })
        })
        .collect()
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(
        &self,
        messages: &[Message],
        params: &SamplingParams,
    ) -> Result<String, GenerationError> {
        let request = self
            .build_request(messages, params)
            .map_err(GenerationError::backend)?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(GenerationError::backend)?;

        if let Some(usage) = &response.usage {
            log_usage(&response.model, usage);
        }

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        Ok(content)
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
        params: &SamplingParams,
    ) -> Result<DeltaStream, GenerationError> {
        let request = self
            .build_request(messages, params)
            .map_err(GenerationError::backend)?;

        let stream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(GenerationError::backend)?;

        // 只取首个 choice 的 content 增量，空片段（角色头、finish 帧）直接丢弃
        let deltas = stream.filter_map(|item| {
            future::ready(match item {
                Ok(chunk) => {
                    if let Some(usage) = &chunk.usage {
                        log_usage(&chunk.model, usage);
                    }
                    chunk
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.delta.content)
                        .filter(|text| !text.is_empty())
                        .map(Ok)
                }
                Err(e) => Some(Err(GenerationError::backend(e))),
            })
        });

        Ok(Box::pin(deltas))
    }
}
