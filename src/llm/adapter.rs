//! 模型流适配层
//!
//! 在 LlmClient 之上给每次调用加一个截止时间：从调用开始计时，到截止时仍未收到终止信号则以 Timeout 结束。
//! 流式版本是惰性的，首次 poll 时才发起请求；丢弃流即释放计时器与后端连接。

use std::sync::Arc;
use std::time::Duration;

use futures_util::{stream, StreamExt};
use tokio::time::{timeout, timeout_at, Instant};

use crate::core::GenerationError;
use crate::llm::{DeltaStream, LlmClient, Message, SamplingParams};

/// 一次模型调用的完整输入
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub messages: Vec<Message>,
    pub params: SamplingParams,
    pub timeout: Duration,
}

impl GenerationRequest {
    /// 单轮调用：可选 system prompt + 一条 user prompt
    pub fn prompt(
        system_prompt: Option<&str>,
        prompt: impl Into<String>,
        params: SamplingParams,
        timeout: Duration,
    ) -> Self {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system_prompt {
            messages.push(Message::system(system));
        }
        messages.push(Message::user(prompt));
        Self {
            messages,
            params,
            timeout,
        }
    }

    /// 多轮调用（对话流）
    pub fn from_messages(messages: Vec<Message>, params: SamplingParams, timeout: Duration) -> Self {
        Self {
            messages,
            params,
            timeout,
        }
    }
}

/// 显式构造、依赖注入的后端适配器（可廉价 clone）
#[derive(Clone)]
pub struct ModelAdapter {
    client: Arc<dyn LlmClient>,
}

enum StreamState {
    Connecting {
        client: Arc<dyn LlmClient>,
        request: GenerationRequest,
    },
    Streaming {
        inner: DeltaStream,
        deadline: Instant,
        limit: Duration,
    },
    Done,
}

impl ModelAdapter {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }

    /// 阻塞式生成完整文本
    pub async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        timeout(
            request.timeout,
            self.client.complete(&request.messages, &request.params),
        )
        .await
        .map_err(|_| GenerationError::Timeout(request.timeout))?
    }

    /// 流式生成增量文本；出现 Timeout / Backend 错误项后流结束
    pub fn generate_stream(&self, request: GenerationRequest) -> DeltaStream {
        let initial = StreamState::Connecting {
            client: Arc::clone(&self.client),
            request,
        };

        Box::pin(stream::unfold(initial, |state| async move {
            match state {
                StreamState::Done => None,
                StreamState::Connecting { client, request } => {
                    let limit = request.timeout;
                    let deadline = Instant::now() + limit;
                    let connected = timeout_at(
                        deadline,
                        client.complete_stream(&request.messages, &request.params),
                    )
                    .await;
                    match connected {
                        Err(_) => Some((Err(GenerationError::Timeout(limit)), StreamState::Done)),
                        Ok(Err(e)) => Some((Err(e), StreamState::Done)),
                        Ok(Ok(inner)) => next_delta(inner, deadline, limit).await,
                    }
                }
                StreamState::Streaming {
                    inner,
                    deadline,
                    limit,
                } => next_delta(inner, deadline, limit).await,
            }
        }))
    }
}

async fn next_delta(
    mut inner: DeltaStream,
    deadline: Instant,
    limit: Duration,
) -> Option<(Result<String, GenerationError>, StreamState)> {
    match timeout_at(deadline, inner.next()).await {
        Err(_) => Some((Err(GenerationError::Timeout(limit)), StreamState::Done)),
        Ok(None) => None,
        Ok(Some(Ok(delta))) => Some((
            Ok(delta),
            StreamState::Streaming {
                inner,
                deadline,
                limit,
            },
        )),
        Ok(Some(Err(e))) => Some((Err(e), StreamState::Done)),
    }
}
