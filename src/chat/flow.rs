//! 对话流程：一次流式模型调用，边生成边转发，结束后识别重新生成意图
//!
//! 事件顺序：Start → Chunk* → Artifact? → Done；失败时以 Error 代替 Artifact 与 Done。
//! Chunk 原样转发（包括开头的标记行），意图只在回复完整后才判定。
//! `reply` 是非流式版本：一次阻塞调用，拿到完整回复后判定意图。

use std::time::Duration;

use futures_util::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::chat::{
    detect_intent, ConversationContext, IntentDetector, RegenerateIntent, MAX_HISTORY_TURNS,
};
use crate::core::GenerationError;
use crate::llm::{GenerationRequest, ModelAdapter, SamplingParams};
use crate::stage::StageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactAction {
    Regenerate,
}

/// 对话对外事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    Start,
    Chunk {
        text: String,
    },
    /// 请求客户端重新生成某阶段
    Artifact {
        action: ArtifactAction,
        stage: StageId,
        instructions: String,
    },
    Done,
    Error {
        message: String,
    },
}

impl ChatEvent {
    pub fn regenerate(intent: RegenerateIntent) -> Self {
        Self::Artifact {
            action: ArtifactAction::Regenerate,
            stage: intent.stage,
            instructions: intent.instructions,
        }
    }
}

/// 对话参数
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSettings {
    pub params: SamplingParams,
    pub timeout: Duration,
    pub history_limit: usize,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            params: SamplingParams::default(),
            timeout: Duration::from_secs(120),
            history_limit: MAX_HISTORY_TURNS,
        }
    }
}

/// 一次对话的结果
#[derive(Debug, Clone, PartialEq)]
pub enum ChatOutcome {
    Completed {
        reply: String,
        intent: Option<RegenerateIntent>,
    },
    Failed(GenerationError),
    Cancelled,
}

/// 非流式对话的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatReply {
    pub message: String,
    pub intent: Option<RegenerateIntent>,
}

#[derive(Clone)]
pub struct ChatService {
    adapter: ModelAdapter,
    settings: ChatSettings,
}

impl ChatService {
    pub fn new(adapter: ModelAdapter, settings: ChatSettings) -> Self {
        Self { adapter, settings }
    }

    fn request(&self, ctx: ConversationContext, user_message: &str) -> GenerationRequest {
        let ctx = ctx.with_history_limit(self.settings.history_limit);
        GenerationRequest::from_messages(
            ctx.build_messages(user_message),
            self.settings.params.clone(),
            self.settings.timeout,
        )
    }

    /// 非流式对话
    pub async fn reply(
        &self,
        ctx: ConversationContext,
        user_message: &str,
    ) -> Result<ChatReply, GenerationError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("chat", run_id = %run_id, step = %ctx.current_step);
        let request = self.request(ctx, user_message);
        async move {
            tracing::info!("chat started with {} messages", request.messages.len());
            let message = self.adapter.generate(&request).await.map_err(|e| {
                tracing::warn!("chat generation failed: {}", e);
                e
            })?;
            let intent = detect_intent(&message);
            tracing::info!(
                "chat complete: {} chars, intent {:?}",
                message.chars().count(),
                intent.as_ref().map(|i| i.stage)
            );
            Ok(ChatReply { message, intent })
        }
        .instrument(span)
        .await
    }

    pub async fn run(
        &self,
        ctx: ConversationContext,
        user_message: String,
        events: mpsc::UnboundedSender<ChatEvent>,
        cancel: CancellationToken,
    ) -> ChatOutcome {
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("chat", run_id = %run_id, step = %ctx.current_step);
        self.converse(ctx, user_message, events, cancel)
            .instrument(span)
            .await
    }

    async fn converse(
        &self,
        ctx: ConversationContext,
        user_message: String,
        events: mpsc::UnboundedSender<ChatEvent>,
        cancel: CancellationToken,
    ) -> ChatOutcome {
        let request = self.request(ctx, &user_message);
        tracing::info!("chat started with {} messages", request.messages.len());
        if events.send(ChatEvent::Start).is_err() {
            return ChatOutcome::Cancelled;
        }

        let mut deltas = self.adapter.generate_stream(request);
        let mut detector = IntentDetector::new();
        let mut reply = String::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("chat cancelled after {} chars", reply.chars().count());
                    return ChatOutcome::Cancelled;
                }
                next = deltas.next() => next,
            };

            match next {
                Some(Ok(delta)) if delta.is_empty() => continue,
                Some(Ok(delta)) => {
                    detector.push(&delta);
                    reply.push_str(&delta);
                    if events.send(ChatEvent::Chunk { text: delta }).is_err() {
                        return ChatOutcome::Cancelled;
                    }
                }
                Some(Err(error)) => {
                    tracing::warn!("chat generation failed: {}", error);
                    let _ = events.send(ChatEvent::Error {
                        message: error.to_string(),
                    });
                    return ChatOutcome::Failed(error);
                }
                None => break,
            }
        }

        let intent = detector.into_intent();
        if let Some(intent) = &intent {
            tracing::info!(
                "regenerate intent for stage {}: {}",
                intent.stage,
                intent.instructions
            );
            if events.send(ChatEvent::regenerate(intent.clone())).is_err() {
                return ChatOutcome::Cancelled;
            }
        }
        if events.send(ChatEvent::Done).is_err() {
            return ChatOutcome::Cancelled;
        }
        tracing::info!("chat complete: {} chars", reply.chars().count());
        ChatOutcome::Completed { reply, intent }
    }

    /// 以事件流形式执行
    pub fn stream(
        &self,
        ctx: ConversationContext,
        user_message: String,
        cancel: CancellationToken,
    ) -> impl Stream<Item = ChatEvent> + Send + 'static {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = self.clone();
        tokio::spawn(async move {
            service.run(ctx, user_message, tx, cancel).await;
        });
        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|ev| (ev, rx)) })
    }
}
