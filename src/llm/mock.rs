//! Mock LLM 客户端（用于测试与离线演示，无需 API）
//!
//! 按脚本依次返回预设回复；脚本耗尽后回显最后一条 User 消息。记录调用次数与每次收到的消息，
//! 便于断言「复用的阶段不会触发后端调用」等性质。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use futures_util::{stream, StreamExt};

use crate::core::GenerationError;
use crate::llm::{DeltaStream, LlmClient, Message, Role, SamplingParams};

/// 一次调用的预设回复
#[derive(Debug, Clone)]
pub enum MockReply {
    /// 按片段依次输出
    Chunks(Vec<String>),
    /// 建立连接时即失败
    Fail(String),
    /// 先输出若干片段，再以后端错误结束
    FailAfter(Vec<String>, String),
    /// 先输出若干片段，然后一直挂起（用于超时测试）
    Stall(Vec<String>),
}

impl MockReply {
    /// 将整段文本按字符数切成片段
    pub fn text(text: &str, chunk_chars: usize) -> Self {
        Self::Chunks(split_chars(text, chunk_chars))
    }
}

fn split_chars(text: &str, chunk_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(chunk_chars.max(1))
        .map(|c| c.iter().collect())
        .collect()
}

/// Mock 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<MockReply>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<Vec<Message>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以脚本构造：第 n 次调用返回第 n 条回复
    pub fn scripted(replies: impl IntoIterator<Item = MockReply>) -> Self {
        Self {
            script: Mutex::new(replies.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn push(&self, reply: MockReply) {
        lock(&self.script).push_back(reply);
    }

    /// complete 与 complete_stream 的总调用次数
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 每次调用收到的消息（按调用顺序）
    pub fn requests(&self) -> Vec<Vec<Message>> {
        lock(&self.requests).clone()
    }

    fn next_reply(&self, messages: &[Message]) -> MockReply {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.requests).push(messages.to_vec());
        lock(&self.script).pop_front().unwrap_or_else(|| {
            let last_user = messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.as_str())
                .unwrap_or("(no input)");
            MockReply::text(&format!("Echo from Mock: {}", last_user), 16)
        })
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(
        &self,
        messages: &[Message],
        _params: &SamplingParams,
    ) -> Result<String, GenerationError> {
        match self.next_reply(messages) {
            MockReply::Chunks(chunks) => Ok(chunks.concat()),
            MockReply::Fail(detail) | MockReply::FailAfter(_, detail) => {
                Err(GenerationError::Backend(detail))
            }
            MockReply::Stall(_) => std::future::pending().await,
        }
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
        _params: &SamplingParams,
    ) -> Result<DeltaStream, GenerationError> {
        match self.next_reply(messages) {
            MockReply::Chunks(chunks) => Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok)))),
            MockReply::Fail(detail) => Err(GenerationError::Backend(detail)),
            MockReply::FailAfter(chunks, detail) => Ok(Box::pin(
                stream::iter(chunks.into_iter().map(Ok))
                    .chain(stream::once(async move { Err(GenerationError::Backend(detail)) })),
            )),
            MockReply::Stall(chunks) => Ok(Box::pin(
                stream::iter(chunks.into_iter().map(Ok)).chain(stream::pending()),
            )),
        }
    }
}
