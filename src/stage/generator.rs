//! 单个阶段的生成器：阻塞式 run 与流式 run_stream
//!
//! run_stream 产出不断增长的文档快照与进度估计，最后以 Finished(StageDocument) 或错误项结束。

use std::pin::Pin;
use std::time::Duration;

use futures_util::{future, stream, Stream, StreamExt};

use crate::core::GenerationError;
use crate::llm::{DeltaStream, GenerationRequest, ModelAdapter, SamplingParams};
use crate::stage::{estimate_progress, prompts, StageContext, StageDocument, StageId};

/// 流式生成中的一次更新
#[derive(Debug, Clone, PartialEq)]
pub enum StageUpdate {
    /// 截至目前的完整文档与进度估计（< 1.0）
    Partial { text: String, fraction: f32 },
    /// 生成完成
    Finished(StageDocument),
}

pub type StageStream = Pin<Box<dyn Stream<Item = Result<StageUpdate, GenerationError>> + Send>>;

/// 阶段生成参数
#[derive(Debug, Clone, PartialEq)]
pub struct StageSettings {
    pub params: SamplingParams,
    /// 单次模型调用的超时
    pub timeout: Duration,
    /// 进度估计用的预期文档长度（字符）
    pub expected_chars: usize,
}

impl StageSettings {
    pub fn defaults_for(stage: StageId) -> Self {
        let (max_tokens, timeout_secs, expected_chars) = match stage {
            StageId::Foundation => (3000, 90, 3000),
            StageId::Evidence => (3000, 120, 4000),
            StageId::Blueprint => (4000, 180, 6000),
        };
        Self {
            params: SamplingParams {
                max_tokens,
                ..SamplingParams::default()
            },
            timeout: Duration::from_secs(timeout_secs),
            expected_chars,
        }
    }
}

/// 某一阶段的生成器
#[derive(Clone)]
pub struct StageGenerator {
    stage: StageId,
    adapter: ModelAdapter,
    settings: StageSettings,
}

struct StreamProgress {
    deltas: DeltaStream,
    text: String,
    chars: usize,
}

impl StageGenerator {
    pub fn new(stage: StageId, adapter: ModelAdapter, settings: StageSettings) -> Self {
        Self {
            stage,
            adapter,
            settings,
        }
    }

    fn request(&self, ctx: &StageContext) -> Result<GenerationRequest, GenerationError> {
        let prompt = prompts::build_user_prompt(self.stage, ctx)?;
        Ok(GenerationRequest::prompt(
            Some(prompts::system_prompt(self.stage)),
            prompt,
            self.settings.params.clone(),
            self.settings.timeout,
        ))
    }

    /// 一次性生成完整文档
    pub async fn run(&self, ctx: &StageContext) -> Result<StageDocument, GenerationError> {
        let request = self.request(ctx)?;
        let text = self.adapter.generate(&request).await?;
        finalize(self.stage, text)
    }

    /// 流式生成；每个非空增量产出一次 Partial，最后一项为 Finished 或错误
    pub fn run_stream(&self, ctx: &StageContext) -> StageStream {
        let request = match self.request(ctx) {
            Ok(request) => request,
            Err(e) => return Box::pin(stream::once(future::ready(Err(e)))),
        };

        let stage = self.stage;
        let expected = self.settings.expected_chars;
        let initial = Some(StreamProgress {
            deltas: self.adapter.generate_stream(request),
            text: String::new(),
            chars: 0,
        });

        Box::pin(stream::unfold(initial, move |state| async move {
            let mut progress = state?;
            loop {
                match progress.deltas.next().await {
                    Some(Ok(delta)) if delta.is_empty() => continue,
                    Some(Ok(delta)) => {
                        progress.chars += delta.chars().count();
                        progress.text.push_str(&delta);
                        let update = StageUpdate::Partial {
                            text: progress.text.clone(),
                            fraction: estimate_progress(progress.chars, expected),
                        };
                        return Some((Ok(update), Some(progress)));
                    }
                    Some(Err(e)) => return Some((Err(e), None)),
                    None => {
                        let result = finalize(stage, progress.text).map(StageUpdate::Finished);
                        return Some((result, None));
                    }
                }
            }
        }))
    }
}

fn finalize(stage: StageId, text: String) -> Result<StageDocument, GenerationError> {
    if text.trim().is_empty() {
        return Err(GenerationError::backend("empty response"));
    }
    Ok(StageDocument::new(stage, text))
}
