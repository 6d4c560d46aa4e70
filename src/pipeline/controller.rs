//! 流水线控制器
//!
//! 每次请求一个 PipelineRun（请求级状态机 Idle → Running(stage) → Running(next) | Failed | Completed），
//! 跨请求不共享可变状态。阶段严格按顺序串行执行：后一阶段的输入就是前一阶段的输出。
//!
//! 事件保证：先发且只发一个 Start；每个实际生成的阶段若干 Progress 后恰好一个 StageComplete 或 Error；
//! Error 之后不再有事件；所有阶段成功才发 Complete。客户端断开（取消令牌或接收端被丢弃）时立即停止消费模型增量。
//!
//! `generate` 是非流式版本：按同一计划逐阶段阻塞生成，不产生事件。

use std::collections::BTreeMap;
use std::time::Instant;

use futures_util::{stream, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::core::{GenerationError, ServiceError};
use crate::llm::ModelAdapter;
use crate::pipeline::{PipelineEvent, PipelineRequest, PipelineSummary, StageSummary};
use crate::stage::{
    CourseInfo, EditDirective, StageContext, StageDocument, StageGenerator, StageId,
    StageSettings, StageUpdate,
};

/// 控制器参数
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub foundation: StageSettings,
    pub evidence: StageSettings,
    pub blueprint: StageSettings,
    /// 文档至少增长这么多字符才发下一个 Progress（0 表示每个增量都发）
    pub progress_step_chars: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            foundation: StageSettings::defaults_for(StageId::Foundation),
            evidence: StageSettings::defaults_for(StageId::Evidence),
            blueprint: StageSettings::defaults_for(StageId::Blueprint),
            progress_step_chars: 0,
        }
    }
}

/// 计划中某阶段的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    Generate,
    /// 使用调用方提供的先验文档，不调用后端
    Reuse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedStep {
    pub stage: StageId,
    pub action: StepAction,
}

/// 校验通过的执行计划
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub run_id: String,
    pub course: CourseInfo,
    pub steps: Vec<PlannedStep>,
    /// 调用方提供的全部先验文档（包括不在 stages_to_run 中、仅作上游上下文的）
    pub priors: BTreeMap<StageId, StageDocument>,
    pub edit: Option<EditDirective>,
}

impl RunPlan {
    pub fn stages_to_generate(&self) -> Vec<StageId> {
        self.steps
            .iter()
            .filter(|s| s.action == StepAction::Generate)
            .map(|s| s.stage)
            .collect()
    }
}

/// 单次运行的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running(StageId),
    Failed(StageId),
    Completed,
    Cancelled,
}

/// 单次运行的结果（供调用方决定是否持久化）
#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    Completed {
        documents: BTreeMap<StageId, StageDocument>,
        summary: PipelineSummary,
    },
    Failed {
        stage: StageId,
        error: GenerationError,
    },
    Cancelled,
}

/// 非流式执行的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedCourse {
    /// 本次可用的全部文档（先验 + 新生成），按阶段排序
    pub documents: Vec<StageDocument>,
    pub summary: PipelineSummary,
}

/// 某阶段的上下文：上游文档取自目前已有的文档
fn stage_context(
    course: &CourseInfo,
    documents: &BTreeMap<StageId, StageDocument>,
    stage: StageId,
    edit: Option<EditDirective>,
) -> StageContext {
    let upstream = stage
        .prerequisites()
        .iter()
        .filter_map(|p| documents.get(p).map(|d| (*p, d.clone())))
        .collect();
    StageContext {
        course: course.clone(),
        upstream,
        edit,
    }
}

/// 流水线控制器：持有三个阶段生成器（不可变，可廉价 clone）
#[derive(Clone)]
pub struct PipelineController {
    foundation: StageGenerator,
    evidence: StageGenerator,
    blueprint: StageGenerator,
    progress_step_chars: usize,
}

impl PipelineController {
    pub fn new(adapter: ModelAdapter, settings: PipelineSettings) -> Self {
        Self {
            foundation: StageGenerator::new(
                StageId::Foundation,
                adapter.clone(),
                settings.foundation,
            ),
            evidence: StageGenerator::new(StageId::Evidence, adapter.clone(), settings.evidence),
            blueprint: StageGenerator::new(StageId::Blueprint, adapter, settings.blueprint),
            progress_step_chars: settings.progress_step_chars,
        }
    }

    pub fn generator(&self, stage: StageId) -> &StageGenerator {
        match stage {
            StageId::Foundation => &self.foundation,
            StageId::Evidence => &self.evidence,
            StageId::Blueprint => &self.blueprint,
        }
    }

    /// 校验请求并生成执行计划；失败时不产生任何事件
    pub fn plan(&self, request: &PipelineRequest) -> Result<RunPlan, ServiceError> {
        if request.course.title.trim().is_empty() {
            return Err(ServiceError::validation("title is required"));
        }

        let mut stages = request
            .stages_to_run
            .iter()
            .map(|&index| StageId::try_from(index).map_err(ServiceError::Validation))
            .collect::<Result<Vec<_>, _>>()?;
        stages.sort();
        stages.dedup();

        let priors: BTreeMap<StageId, StageDocument> = request
            .prior_documents()
            .into_iter()
            .map(|(stage, content)| (stage, StageDocument::new(stage, content)))
            .collect();

        let mut available: Vec<StageId> = priors.keys().copied().collect();
        let mut steps = Vec::with_capacity(stages.len());
        for stage in stages {
            if let Some(missing) = stage
                .prerequisites()
                .iter()
                .find(|p| !available.contains(p))
            {
                return Err(ServiceError::Validation(format!(
                    "stage {} requires the stage {} document: generate it in this call or supply it as a prior document",
                    stage, missing
                )));
            }
            let action = if priors.contains_key(&stage) {
                StepAction::Reuse
            } else {
                StepAction::Generate
            };
            steps.push(PlannedStep { stage, action });
            if !available.contains(&stage) {
                available.push(stage);
            }
        }

        let edit = request
            .edit_instructions
            .as_deref()
            .map(str::trim)
            .filter(|i| !i.is_empty())
            .map(|instructions| EditDirective {
                instructions: instructions.to_string(),
                current_document: request
                    .current_document
                    .clone()
                    .filter(|d| !d.trim().is_empty()),
            });

        let plan = RunPlan {
            run_id: uuid::Uuid::new_v4().to_string(),
            course: request.course.clone(),
            steps,
            priors,
            edit,
        };
        if plan.edit.is_some() && plan.stages_to_generate().is_empty() {
            tracing::warn!(
                "edit instructions ignored: no stage is generated in run {}",
                plan.run_id
            );
        }
        Ok(plan)
    }

    /// 执行计划，事件依次写入 `events`
    pub async fn run(
        &self,
        plan: RunPlan,
        events: mpsc::UnboundedSender<PipelineEvent>,
        cancel: CancellationToken,
    ) -> PipelineOutcome {
        let span = tracing::info_span!("pipeline", run_id = %plan.run_id, title = %plan.course.title);
        let mut run = PipelineRun::new(self, events, cancel);
        run.execute(plan).instrument(span).await
    }

    /// 非流式执行：逐阶段调用 `StageGenerator::run`，任一阶段失败即停止
    pub async fn generate(&self, plan: RunPlan) -> Result<GeneratedCourse, ServiceError> {
        let span = tracing::info_span!("pipeline", run_id = %plan.run_id, title = %plan.course.title);
        self.generate_all(plan).instrument(span).await
    }

    async fn generate_all(&self, plan: RunPlan) -> Result<GeneratedCourse, ServiceError> {
        let started = Instant::now();
        let RunPlan {
            course,
            steps,
            priors,
            mut edit,
            ..
        } = plan;
        let mut documents = priors;
        let mut summary = PipelineSummary::default();

        tracing::info!("blocking pipeline started with {} steps", steps.len());
        for step in steps {
            let stage = step.stage;
            if step.action == StepAction::Reuse {
                summary.reused.push(stage);
                continue;
            }

            let ctx = stage_context(&course, &documents, stage, edit.take());
            let stage_started = Instant::now();
            let doc = self
                .generator(stage)
                .run(&ctx)
                .await
                .map_err(|source| {
                    tracing::warn!("stage {} failed: {}", stage, source);
                    ServiceError::StageFailed { stage, source }
                })?;
            let elapsed_ms = stage_started.elapsed().as_millis() as u64;
            tracing::info!(
                "stage {} complete: {} chars in {}ms",
                stage,
                doc.char_len(),
                elapsed_ms
            );
            summary.generated.push(StageSummary {
                stage,
                chars: doc.char_len(),
                elapsed_ms,
            });
            documents.insert(stage, doc);
        }

        summary.total_elapsed_ms = started.elapsed().as_millis() as u64;
        Ok(GeneratedCourse {
            documents: documents.into_values().collect(),
            summary,
        })
    }

    /// 以事件流形式执行（在独立任务中运行，流被丢弃后任务在下一次发送或取消时退出）
    pub fn stream(
        &self,
        plan: RunPlan,
        cancel: CancellationToken,
    ) -> impl Stream<Item = PipelineEvent> + Send + 'static {
        let (tx, rx) = mpsc::unbounded_channel();
        let controller = self.clone();
        tokio::spawn(async move {
            controller.run(plan, tx, cancel).await;
        });
        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|ev| (ev, rx)) })
    }
}

/// 一次运行的请求级状态
struct PipelineRun<'a> {
    controller: &'a PipelineController,
    events: mpsc::UnboundedSender<PipelineEvent>,
    cancel: CancellationToken,
    state: PipelineState,
    documents: BTreeMap<StageId, StageDocument>,
    summary: PipelineSummary,
}

enum StageResult {
    Done(StageDocument, u64),
    Failed(GenerationError),
    Cancelled,
}

impl<'a> PipelineRun<'a> {
    fn new(
        controller: &'a PipelineController,
        events: mpsc::UnboundedSender<PipelineEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            controller,
            events,
            cancel,
            state: PipelineState::Idle,
            documents: BTreeMap::new(),
            summary: PipelineSummary::default(),
        }
    }

    /// 发送事件；接收端已关闭视为客户端断开
    fn emit(&self, event: PipelineEvent) -> bool {
        self.events.send(event).is_ok()
    }

    fn cancelled(&mut self) -> PipelineOutcome {
        if let PipelineState::Running(stage) = self.state {
            tracing::debug!("client went away during stage {}", stage);
        }
        self.state = PipelineState::Cancelled;
        PipelineOutcome::Cancelled
    }

    async fn execute(&mut self, plan: RunPlan) -> PipelineOutcome {
        let started = Instant::now();
        let RunPlan {
            course,
            steps,
            priors,
            mut edit,
            ..
        } = plan;
        self.documents = priors;

        let stages: Vec<StageId> = steps
            .iter()
            .filter(|s| s.action == StepAction::Generate)
            .map(|s| s.stage)
            .collect();
        tracing::info!("pipeline started, generating stages {:?}", stages);
        if !self.emit(PipelineEvent::Start { stages }) {
            return self.cancelled();
        }

        for step in steps {
            let stage = step.stage;
            if step.action == StepAction::Reuse {
                tracing::info!("stage {} reused from prior document", stage);
                self.summary.reused.push(stage);
                continue;
            }

            self.state = PipelineState::Running(stage);
            // 编辑指令只给第一个实际生成的阶段
            let ctx = stage_context(&course, &self.documents, stage, edit.take());

            match self.run_stage(stage, &ctx).await {
                StageResult::Done(doc, elapsed_ms) => {
                    let chars = doc.char_len();
                    tracing::info!(
                        "stage {} complete: {} chars in {}ms",
                        stage,
                        chars,
                        elapsed_ms
                    );
                    if !self.emit(PipelineEvent::stage_complete(&doc, elapsed_ms)) {
                        return self.cancelled();
                    }
                    self.summary.generated.push(StageSummary {
                        stage,
                        chars,
                        elapsed_ms,
                    });
                    self.documents.insert(stage, doc);
                }
                StageResult::Failed(error) => {
                    tracing::warn!("stage {} failed: {}", stage, error);
                    self.state = PipelineState::Failed(stage);
                    let _ = self.emit(PipelineEvent::Error {
                        stage: Some(stage),
                        message: format!("{}生成失败: {}", stage.title(), error),
                    });
                    return PipelineOutcome::Failed { stage, error };
                }
                StageResult::Cancelled => return self.cancelled(),
            }
        }

        self.summary.total_elapsed_ms = started.elapsed().as_millis() as u64;
        self.state = PipelineState::Completed;
        tracing::info!(
            "pipeline complete in {}ms",
            self.summary.total_elapsed_ms
        );
        let summary = self.summary.clone();
        if !self.emit(PipelineEvent::Complete {
            summary: summary.clone(),
        }) {
            return self.cancelled();
        }
        PipelineOutcome::Completed {
            documents: std::mem::take(&mut self.documents),
            summary,
        }
    }

    async fn run_stage(&self, stage: StageId, ctx: &StageContext) -> StageResult {
        let started = Instant::now();
        let step = self.controller.progress_step_chars;
        let mut updates = self.controller.generator(stage).run_stream(ctx);
        let mut last_emitted_chars = 0usize;

        tracing::info!("stage {} generation started", stage);
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return StageResult::Cancelled,
                next = updates.next() => next,
            };

            match next {
                Some(Ok(StageUpdate::Partial { text, fraction })) => {
                    let chars = text.chars().count();
                    if step > 0 && chars < last_emitted_chars + step {
                        continue;
                    }
                    last_emitted_chars = chars;
                    let event = PipelineEvent::Progress {
                        stage,
                        fraction,
                        partial_document: text,
                    };
                    if !self.emit(event) {
                        return StageResult::Cancelled;
                    }
                }
                Some(Ok(StageUpdate::Finished(doc))) => {
                    return StageResult::Done(doc, started.elapsed().as_millis() as u64);
                }
                Some(Err(error)) => return StageResult::Failed(error),
                None => {
                    return StageResult::Failed(GenerationError::backend(
                        "stage stream ended without a document",
                    ))
                }
            }
        }
    }
}
