//! 三阶段课程设计流水线
//!
//! 按请求的阶段集合依次驱动阶段生成器，把流式输出转换为有序事件（Start / Progress / StageComplete / Error / Complete）；
//! 也可非流式执行，直接返回全部文档。

pub mod controller;
pub mod types;

pub use controller::{
    GeneratedCourse, PipelineController, PipelineOutcome, PipelineSettings, PipelineState, PlannedStep, RunPlan,
    StepAction,
};
pub use types::{PipelineEvent, PipelineRequest, PipelineSummary, StageSummary};
