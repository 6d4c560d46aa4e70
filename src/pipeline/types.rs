//! 流水线请求与事件

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stage::{CourseInfo, StageDocument, StageId};

fn default_stages() -> Vec<u8> {
    vec![1, 2, 3]
}

/// 一次流水线调用的请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRequest {
    #[serde(flatten)]
    pub course: CourseInfo,
    /// 需要执行的阶段（1..=3），缺省为全部
    #[serde(default = "default_stages")]
    pub stages_to_run: Vec<u8>,
    /// 已接受的阶段一文档；提供时跳过阶段一的生成
    #[serde(default)]
    pub stage_one_document: Option<String>,
    /// 已接受的阶段二文档；提供时跳过阶段二的生成
    #[serde(default)]
    pub stage_two_document: Option<String>,
    /// 编辑指令：只作用于本次调用中第一个实际生成的阶段
    #[serde(default)]
    pub edit_instructions: Option<String>,
    /// 被编辑阶段此前已接受的版本
    #[serde(default)]
    pub current_document: Option<String>,
}

impl PipelineRequest {
    pub fn new(course: CourseInfo) -> Self {
        Self {
            course,
            stages_to_run: default_stages(),
            stage_one_document: None,
            stage_two_document: None,
            edit_instructions: None,
            current_document: None,
        }
    }

    pub fn with_stages(mut self, stages: impl IntoIterator<Item = u8>) -> Self {
        self.stages_to_run = stages.into_iter().collect();
        self
    }

    pub fn with_prior(mut self, stage: StageId, document: impl Into<String>) -> Self {
        match stage {
            StageId::Foundation => self.stage_one_document = Some(document.into()),
            StageId::Evidence => self.stage_two_document = Some(document.into()),
            // 阶段三没有下游，不接受先验文档
            StageId::Blueprint => {}
        }
        self
    }

    pub fn with_edit(mut self, instructions: impl Into<String>) -> Self {
        self.edit_instructions = Some(instructions.into());
        self
    }

    /// 调用方提供的先验文档（空白文本视为未提供）
    pub fn prior_documents(&self) -> BTreeMap<StageId, String> {
        [
            (StageId::Foundation, &self.stage_one_document),
            (StageId::Evidence, &self.stage_two_document),
        ]
        .into_iter()
        .filter_map(|(stage, doc)| {
            doc.as_ref()
                .filter(|d| !d.trim().is_empty())
                .map(|d| (stage, d.clone()))
        })
        .collect()
    }
}

/// 单个已生成阶段的统计
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage: StageId,
    pub chars: usize,
    pub elapsed_ms: u64,
}

/// Complete 事件携带的汇总
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub generated: Vec<StageSummary>,
    /// 直接复用先验文档的阶段
    pub reused: Vec<StageId>,
    pub total_elapsed_ms: u64,
}

/// 流水线对外事件（可序列化为 JSON，经 relay 编码为 SSE 帧）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// 第一个事件，列出本次实际生成的阶段
    Start { stages: Vec<StageId> },
    /// 生成中的文档快照；fraction 为启发式估计
    Progress {
        stage: StageId,
        fraction: f32,
        partial_document: String,
    },
    /// 阶段结束，fraction 固定为 1.0
    StageComplete {
        stage: StageId,
        fraction: f32,
        document: String,
        version: DateTime<Utc>,
        elapsed_ms: u64,
    },
    /// 终止事件：之后不再有任何事件
    Error {
        stage: Option<StageId>,
        message: String,
    },
    /// 终止事件：所有请求的阶段均已完成
    Complete { summary: PipelineSummary },
}

impl PipelineEvent {
    pub fn stage_complete(doc: &StageDocument, elapsed_ms: u64) -> Self {
        Self::StageComplete {
            stage: doc.stage,
            fraction: 1.0,
            document: doc.content.clone(),
            version: doc.version,
            elapsed_ms,
        }
    }

    pub fn stage(&self) -> Option<StageId> {
        match self {
            Self::Progress { stage, .. } | Self::StageComplete { stage, .. } => Some(*stage),
            Self::Error { stage, .. } => *stage,
            Self::Start { .. } | Self::Complete { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Complete { .. })
    }
}
