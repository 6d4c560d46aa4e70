//! 阶段生成器：三个 UbD 阶段（确定预期学习结果 / 确定可接受的证据 / 规划学习体验）
//!
//! 每个阶段产出一份 Markdown 文档，作为后续阶段的上下文。上游文档按原文拼入提示词，不做结构解析。

pub mod generator;
pub mod progress;
pub mod prompts;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use generator::{StageGenerator, StageSettings, StageStream, StageUpdate};
pub use progress::estimate_progress;

/// 阶段编号；线上格式为整数 1..=3
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum StageId {
    /// 阶段一：确定预期学习结果
    Foundation = 1,
    /// 阶段二：确定可接受的证据
    Evidence = 2,
    /// 阶段三：规划学习体验
    Blueprint = 3,
}

impl StageId {
    pub const ALL: [StageId; 3] = [StageId::Foundation, StageId::Evidence, StageId::Blueprint];

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            1 => Some(Self::Foundation),
            2 => Some(Self::Evidence),
            3 => Some(Self::Blueprint),
            _ => None,
        }
    }

    /// 本阶段生成前必须可用的上游阶段
    pub fn prerequisites(self) -> &'static [StageId] {
        match self {
            Self::Foundation => &[],
            Self::Evidence => &[Self::Foundation],
            Self::Blueprint => &[Self::Foundation, Self::Evidence],
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Self::Foundation => "阶段一：确定预期学习结果",
            Self::Evidence => "阶段二：确定可接受的证据",
            Self::Blueprint => "阶段三：规划学习体验",
        }
    }
}

impl TryFrom<u8> for StageId {
    type Error = String;

    fn try_from(index: u8) -> Result<Self, Self::Error> {
        Self::from_index(index).ok_or_else(|| format!("invalid stage index {}, expected 1..=3", index))
    }
}

impl From<StageId> for u8 {
    fn from(stage: StageId) -> Self {
        stage.index()
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index())
    }
}

/// 课程元信息（自由文本）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseInfo {
    pub title: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub grade_level: Option<String>,
    /// 课程时长描述，如「12 周，每周 2 课时」
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl CourseInfo {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }
}

/// 一份阶段文档：不可变，修改即产生带新版本号的新文档
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDocument {
    pub stage: StageId,
    pub content: String,
    pub version: DateTime<Utc>,
}

impl StageDocument {
    pub fn new(stage: StageId, content: impl Into<String>) -> Self {
        Self {
            stage,
            content: content.into(),
            version: Utc::now(),
        }
    }

    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }
}

/// 编辑指令：追加到生成上下文，而非替换课程描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditDirective {
    pub instructions: String,
    /// 被修改阶段此前已接受的版本，作为「其余内容保持不变」的基准
    pub current_document: Option<String>,
}

/// 单个阶段的生成上下文
#[derive(Debug, Clone, Default)]
pub struct StageContext {
    pub course: CourseInfo,
    pub upstream: BTreeMap<StageId, StageDocument>,
    pub edit: Option<EditDirective>,
}

impl StageContext {
    pub fn new(course: CourseInfo) -> Self {
        Self {
            course,
            ..Self::default()
        }
    }

    pub fn with_upstream(mut self, doc: StageDocument) -> Self {
        self.upstream.insert(doc.stage, doc);
        self
    }

    pub fn with_edit(mut self, edit: EditDirective) -> Self {
        self.edit = Some(edit);
        self
    }
}
