//! 对话上下文组装
//!
//! 固定人设（含重新生成标记协议）+ 课程信息 + 当前阶段说明 + 已有阶段文档（原文）
//! + 最近至多 MAX_HISTORY_TURNS 条历史 + 本次用户消息。每次请求重新构建，不跨请求保存。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::llm::Message;
use crate::stage::{CourseInfo, StageDocument, StageId};

/// 组装提示词时最多保留的历史条数
pub const MAX_HISTORY_TURNS: usize = 20;

const PERSONA: &str = "你是一位资深的课程设计专家，精通 UbD（为理解而设计）逆向设计理论和 PBL（项目式学习）教学法。

你的角色：
- 帮助教师设计高质量的 UbD-PBL 课程
- 解释设计理由和教育学原理
- 提供具体、可操作的建议
- 对不合理的设计提出改进意见

当用户明确要求修改某个阶段的内容时，回复的第一行必须是如下标记（不要有任何前置文字）：
[REGENERATE:STAGE_<阶段编号 1-3>:<一句话的修改说明>]
标记之后再用自然语言说明你将如何修改。只是提问或讨论时不要输出该标记。";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

/// 一条历史对话
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: TurnRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }

    fn to_message(&self) -> Message {
        match self.role {
            TurnRole::User => Message::user(self.content.clone()),
            TurnRole::Assistant => Message::assistant(self.content.clone()),
        }
    }
}

/// 一次对话请求的上下文
#[derive(Debug, Clone)]
pub struct ConversationContext {
    pub course: CourseInfo,
    pub documents: BTreeMap<StageId, StageDocument>,
    pub current_step: StageId,
    pub history: Vec<ChatTurn>,
    history_limit: usize,
}

impl ConversationContext {
    pub fn new(course: CourseInfo, current_step: StageId) -> Self {
        Self {
            course,
            documents: BTreeMap::new(),
            current_step,
            history: Vec::new(),
            history_limit: MAX_HISTORY_TURNS,
        }
    }

    pub fn with_document(mut self, document: StageDocument) -> Self {
        self.documents.insert(document.stage, document);
        self
    }

    pub fn with_history(mut self, history: Vec<ChatTurn>) -> Self {
        self.history = history;
        self
    }

    /// 调低历史条数上限；不能超过 MAX_HISTORY_TURNS
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.min(MAX_HISTORY_TURNS);
        self
    }

    /// 最近的历史（超出上限时丢弃最旧的）
    pub fn recent_history(&self) -> &[ChatTurn] {
        let skip = self.history.len().saturating_sub(self.history_limit);
        &self.history[skip..]
    }

    pub fn system_prompt(&self) -> String {
        let mut out = String::from(PERSONA);
        let course = &self.course;
        let field = |v: &Option<String>| v.clone().unwrap_or_else(|| "未指定".into());

        out.push_str(&format!(
            "\n\n当前课程信息：\n- 课程名称：{}\n- 学科领域：{}\n- 年级水平：{}\n- 课程时长：{}\n- 课程简介：{}\n",
            course.title,
            field(&course.subject),
            field(&course.grade_level),
            field(&course.duration),
            field(&course.description),
        ));
        out.push_str(&format!("\n当前阶段：{}\n", self.current_step.title()));

        for doc in self.documents.values() {
            out.push_str(&format!("\n已完成的{}：\n{}\n", doc.stage.title(), doc.content));
        }

        out.push_str("\n请基于以上上下文回答用户的问题。如果用户要求修改某个部分，请给出具体的修改建议并解释理由。\n");
        out
    }

    /// 组装发给模型的完整消息列表
    pub fn build_messages(&self, user_message: &str) -> Vec<Message> {
        let history = self.recent_history();
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(Message::system(self.system_prompt()));
        messages.extend(history.iter().map(ChatTurn::to_message));
        messages.push(Message::user(user_message));
        messages
    }
}
