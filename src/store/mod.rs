//! 课程存储
//!
//! 只通过显式的持久化接口写入：流水线与对话本身从不落盘。
//! 阶段文档不可变，每次保存产生一个新版本，同一课程同一阶段的版本号严格递增。
//! 课程列表按 updated_at 倒序。

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::chat::{ChatTurn, TurnRole};
use crate::core::ServiceError;
use crate::stage::{CourseInfo, StageDocument, StageId};

pub use memory::InMemoryCourseStore;
pub use sqlite::SqliteCourseStore;

/// 一条已保存的对话记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: TurnRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// 课程记录：元信息 + 各阶段最新文档 + 对话记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseRecord {
    pub id: String,
    #[serde(flatten)]
    pub course: CourseInfo,
    /// 各阶段的最新版本，按阶段排序
    pub documents: Vec<StageDocument>,
    pub messages: Vec<StoredMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CourseRecord {
    pub fn document(&self, stage: StageId) -> Option<&StageDocument> {
        self.documents.iter().find(|d| d.stage == stage)
    }
}

/// 课程元信息的部分更新：只覆盖提供了的字段
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseUpdate {
    pub title: Option<String>,
    pub subject: Option<String>,
    pub grade_level: Option<String>,
    pub duration: Option<String>,
    pub description: Option<String>,
}

impl CourseUpdate {
    pub fn apply(self, course: &mut CourseInfo) -> Result<(), ServiceError> {
        if let Some(title) = self.title {
            course.title = title;
        }
        if self.subject.is_some() {
            course.subject = self.subject;
        }
        if self.grade_level.is_some() {
            course.grade_level = self.grade_level;
        }
        if self.duration.is_some() {
            course.duration = self.duration;
        }
        if self.description.is_some() {
            course.description = self.description;
        }
        validate_course(course)
    }
}

#[async_trait]
pub trait CourseStore: Send + Sync {
    async fn create_course(&self, course: CourseInfo) -> Result<CourseRecord, ServiceError>;

    /// 按最近更新倒序分页
    async fn list_courses(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<CourseRecord>, ServiceError>;

    /// 不存在时返回 NotFound
    async fn get_course(&self, id: &str) -> Result<CourseRecord, ServiceError>;

    async fn update_course(
        &self,
        id: &str,
        update: CourseUpdate,
    ) -> Result<CourseRecord, ServiceError>;

    /// 删除课程及其全部文档与对话记录
    async fn delete_course(&self, id: &str) -> Result<(), ServiceError>;

    /// 保存某阶段的新版本文档（版本号取当前时间，且严格大于上一版本）
    async fn save_stage_document(
        &self,
        id: &str,
        stage: StageId,
        content: String,
    ) -> Result<StageDocument, ServiceError>;

    async fn append_messages(
        &self,
        id: &str,
        turns: Vec<ChatTurn>,
    ) -> Result<Vec<StoredMessage>, ServiceError>;

    async fn messages(&self, id: &str) -> Result<Vec<StoredMessage>, ServiceError>;

    async fn clear_messages(&self, id: &str) -> Result<(), ServiceError>;
}

pub(crate) fn validate_course(course: &CourseInfo) -> Result<(), ServiceError> {
    if course.title.trim().is_empty() {
        return Err(ServiceError::validation("title is required"));
    }
    Ok(())
}

pub(crate) fn validate_document(content: &str) -> Result<(), ServiceError> {
    if content.trim().is_empty() {
        return Err(ServiceError::validation("document content is empty"));
    }
    Ok(())
}

/// 新版本号：当前时间，若时钟未前进则在上一版本基础上加 1 微秒
pub(crate) fn next_version(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(prev) if now <= prev => prev + Duration::microseconds(1),
        _ => now,
    }
}

pub(crate) fn course_not_found(id: &str) -> ServiceError {
    ServiceError::not_found(format!("course {}", id))
}
