//! 进程内课程存储（默认后端，重启即丢失）

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::chat::ChatTurn;
use crate::core::ServiceError;
use crate::stage::{CourseInfo, StageDocument, StageId};
use crate::store::{
    course_not_found, next_version, validate_course, validate_document, CourseRecord,
    CourseStore, CourseUpdate, StoredMessage,
};

#[derive(Debug, Default)]
pub struct InMemoryCourseStore {
    courses: RwLock<HashMap<String, CourseRecord>>,
}

impl InMemoryCourseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CourseStore for InMemoryCourseStore {
    async fn create_course(&self, course: CourseInfo) -> Result<CourseRecord, ServiceError> {
        validate_course(&course)?;
        let now = Utc::now();
        let record = CourseRecord {
            id: uuid::Uuid::new_v4().to_string(),
            course,
            documents: Vec::new(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.courses
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn list_courses(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<CourseRecord>, ServiceError> {
        let mut records: Vec<CourseRecord> = self.courses.read().await.values().cloned().collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(records.into_iter().skip(offset).take(limit).collect())
    }

    async fn get_course(&self, id: &str) -> Result<CourseRecord, ServiceError> {
        self.courses
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| course_not_found(id))
    }

    async fn update_course(
        &self,
        id: &str,
        update: CourseUpdate,
    ) -> Result<CourseRecord, ServiceError> {
        let mut courses = self.courses.write().await;
        let record = courses.get_mut(id).ok_or_else(|| course_not_found(id))?;

        let mut course = record.course.clone();
        update.apply(&mut course)?;
        record.course = course;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn delete_course(&self, id: &str) -> Result<(), ServiceError> {
        self.courses
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| course_not_found(id))
    }

    async fn save_stage_document(
        &self,
        id: &str,
        stage: StageId,
        content: String,
    ) -> Result<StageDocument, ServiceError> {
        validate_document(&content)?;
        let mut courses = self.courses.write().await;
        let record = courses.get_mut(id).ok_or_else(|| course_not_found(id))?;

        let previous = record.document(stage).map(|d| d.version);
        let document = StageDocument {
            stage,
            content,
            version: next_version(previous),
        };
        record.documents.retain(|d| d.stage != stage);
        record.documents.push(document.clone());
        record.documents.sort_by_key(|d| d.stage);
        record.updated_at = Utc::now();
        Ok(document)
    }

    async fn append_messages(
        &self,
        id: &str,
        turns: Vec<ChatTurn>,
    ) -> Result<Vec<StoredMessage>, ServiceError> {
        let mut courses = self.courses.write().await;
        let record = courses.get_mut(id).ok_or_else(|| course_not_found(id))?;

        let now = Utc::now();
        let stored: Vec<StoredMessage> = turns
            .into_iter()
            .map(|turn| StoredMessage {
                role: turn.role,
                content: turn.content,
                created_at: now,
            })
            .collect();
        record.messages.extend(stored.iter().cloned());
        record.updated_at = now;
        Ok(stored)
    }

    async fn messages(&self, id: &str) -> Result<Vec<StoredMessage>, ServiceError> {
        self.get_course(id).await.map(|record| record.messages)
    }

    async fn clear_messages(&self, id: &str) -> Result<(), ServiceError> {
        let mut courses = self.courses.write().await;
        let record = courses.get_mut(id).ok_or_else(|| course_not_found(id))?;
        record.messages.clear();
        record.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_documents_get_new_versions() {
        let store = InMemoryCourseStore::new();
        let record = store.create_course(CourseInfo::new("课程")).await.unwrap();

        let v1 = store
            .save_stage_document(&record.id, StageId::Foundation, "# 第一版".into())
            .await
            .unwrap();
        let v2 = store
            .save_stage_document(&record.id, StageId::Foundation, "# 第二版".into())
            .await
            .unwrap();
        assert!(v2.version > v1.version);

        let record = store.get_course(&record.id).await.unwrap();
        assert_eq!(record.documents.len(), 1);
        assert_eq!(record.document(StageId::Foundation), Some(&v2));
    }

    #[tokio::test]
    async fn test_missing_course_and_bad_input() {
        let store = InMemoryCourseStore::new();
        assert!(matches!(
            store.get_course("nope").await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            store.create_course(CourseInfo::new(" ")).await,
            Err(ServiceError::Validation(_))
        ));

        let record = store.create_course(CourseInfo::new("课程")).await.unwrap();
        assert!(matches!(
            store
                .save_stage_document(&record.id, StageId::Evidence, "  ".into())
                .await,
            Err(ServiceError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_messages_are_appended_in_order() {
        let store = InMemoryCourseStore::new();
        let record = store.create_course(CourseInfo::new("课程")).await.unwrap();
        store
            .append_messages(&record.id, vec![ChatTurn::user("问"), ChatTurn::assistant("答")])
            .await
            .unwrap();
        store
            .append_messages(&record.id, vec![ChatTurn::user("再问")])
            .await
            .unwrap();

        let contents: Vec<_> = store
            .messages(&record.id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["问", "答", "再问"]);
    }

    #[tokio::test]
    async fn test_list_update_delete() {
        let store = InMemoryCourseStore::new();
        let first = store.create_course(CourseInfo::new("课程一")).await.unwrap();
        let second = store.create_course(CourseInfo::new("课程二")).await.unwrap();

        // 更新后排到最前
        let updated = store
            .update_course(
                &first.id,
                CourseUpdate {
                    grade_level: Some("初二".into()),
                    ..CourseUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.course.title, "课程一");
        assert_eq!(updated.course.grade_level.as_deref(), Some("初二"));

        let ids: Vec<_> = store
            .list_courses(0, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![first.id.clone(), second.id.clone()]);
        assert_eq!(store.list_courses(1, 10).await.unwrap().len(), 1);

        // 非法更新不落盘
        assert!(store
            .update_course(
                &first.id,
                CourseUpdate {
                    title: Some(" ".into()),
                    ..CourseUpdate::default()
                },
            )
            .await
            .is_err());
        assert_eq!(store.get_course(&first.id).await.unwrap().course.title, "课程一");

        store.delete_course(&first.id).await.unwrap();
        assert!(matches!(
            store.get_course(&first.id).await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            store.delete_course(&first.id).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_clear_messages() {
        let store = InMemoryCourseStore::new();
        let record = store.create_course(CourseInfo::new("课程")).await.unwrap();
        store
            .append_messages(&record.id, vec![ChatTurn::user("问")])
            .await
            .unwrap();
        store.clear_messages(&record.id).await.unwrap();
        assert!(store.messages(&record.id).await.unwrap().is_empty());
        assert!(matches!(
            store.clear_messages("nope").await,
            Err(ServiceError::NotFound(_))
        ));
    }
}
