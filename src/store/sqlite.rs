//! SQLite 课程存储
//!
//! 单连接 + 互斥锁；所有 rusqlite 调用都放到 spawn_blocking 中执行，不阻塞异步运行时。
//! 阶段文档保留全部历史版本，读取时取每个阶段最新的一条。

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::chat::{ChatTurn, TurnRole};
use crate::core::ServiceError;
use crate::stage::{CourseInfo, StageDocument, StageId};
use crate::store::{
    course_not_found, next_version, validate_course, validate_document, CourseRecord,
    CourseStore, CourseUpdate, StoredMessage,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS courses (
    id          TEXT PRIMARY KEY,
    title       TEXT NOT NULL,
    subject     TEXT,
    grade_level TEXT,
    duration    TEXT,
    description TEXT,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS stage_documents (
    course_id TEXT NOT NULL REFERENCES courses(id),
    stage     INTEGER NOT NULL,
    content   TEXT NOT NULL,
    version   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_stage_documents_course ON stage_documents(course_id, stage);
CREATE INDEX IF NOT EXISTS idx_courses_updated ON courses(updated_at);
CREATE TABLE IF NOT EXISTS messages (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    course_id  TEXT NOT NULL REFERENCES courses(id),
    role       TEXT NOT NULL,
    content    TEXT NOT NULL,
    created_at TEXT NOT NULL
);
";

#[derive(Clone)]
pub struct SqliteCourseStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCourseStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ServiceError> {
        let conn = Connection::open(path)?;
        Self::initialize(conn)
    }

    pub fn open_in_memory() -> Result<Self, ServiceError> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self, ServiceError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 在阻塞线程池中以独占连接执行 f
    async fn with_conn<F, T>(&self, f: F) -> Result<T, ServiceError>
    where
        F: FnOnce(&mut Connection) -> Result<T, ServiceError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| ServiceError::Storage("connection lock poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| ServiceError::Storage(format!("storage task failed: {}", e)))?
    }
}

fn role_str(role: TurnRole) -> &'static str {
    match role {
        TurnRole::User => "user",
        TurnRole::Assistant => "assistant",
    }
}

fn parse_role(role: &str) -> Result<TurnRole, ServiceError> {
    match role {
        "user" => Ok(TurnRole::User),
        "assistant" => Ok(TurnRole::Assistant),
        other => Err(ServiceError::Storage(format!("unknown message role {}", other))),
    }
}

fn ensure_course(conn: &Connection, id: &str) -> Result<(), ServiceError> {
    let exists = conn
        .query_row("SELECT 1 FROM courses WHERE id = ?1", [id], |_| Ok(()))
        .optional()?;
    exists.ok_or_else(|| course_not_found(id))
}

fn latest_documents(conn: &Connection, id: &str) -> Result<Vec<StageDocument>, ServiceError> {
    let mut documents = Vec::new();
    for stage in StageId::ALL {
        let row = conn
            .query_row(
                "SELECT content, version FROM stage_documents
                 WHERE course_id = ?1 AND stage = ?2 ORDER BY rowid DESC LIMIT 1",
                params![id, stage.index()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, DateTime<Utc>>(1)?)),
            )
            .optional()?;
        if let Some((content, version)) = row {
            documents.push(StageDocument {
                stage,
                content,
                version,
            });
        }
    }
    Ok(documents)
}

fn load_messages(conn: &Connection, id: &str) -> Result<Vec<StoredMessage>, ServiceError> {
    let mut stmt = conn.prepare(
        "SELECT role, content, created_at FROM messages WHERE course_id = ?1 ORDER BY id",
    )?;
    let rows = stmt
        .query_map([id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, DateTime<Utc>>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(role, content, created_at)| {
            Ok(StoredMessage {
                role: parse_role(&role)?,
                content,
                created_at,
            })
        })
        .collect()
}

fn load_course(conn: &Connection, id: &str) -> Result<CourseRecord, ServiceError> {
    let row = conn
        .query_row(
            "SELECT title, subject, grade_level, duration, description, created_at, updated_at
             FROM courses WHERE id = ?1",
            [id],
            |row| {
                Ok((
                    CourseInfo {
                        title: row.get(0)?,
                        subject: row.get(1)?,
                        grade_level: row.get(2)?,
                        duration: row.get(3)?,
                        description: row.get(4)?,
                    },
                    row.get::<_, DateTime<Utc>>(5)?,
                    row.get::<_, DateTime<Utc>>(6)?,
                ))
            },
        )
        .optional()?;
    let (course, created_at, updated_at) = row.ok_or_else(|| course_not_found(id))?;

    Ok(CourseRecord {
        id: id.to_string(),
        course,
        documents: latest_documents(conn, id)?,
        messages: load_messages(conn, id)?,
        created_at,
        updated_at,
    })
}

#[async_trait]
impl CourseStore for SqliteCourseStore {
    async fn create_course(&self, course: CourseInfo) -> Result<CourseRecord, ServiceError> {
        validate_course(&course)?;
        let id = uuid::Uuid::new_v4().to_string();
        self.with_conn(move |conn| {
            let now = Utc::now();
            conn.execute(
                "INSERT INTO courses (id, title, subject, grade_level, duration, description, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    id,
                    course.title,
                    course.subject,
                    course.grade_level,
                    course.duration,
                    course.description,
                    now
                ],
            )?;
            tracing::debug!("course {} created", id);
            load_course(conn, &id)
        })
        .await
    }

    async fn list_courses(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<CourseRecord>, ServiceError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM courses ORDER BY updated_at DESC, rowid DESC LIMIT ?1 OFFSET ?2",
            )?;
            let ids = stmt
                .query_map(params![limit as i64, offset as i64], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            ids.iter().map(|id| load_course(conn, id)).collect()
        })
        .await
    }

    async fn get_course(&self, id: &str) -> Result<CourseRecord, ServiceError> {
        let id = id.to_string();
        self.with_conn(move |conn| load_course(conn, &id)).await
    }

    async fn update_course(
        &self,
        id: &str,
        update: CourseUpdate,
    ) -> Result<CourseRecord, ServiceError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut course = load_course(&tx, &id)?.course;
            update.apply(&mut course)?;
            tx.execute(
                "UPDATE courses SET title = ?2, subject = ?3, grade_level = ?4, duration = ?5,
                 description = ?6, updated_at = ?7 WHERE id = ?1",
                params![
                    id,
                    course.title,
                    course.subject,
                    course.grade_level,
                    course.duration,
                    course.description,
                    Utc::now()
                ],
            )?;
            let record = load_course(&tx, &id)?;
            tx.commit()?;
            Ok(record)
        })
        .await
    }

    async fn delete_course(&self, id: &str) -> Result<(), ServiceError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            ensure_course(&tx, &id)?;
            tx.execute("DELETE FROM stage_documents WHERE course_id = ?1", [id.as_str()])?;
            tx.execute("DELETE FROM messages WHERE course_id = ?1", [id.as_str()])?;
            tx.execute("DELETE FROM courses WHERE id = ?1", [id.as_str()])?;
            tx.commit()?;
            tracing::debug!("course {} deleted", id);
            Ok(())
        })
        .await
    }

    async fn save_stage_document(
        &self,
        id: &str,
        stage: StageId,
        content: String,
    ) -> Result<StageDocument, ServiceError> {
        validate_document(&content)?;
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            ensure_course(&tx, &id)?;
            let previous: Option<DateTime<Utc>> = tx
                .query_row(
                    "SELECT version FROM stage_documents
                     WHERE course_id = ?1 AND stage = ?2 ORDER BY rowid DESC LIMIT 1",
                    params![id, stage.index()],
                    |row| row.get(0),
                )
                .optional()?;
            let document = StageDocument {
                stage,
                content,
                version: next_version(previous),
            };
            tx.execute(
                "INSERT INTO stage_documents (course_id, stage, content, version) VALUES (?1, ?2, ?3, ?4)",
                params![id, stage.index(), document.content, document.version],
            )?;
            tx.execute(
                "UPDATE courses SET updated_at = ?2 WHERE id = ?1",
                params![id, Utc::now()],
            )?;
            tx.commit()?;
            Ok(document)
        })
        .await
    }

    async fn append_messages(
        &self,
        id: &str,
        turns: Vec<ChatTurn>,
    ) -> Result<Vec<StoredMessage>, ServiceError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            ensure_course(&tx, &id)?;
            let now = Utc::now();
            let mut stored = Vec::with_capacity(turns.len());
            for turn in turns {
                tx.execute(
                    "INSERT INTO messages (course_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                    params![id, role_str(turn.role), turn.content, now],
                )?;
                stored.push(StoredMessage {
                    role: turn.role,
                    content: turn.content,
                    created_at: now,
                });
            }
            tx.execute(
                "UPDATE courses SET updated_at = ?2 WHERE id = ?1",
                params![id, now],
            )?;
            tx.commit()?;
            Ok(stored)
        })
        .await
    }

    async fn messages(&self, id: &str) -> Result<Vec<StoredMessage>, ServiceError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            ensure_course(conn, &id)?;
            load_messages(conn, &id)
        })
        .await
    }

    async fn clear_messages(&self, id: &str) -> Result<(), ServiceError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            ensure_course(&tx, &id)?;
            tx.execute("DELETE FROM messages WHERE course_id = ?1", [id.as_str()])?;
            tx.execute(
                "UPDATE courses SET updated_at = ?2 WHERE id = ?1",
                params![id, Utc::now()],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}
