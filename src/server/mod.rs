//! HTTP 入口（axum）
//!
//! - POST /api/v1/generate/stream：流水线事件流（SSE）；POST /api/v1/generate：非流式，返回全部文档
//! - POST /api/v1/chat/stream：对话事件流（SSE）；POST /api/v1/chat：非流式，返回完整回复与意图
//! - /api/v1/courses/...：课程、阶段文档与对话记录的显式持久化
//!
//! 校验失败与资源不存在在开始流式输出前以 4xx + `{detail}` 返回。
//! 响应体持有取消令牌的 DropGuard：客户端断开时响应体被丢弃，后台任务随即停止消费模型输出。

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use bytes::Bytes;
use futures_util::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::chat::{ChatEvent, ChatService, ChatTurn, ConversationContext};
use crate::core::{GenerationError, ServiceError};
use crate::pipeline::{GeneratedCourse, PipelineController, PipelineRequest};
use crate::relay;
use crate::stage::{CourseInfo, StageDocument, StageId};
use crate::store::{CourseRecord, CourseStore, CourseUpdate, StoredMessage};

/// 所有请求共享的只读组件（store 自身负责同步）
pub struct AppState {
    pub pipeline: PipelineController,
    pub chat: ChatService,
    pub store: Arc<dyn CourseStore>,
}

impl AppState {
    pub fn new(
        pipeline: PipelineController,
        chat: ChatService,
        store: Arc<dyn CourseStore>,
    ) -> Self {
        Self {
            pipeline,
            chat,
            store,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/generate", post(api_generate))
        .route("/api/v1/generate/stream", post(api_generate_stream))
        .route("/api/v1/chat", post(api_chat))
        .route("/api/v1/chat/stream", post(api_chat_stream))
        .route("/api/v1/courses", get(api_course_list).post(api_course_create))
        .route(
            "/api/v1/courses/:id",
            get(api_course_get)
                .put(api_course_update)
                .delete(api_course_delete),
        )
        .route("/api/v1/courses/:id/stages/:stage", put(api_stage_save))
        .route(
            "/api/v1/courses/:id/messages",
            get(api_messages_list)
                .post(api_messages_append)
                .delete(api_messages_clear),
        )
        .route("/api/health", get(|| async { "OK" }))
        .with_state(state)
}

/// ServiceError → HTTP 响应
pub struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        Self(e)
    }
}

impl From<GenerationError> for ApiError {
    fn from(e: GenerationError) -> Self {
        Self(ServiceError::Generation(e))
    }
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Generation(_)
            | ServiceError::StageFailed { .. }
            | ServiceError::Storage(_) => {
                tracing::warn!("request failed: {}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let detail = match self.0 {
            ServiceError::Validation(msg) | ServiceError::NotFound(msg) => msg,
            other => other.to_string(),
        };
        (status, Json(ErrorBody { detail })).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;
type BoxErr = Box<dyn std::error::Error + Send + Sync>;

/// 事件流 → SSE 响应；响应体被丢弃时 guard 取消后台任务
fn sse_response<S, E>(events: S, guard: DropGuard) -> Response
where
    S: Stream<Item = E> + Send + 'static,
    E: Serialize + Send + 'static,
{
    let frames = stream::unfold((Box::pin(events), guard), |(mut events, guard)| async move {
        events
            .next()
            .await
            .map(|event| (Ok::<Bytes, BoxErr>(relay::encode(&event)), (events, guard)))
    });

    let mut res = Response::new(Body::from_stream(frames));
    let headers = res.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream; charset=utf-8"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    res
}

async fn api_generate_stream(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PipelineRequest>,
) -> ApiResult<Response> {
    let plan = state.pipeline.plan(&req)?;
    tracing::info!(
        "generate request {}: stages {:?}",
        plan.run_id,
        plan.stages_to_generate()
    );

    let cancel = CancellationToken::new();
    let events = state.pipeline.stream(plan, cancel.clone());
    Ok(sse_response(events, cancel.drop_guard()))
}

async fn api_generate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PipelineRequest>,
) -> ApiResult<Json<GeneratedCourse>> {
    let plan = state.pipeline.plan(&req)?;
    tracing::info!(
        "blocking generate request {}: stages {:?}",
        plan.run_id,
        plan.stages_to_generate()
    );
    Ok(Json(state.pipeline.generate(plan).await?))
}

fn default_step() -> u8 {
    1
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub course_id: String,
    pub message: String,
    #[serde(default = "default_step")]
    pub current_step: u8,
    /// 之前的对话（不含本次消息）
    #[serde(default)]
    pub conversation_history: Vec<ChatTurn>,
}

/// 校验对话请求并从存储中取课程与阶段文档组装上下文
async fn conversation(
    state: &AppState,
    req: ChatRequest,
) -> ApiResult<(ConversationContext, String)> {
    let message = req.message.trim().to_string();
    if message.is_empty() {
        return Err(ServiceError::validation("message is required").into());
    }
    let step = StageId::try_from(req.current_step).map_err(ServiceError::Validation)?;
    let record = state.store.get_course(&req.course_id).await?;

    let ctx = record
        .documents
        .into_iter()
        .fold(ConversationContext::new(record.course, step), |ctx, doc| {
            ctx.with_document(doc)
        })
        .with_history(req.conversation_history);
    Ok((ctx, message))
}

async fn api_chat_stream(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> ApiResult<Response> {
    let (ctx, message) = conversation(&state, req).await?;
    let cancel = CancellationToken::new();
    let events = state.chat.stream(ctx, message, cancel.clone());
    Ok(sse_response(events, cancel.drop_guard()))
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub message: String,
    pub course_id: String,
    pub current_step: u8,
    /// 回复以重新生成标记开头时与流式接口的 artifact 事件相同
    pub artifact: Option<ChatEvent>,
}

async fn api_chat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> ApiResult<Json<ChatResponse>> {
    let course_id = req.course_id.clone();
    let current_step = req.current_step;
    let (ctx, message) = conversation(&state, req).await?;
    let reply = state.chat.reply(ctx, &message).await?;
    Ok(Json(ChatResponse {
        message: reply.message,
        course_id,
        current_step,
        artifact: reply.intent.map(ChatEvent::regenerate),
    }))
}

async fn api_course_create(
    State(state): State<Arc<AppState>>,
    Json(course): Json<CourseInfo>,
) -> ApiResult<(StatusCode, Json<CourseRecord>)> {
    let record = state.store.create_course(course).await?;
    tracing::info!("course {} created", record.id);
    Ok((StatusCode::CREATED, Json(record)))
}

fn default_list_limit() -> usize {
    100
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub skip: usize,
    #[serde(default = "default_list_limit")]
    pub limit: usize,
}

async fn api_course_list(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<CourseRecord>>> {
    Ok(Json(state.store.list_courses(params.skip, params.limit).await?))
}

async fn api_course_get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<CourseRecord>> {
    Ok(Json(state.store.get_course(&id).await?))
}

async fn api_course_update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(update): Json<CourseUpdate>,
) -> ApiResult<Json<CourseRecord>> {
    let record = state.store.update_course(&id, update).await?;
    tracing::info!("course {} updated", id);
    Ok(Json(record))
}

async fn api_course_delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.store.delete_course(&id).await?;
    tracing::info!("course {} deleted", id);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct SaveStageRequest {
    pub content: String,
}

async fn api_stage_save(
    State(state): State<Arc<AppState>>,
    Path((id, stage)): Path<(String, u8)>,
    Json(req): Json<SaveStageRequest>,
) -> ApiResult<Json<StageDocument>> {
    let stage = StageId::try_from(stage).map_err(ServiceError::Validation)?;
    let document = state
        .store
        .save_stage_document(&id, stage, req.content)
        .await?;
    tracing::info!("course {} stage {} saved", id, stage);
    Ok(Json(document))
}

async fn api_messages_list(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<StoredMessage>>> {
    Ok(Json(state.store.messages(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct AppendMessagesRequest {
    pub messages: Vec<ChatTurn>,
}

async fn api_messages_append(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<AppendMessagesRequest>,
) -> ApiResult<Json<Vec<StoredMessage>>> {
    Ok(Json(state.store.append_messages(&id, req.messages).await?))
}

async fn api_messages_clear(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.store.clear_messages(&id).await?;
    tracing::info!("course {} conversation cleared", id);
    Ok(StatusCode::NO_CONTENT)
}
