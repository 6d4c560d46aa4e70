//! HTTP 接口集成测试（tower oneshot，不监听端口）

#![cfg(feature = "web")]

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use coursegen::chat::{ChatEvent, ChatService, ChatSettings};
use coursegen::llm::{MockLlmClient, MockReply, ModelAdapter};
use coursegen::pipeline::{PipelineController, PipelineEvent, PipelineSettings};
use coursegen::relay::decode_frames;
use coursegen::server::{router, AppState};
use coursegen::stage::StageId;
use coursegen::store::{CourseStore, InMemoryCourseStore};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tower::ServiceExt;

fn app(client: Arc<MockLlmClient>) -> Router {
    let adapter = ModelAdapter::new(client);
    let store: Arc<dyn CourseStore> = Arc::new(InMemoryCourseStore::new());
    let state = AppState::new(
        PipelineController::new(adapter.clone(), PipelineSettings::default()),
        ChatService::new(adapter, ChatSettings::default()),
        store,
    );
    router(Arc::new(state))
}

fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_text(res: axum::response::Response) -> String {
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(res: axum::response::Response) -> Value {
    serde_json::from_str(&body_text(res).await).unwrap()
}

#[tokio::test]
async fn test_health() {
    let res = app(Arc::new(MockLlmClient::new()))
        .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_text(res).await, "OK");
}

#[tokio::test]
async fn test_generate_stream_frames() {
    let client = Arc::new(MockLlmClient::scripted([MockReply::text(
        "# 预期学习结果\n\n- U1 数据会说话",
        4,
    )]));
    let res = app(client)
        .oneshot(json_request(
            Method::POST,
            "/api/v1/generate/stream",
            json!({"title": "AI 与社区", "stages_to_run": [1]}),
        ))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let headers = res.headers();
    assert!(headers[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
    assert_eq!(headers["x-accel-buffering"], "no");

    let events: Vec<PipelineEvent> = decode_frames(&body_text(res).await).unwrap();
    assert_eq!(
        events[0],
        PipelineEvent::Start {
            stages: vec![StageId::Foundation]
        }
    );
    assert!(events.iter().any(|e| matches!(
        e,
        PipelineEvent::StageComplete { document, .. } if document == "# 预期学习结果\n\n- U1 数据会说话"
    )));
    assert!(matches!(events.last(), Some(PipelineEvent::Complete { .. })));
}

#[tokio::test]
async fn test_generate_rejects_missing_upstream_before_streaming() {
    let client = Arc::new(MockLlmClient::new());
    let res = app(client.clone())
        .oneshot(json_request(
            Method::POST,
            "/api/v1/generate/stream",
            json!({"title": "AI 与社区", "stages_to_run": [3]}),
        ))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body = body_json(res).await;
    assert!(body["detail"].as_str().unwrap().contains("stage 3"));
    assert_eq!(client.call_count(), 0);
}

#[tokio::test]
async fn test_course_lifecycle_and_chat_artifact() {
    let client = Arc::new(MockLlmClient::scripted([MockReply::text(
        "[REGENERATE:STAGE_1:把持续理解聚焦到数据隐私]\n好的，我会调整阶段一。",
        6,
    )]));
    let app = app(client.clone());

    let res = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/api/v1/courses",
            json!({"title": "AI 与社区", "grade_level": "初二"}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let course = body_json(res).await;
    let id = course["id"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(json_request(
            Method::PUT,
            &format!("/api/v1/courses/{}/stages/1", id),
            json!({"content": "## U1 数据会说话"}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_json(res).await["stage"], 1);

    let res = app
        .clone()
        .oneshot(json_request(
            Method::PUT,
            &format!("/api/v1/courses/{}/stages/4", id),
            json!({"content": "x"}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/api/v1/chat/stream",
            json!({
                "course_id": id,
                "message": "持续理解太宽泛了",
                "conversation_history": [{"role": "user", "content": "你好"}, {"role": "assistant", "content": "你好！"}]
            }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let events: Vec<ChatEvent> = decode_frames(&body_text(res).await).unwrap();
    assert_eq!(events.first(), Some(&ChatEvent::Start));
    assert!(events.contains(&ChatEvent::Artifact {
        action: coursegen::chat::ArtifactAction::Regenerate,
        stage: StageId::Foundation,
        instructions: "把持续理解聚焦到数据隐私".into(),
    }));
    assert_eq!(events.last(), Some(&ChatEvent::Done));

    // 对话上下文来自存储中的阶段文档
    let requests = client.requests();
    assert!(requests[0][0].content.contains("## U1 数据会说话"));
    assert_eq!(requests[0].len(), 4);

    let res = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            &format!("/api/v1/courses/{}/messages", id),
            json!({"messages": [{"role": "user", "content": "持续理解太宽泛了"}]}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app
        .clone()
        .oneshot(
            Request::get(format!("/api/v1/courses/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let record = body_json(res).await;
    assert_eq!(record["title"], "AI 与社区");
    assert_eq!(record["documents"][0]["content"], "## U1 数据会说话");
    assert_eq!(record["messages"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_chat_rejections() {
    let app = app(Arc::new(MockLlmClient::new()));

    let res = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/api/v1/chat/stream",
            json!({"course_id": "missing", "message": "你好"}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/api/v1/chat/stream",
            json!({"course_id": "missing", "message": "   "}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = app
        .oneshot(json_request(
            Method::POST,
            "/api/v1/chat/stream",
            json!({"course_id": "missing", "message": "你好", "current_step": 5}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_disconnect_stops_generation() {
    let client = Arc::new(MockLlmClient::scripted([MockReply::Stall(vec![
        "# 预期".into(),
    ])]));
    let app = app(client.clone());
    let idle_refs = Arc::strong_count(&client);

    let res = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/api/v1/generate/stream",
            json!({"title": "AI 与社区"}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let mut body = res.into_body().into_data_stream();
    let first = body.next().await.unwrap().unwrap();
    let first: Vec<PipelineEvent> = decode_frames(std::str::from_utf8(&first).unwrap()).unwrap();
    assert!(matches!(first[0], PipelineEvent::Start { .. }));
    // 后台任务持有控制器的副本
    assert!(Arc::strong_count(&client) > idle_refs);

    drop(body);

    let stopped = tokio::time::timeout(Duration::from_secs(1), async {
        while Arc::strong_count(&client) > idle_refs {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(stopped.is_ok(), "run task should exit after the client disconnects");
    assert_eq!(client.call_count(), 1);
}

#[tokio::test]
async fn test_blocking_generate() {
    let client = Arc::new(MockLlmClient::scripted([MockReply::text(
        "## 表现性任务\n- 社区调研报告",
        5,
    )]));
    let res = app(client.clone())
        .oneshot(json_request(
            Method::POST,
            "/api/v1/generate",
            json!({
                "title": "AI 与社区",
                "stages_to_run": [2],
                "stage_one_document": "## U1 数据会说话"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let body = body_json(res).await;
    let documents = body["documents"].as_array().unwrap();
    assert_eq!(documents.len(), 2);
    assert_eq!(documents[1]["stage"], 2);
    assert_eq!(documents[1]["content"], "## 表现性任务\n- 社区调研报告");
    assert_eq!(body["summary"]["generated"][0]["stage"], 2);
    assert_eq!(client.call_count(), 1);
}

#[tokio::test]
async fn test_blocking_generate_failure_names_stage() {
    let client = Arc::new(MockLlmClient::scripted([MockReply::Fail(
        "quota exceeded".into(),
    )]));
    let res = app(client)
        .oneshot(json_request(
            Method::POST,
            "/api/v1/generate",
            json!({"title": "AI 与社区", "stages_to_run": [1]}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let detail = body_json(res).await["detail"].as_str().unwrap().to_string();
    assert!(detail.starts_with(StageId::Foundation.title()));
    assert!(detail.contains("quota exceeded"));
}

#[tokio::test]
async fn test_blocking_chat_returns_reply_and_artifact() {
    let reply = "[REGENERATE:STAGE_2:量规增加合作维度]\n好的，我会调整评估量规。";
    let client = Arc::new(MockLlmClient::scripted([
        MockReply::text(reply, 4),
        MockReply::text("持续理解应该是可迁移的大概念。", 4),
    ]));
    let app = app(client.clone());

    let res = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/api/v1/courses",
            json!({"title": "AI 与社区"}),
        ))
        .await
        .unwrap();
    let id = body_json(res).await["id"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/api/v1/chat",
            json!({"course_id": id, "message": "量规缺少合作维度", "current_step": 2}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    assert_eq!(body["message"], reply);
    assert_eq!(body["course_id"], id.as_str());
    assert_eq!(body["current_step"], 2);
    assert_eq!(
        body["artifact"],
        json!({"type": "artifact", "action": "regenerate", "stage": 2, "instructions": "量规增加合作维度"})
    );

    let res = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/api/v1/chat",
            json!({"course_id": id, "message": "什么是持续理解？"}),
        ))
        .await
        .unwrap();
    let body = body_json(res).await;
    assert_eq!(body["current_step"], 1);
    assert!(body["artifact"].is_null());

    let res = app
        .oneshot(json_request(
            Method::POST,
            "/api/v1/chat",
            json!({"course_id": "missing", "message": "你好"}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(client.call_count(), 2);
}

#[tokio::test]
async fn test_course_list_update_delete_and_clear_messages() {
    let app = app(Arc::new(MockLlmClient::new()));

    let mut ids = Vec::new();
    for title in ["课程一", "课程二"] {
        let res = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/v1/courses",
                json!({"title": title}),
            ))
            .await
            .unwrap();
        ids.push(body_json(res).await["id"].as_str().unwrap().to_string());
    }

    let res = app
        .clone()
        .oneshot(json_request(
            Method::PUT,
            &format!("/api/v1/courses/{}", ids[0]),
            json!({"duration": "6 周"}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    assert_eq!(body["title"], "课程一");
    assert_eq!(body["duration"], "6 周");

    let res = app
        .clone()
        .oneshot(json_request(
            Method::PUT,
            &format!("/api/v1/courses/{}", ids[0]),
            json!({"title": "  "}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = app
        .clone()
        .oneshot(
            Request::get("/api/v1/courses?limit=10")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let listed = body_json(res).await;
    let listed: Vec<&str> = listed
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["id"].as_str().unwrap())
        .collect();
    assert_eq!(listed, vec![ids[0].as_str(), ids[1].as_str()]);

    let messages_uri = format!("/api/v1/courses/{}/messages", ids[0]);
    app.clone()
        .oneshot(json_request(
            Method::POST,
            &messages_uri,
            json!({"messages": [{"role": "user", "content": "问"}]}),
        ))
        .await
        .unwrap();
    let res = app
        .clone()
        .oneshot(
            Request::delete(messages_uri.as_str())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    let res = app
        .clone()
        .oneshot(Request::get(messages_uri.as_str()).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(body_json(res).await, json!([]));

    let course_uri = format!("/api/v1/courses/{}", ids[1]);
    let res = app
        .clone()
        .oneshot(Request::delete(course_uri.as_str()).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    let res = app
        .oneshot(Request::get(course_uri.as_str()).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}
