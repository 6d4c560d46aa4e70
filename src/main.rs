//! coursegen HTTP 服务入口
//!
//! 加载配置、初始化日志，构造模型后端与课程存储并注入到流水线与对话服务，然后启动 HTTP 服务。
//! 用法：`coursegen [config.toml]`

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use coursegen::{
    chat::ChatService,
    config::{load_config, AppConfig},
    llm::{create_deepseek_client, LlmClient, MockLlmClient, ModelAdapter, OpenAiClient},
    observability,
    pipeline::PipelineController,
    server::{router, AppState},
    store::{CourseStore, InMemoryCourseStore, SqliteCourseStore},
};

const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

fn build_client(cfg: &AppConfig) -> anyhow::Result<Arc<dyn LlmClient>> {
    let llm = &cfg.llm;
    let client: Arc<dyn LlmClient> = match llm.provider.as_str() {
        "openai" => Arc::new(OpenAiClient::new(
            llm.base_url.as_deref(),
            llm.model.as_deref().unwrap_or(DEFAULT_OPENAI_MODEL),
            llm.api_key.as_deref(),
        )),
        "deepseek" => Arc::new(create_deepseek_client(
            llm.model.as_deref(),
            llm.api_key.as_deref(),
        )),
        "mock" => {
            tracing::warn!("using mock backend: replies echo the last user message");
            Arc::new(MockLlmClient::new())
        }
        other => bail!("unknown llm provider: {}", other),
    };
    Ok(client)
}

fn build_store(cfg: &AppConfig) -> anyhow::Result<Arc<dyn CourseStore>> {
    let storage = &cfg.storage;
    let store: Arc<dyn CourseStore> = match storage.backend.as_str() {
        "memory" => Arc::new(InMemoryCourseStore::new()),
        "sqlite" => {
            if let Some(parent) = storage.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            Arc::new(
                SqliteCourseStore::open(&storage.path)
                    .with_context(|| format!("Failed to open {}", storage.path.display()))?,
            )
        }
        other => bail!("unknown storage backend: {}", other),
    };
    Ok(store)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;

    let adapter = ModelAdapter::new(build_client(&cfg)?);
    let store = build_store(&cfg)?;
    let pipeline = PipelineController::new(adapter.clone(), cfg.pipeline_settings());
    let chat = ChatService::new(adapter, cfg.chat_settings());
    let app = router(Arc::new(AppState::new(pipeline, chat, store)));

    let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port)
        .parse()
        .context("Invalid server address")?;
    tracing::info!(
        "coursegen listening on http://{} (llm: {}, storage: {})",
        addr,
        cfg.llm.provider,
        cfg.storage.backend
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
