//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `COURSEGEN__*` 覆盖（双下划线表示嵌套，如 `COURSEGEN__LLM__PROVIDER=mock`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::chat::{ChatSettings, MAX_HISTORY_TURNS};
use crate::llm::SamplingParams;
use crate::pipeline::PipelineSettings;
use crate::stage::{StageId, StageSettings};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub server: ServerSection,
    pub llm: LlmSection,
    pub pipeline: PipelineSection,
    pub chat: ChatSection,
    pub storage: StorageSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [server] 段：HTTP 监听地址
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    48097
}

/// [llm] 段：后端选择与默认采样参数
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / deepseek / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// 未设置时读取 OPENAI_API_KEY / DEEPSEEK_API_KEY
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            base_url: None,
            api_key: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4000
}

/// [pipeline.foundation] / [pipeline.evidence] / [pipeline.blueprint]：未设置的字段使用各阶段默认值
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StageSection {
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub expected_chars: Option<usize>,
}

impl StageSection {
    fn settings(&self, stage: StageId, llm: &LlmSection) -> StageSettings {
        let defaults = StageSettings::defaults_for(stage);
        StageSettings {
            params: SamplingParams {
                model: self.model.clone().or_else(|| llm.model.clone()),
                temperature: llm.temperature,
                max_tokens: self.max_tokens.unwrap_or(defaults.params.max_tokens),
            },
            timeout: self
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            expected_chars: self.expected_chars.unwrap_or(defaults.expected_chars),
        }
    }
}

/// [pipeline] 段
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PipelineSection {
    pub foundation: StageSection,
    pub evidence: StageSection,
    pub blueprint: StageSection,
    /// 文档每增长多少字符发一次 Progress（0 = 每个增量都发）
    pub progress_step_chars: usize,
}

/// [chat] 段
#[derive(Debug, Clone, Deserialize)]
pub struct ChatSection {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    #[serde(default = "default_chat_timeout_secs")]
    pub timeout_secs: u64,
    /// 历史条数上限，只能调低
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for ChatSection {
    fn default() -> Self {
        Self {
            model: None,
            temperature: None,
            max_tokens: None,
            timeout_secs: default_chat_timeout_secs(),
            history_limit: default_history_limit(),
        }
    }
}

fn default_chat_timeout_secs() -> u64 {
    120
}

fn default_history_limit() -> usize {
    MAX_HISTORY_TURNS
}

/// [storage] 段：memory / sqlite
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_storage_backend")]
    pub backend: String,
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            path: default_storage_path(),
        }
    }
}

fn default_storage_backend() -> String {
    "memory".to_string()
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("data/coursegen.db")
}

impl AppConfig {
    pub fn pipeline_settings(&self) -> PipelineSettings {
        let p = &self.pipeline;
        PipelineSettings {
            foundation: p.foundation.settings(StageId::Foundation, &self.llm),
            evidence: p.evidence.settings(StageId::Evidence, &self.llm),
            blueprint: p.blueprint.settings(StageId::Blueprint, &self.llm),
            progress_step_chars: p.progress_step_chars,
        }
    }

    pub fn chat_settings(&self) -> ChatSettings {
        let c = &self.chat;
        ChatSettings {
            params: SamplingParams {
                model: c.model.clone().or_else(|| self.llm.model.clone()),
                temperature: c.temperature.unwrap_or(self.llm.temperature),
                max_tokens: c.max_tokens.unwrap_or(self.llm.max_tokens),
            },
            timeout: Duration::from_secs(c.timeout_secs),
            history_limit: c.history_limit.min(MAX_HISTORY_TURNS),
        }
    }
}

/// 从 config 目录加载配置，环境变量 COURSEGEN__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 COURSEGEN__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("COURSEGEN")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
