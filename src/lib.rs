//! coursegen - UbD 三阶段课程方案生成服务
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）及带截止时间的流适配层
//! - **stage**: 三个阶段生成器（预期学习结果 / 评估证据 / 学习体验）
//! - **pipeline**: 阶段编排与流水线事件
//! - **relay**: 事件的 SSE 帧编码
//! - **chat**: 课程设计对话、上下文组装与重新生成意图识别
//! - **store**: 课程与阶段文档持久化（内存 / SQLite）
//! - **server**: axum HTTP 入口（feature `web`）

pub mod chat;
pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod pipeline;
pub mod relay;
#[cfg(feature = "web")]
pub mod server;
pub mod stage;
pub mod store;
