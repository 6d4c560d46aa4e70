//! 课程设计对话
//!
//! - **context**: 组装对话提示词（人设、课程信息、阶段文档、最近历史）
//! - **intent**: 回复开头的重新生成标记识别
//! - **flow**: 流式对话与事件（Start / Chunk / Artifact / Done / Error）

pub mod context;
pub mod flow;
pub mod intent;

pub use context::{ChatTurn, ConversationContext, TurnRole, MAX_HISTORY_TURNS};
pub use flow::{ArtifactAction, ChatEvent, ChatOutcome, ChatReply, ChatService, ChatSettings};
pub use intent::{detect_intent, parse_marker, IntentDetector, MarkerError, RegenerateIntent};
