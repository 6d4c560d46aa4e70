//! LLM 层：消息类型、客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock），以及带截止时间的模型流适配器

pub mod adapter;
pub mod deepseek;
pub mod message;
pub mod mock;
pub mod openai;
pub mod traits;

pub use adapter::{GenerationRequest, ModelAdapter};
pub use deepseek::{create_deepseek_client, DEEPSEEK_BASE_URL, DEEPSEEK_CHAT};
pub use message::{Message, Role};
pub use mock::{MockLlmClient, MockReply};
pub use openai::OpenAiClient;
pub use traits::{DeltaStream, LlmClient, SamplingParams};
