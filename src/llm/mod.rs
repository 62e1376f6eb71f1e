//! LLM 层：模型客户端抽象与实现（OpenAI 兼容 / DeepSeek / 脚本化）

pub mod deepseek;
pub mod mock;
pub mod openai;
pub mod traits;

pub use deepseek::{create_deepseek_client, DEEPSEEK_BASE_URL, DEEPSEEK_CHAT};
pub use mock::{RecordedRequest, ScriptedModel};
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{ModelClient, ModelReply, ToolSpec};
