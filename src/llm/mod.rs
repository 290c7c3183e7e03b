//! LLM 补全抽象与实现
//!
//! traits 定义统一契约；gateway 维护 Provider 注册表；openai / anthropic / mock 为具体后端。

mod anthropic;
mod gateway;
mod mock;
mod openai;
mod traits;

pub use anthropic::AnthropicBackend;
pub use gateway::{CompletionGateway, LlmProvider, ProviderKind, ProviderSpec};
pub use mock::MockBackend;
pub use openai::OpenAiBackend;
pub use traits::{
    ChatMessage, CompletionBackend, CompletionOptions, CompletionResponse, Role, TokenUsage,
};
