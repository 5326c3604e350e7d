pub mod anthropic;
mod client;
pub mod openai;
pub mod providers;
pub mod runtime;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;
pub use providers::{ChatMessage, ChatRole, LlmProvider, LlmRequest, LlmResponse, TokenUsage};
pub use runtime::{AgentRuntime, GeneratedReply};
