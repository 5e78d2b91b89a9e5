pub mod base;
pub mod openai;

pub use base::{LLMProvider, LLMResponse, Message, ProviderMetrics, RetryConfig, ToolCallRequest, ToolDefinition};
pub use openai::OpenAiProvider;
