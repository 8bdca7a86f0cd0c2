//! LM client abstraction.
//!
//! A unified chat-completion interface over Anthropic-compatible and
//! OpenAI-compatible providers. Clients return text plus token counts; cost
//! attribution happens in the agent loop against the pricing table.

mod client;
mod types;

pub use client::{
    backoff_delay, complete_with_retry, AnthropicClient, ClientConfig, LLMClient, OpenAIClient,
    BACKOFF_BASE, MAX_ATTEMPTS,
};
pub use types::{
    ChatMessage, ChatRole, CompletionRequest, CompletionResponse, Provider, TokenUsage,
};
