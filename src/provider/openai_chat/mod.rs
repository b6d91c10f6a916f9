//! OpenAI Chat Completions protocol.
//!
//! This wire format is shared by many vendor variants (DeepSeek, xAI, Groq,
//! OpenRouter, local gateways); the provider id is therefore configurable
//! and provider-option lookup honors a compatibility alias alongside it.

mod provider;
mod request;
mod response;
mod stream;
mod types;

pub use provider::OpenAiChatModel;
