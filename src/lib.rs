//! Provider-agnostic LLM client.
//!
//! One task surface — [`api::generate_text`], [`api::stream_text`],
//! [`api::generate_object`], [`api::embed`], [`api::rerank`],
//! [`api::generate_image`] plus the [`agent::ToolLoop`] — over OpenAI Chat
//! Completions, OpenAI Responses, Anthropic Messages, Google Gemini,
//! Ollama, and the compatible derivatives that reuse those wire protocols.
//!
//! Heterogeneous server events (plain SSE, event-typed SSE, JSON lines,
//! streamed JSON arrays) are normalized into one ordered sequence of
//! [`types::ChatEvent`] values, and further into uniform
//! [`stream_parts::StreamTextPart`] sequences with explicit channel
//! lifecycle markers.

pub mod agent;
pub mod api;
pub mod capability;
pub mod codec;
pub mod config;
pub mod embedding;
pub mod error;
pub mod http;
pub mod image;
pub mod middleware;
pub mod prompt;
pub mod provider;
pub mod registry;
pub mod sse;
pub mod stream_parts;
pub mod structured;
pub mod types;

pub use agent::{Tool, ToolLoop, ToolLoopOutcome};
pub use api::{
    TaskParams, embed, generate_image, generate_object, generate_text, rerank, stream_object,
    stream_text, stream_text_parts,
};
pub use capability::{Capability, CapabilitySet};
pub use config::ProviderConfig;
pub use error::{LLMError, map_http_error};
pub use prompt::{ChatMessage, ChatRole, MessageBuilder, MessagePart, Prompt};
pub use provider::{ChatCall, ChatStream, LanguageModel};
pub use registry::{ProviderRegistry, RegistryClient};
pub use stream_parts::{StreamTextPart, into_stream_parts};
pub use structured::{ObjectSpec, parse_structured_json};
pub use types::*;

/// Re-exported cancellation token used across every call and stream.
pub use tokio_util::sync::CancellationToken;
