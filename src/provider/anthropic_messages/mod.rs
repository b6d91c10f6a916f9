//! Anthropic Messages protocol.
//!
//! Compiles prompts into content-block request bodies (with `cache_control`
//! budgeting and extended-thinking handling), parses event-typed SSE
//! streams, and stamps request-derived beta headers through an interceptor.

mod beta;
mod provider;
mod request;
mod response;
mod stream;
mod types;

pub use beta::AnthropicBetaInterceptor;
pub use provider::AnthropicMessagesModel;
