//! Ollama chat protocol.
//!
//! Local server, no auth, JSON-lines streaming: one response object per
//! `\n`-terminated line with a `done` flag on the terminal one.

mod provider;
mod stream;
mod types;

pub use provider::OllamaModel;
