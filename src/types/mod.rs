//! Shared data structures modeling chat requests, responses and stream
//! events.
//!
//! These types normalize provider-specific payloads so the rest of the crate
//! can stay agnostic of individual API differences.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declarative definition of a locally-executable tool exposed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Unique name exposed to the model.
    pub name: String,
    /// Natural-language description of the tool purpose.
    pub description: Option<String>,
    /// JSON Schema describing the input payload.
    pub parameters: Value,
    /// Anthropic `cache_control` marker. Only honored on the last tool of a
    /// request; protocols without prompt caching ignore it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<Value>,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: Some(description.into()),
            parameters,
            cache_control: None,
        }
    }

    /// Marks the tool with an ephemeral cache breakpoint.
    pub fn with_cache_ephemeral(mut self) -> Self {
        self.cache_control = Some(serde_json::json!({"type": "ephemeral"}));
        self
    }
}

/// Provider-executed tool referenced by a dotted identifier.
///
/// The id names the provider and the builtin, e.g. `openai.web_search` or
/// `anthropic.web_search`; `args` flows through to the wire unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderToolSpec {
    pub id: String,
    #[serde(default)]
    pub args: HashMap<String, Value>,
}

impl ProviderToolSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            args: HashMap::new(),
        }
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    /// Splits the dotted id into `(provider, tool)`.
    pub fn split_id(&self) -> (&str, &str) {
        self.id.split_once('.').unwrap_or(("", self.id.as_str()))
    }
}

/// Tool-choice strategies supported across providers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    /// Provider decides when to call tools.
    Auto,
    /// Provider must invoke at least one tool.
    Any,
    /// Tools are disabled for the request.
    None,
    /// Force a specific tool by name.
    Tool { name: String },
}

/// Response-formatting modes supported by providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
    /// Free-form text output.
    Text,
    /// Any syntactically valid JSON object.
    JsonObject,
    /// JSON constrained by a schema.
    JsonSchema {
        name: Option<String>,
        schema: Value,
        strict: Option<bool>,
    },
}

/// Reasoning effort presets shared by OpenAI-style providers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningEffort {
    Minimal,
    Low,
    Medium,
    High,
    Custom(String),
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &str {
        match self {
            ReasoningEffort::Minimal => "minimal",
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
            ReasoningEffort::Custom(value) => value,
        }
    }
}

/// Per-call option overlay.
///
/// Any option set here wins over the provider configuration for the duration
/// of the call. Unset fields inherit config defaults (or the provider's own).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallOptions {
    /// Model identifier override.
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub stop_sequences: Option<Vec<String>>,
    /// End-user identifier forwarded to the provider.
    pub user: Option<String>,
    pub service_tier: Option<String>,
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Call-level tools. `None` inherits defaults (middleware may inject
    /// some); `Some(vec![])` explicitly disables tools for this call.
    pub tools: Option<Vec<ToolSpec>>,
    /// Provider-executed tools referenced by dotted id.
    #[serde(default)]
    pub provider_tools: Vec<ProviderToolSpec>,
    pub tool_choice: Option<ToolChoice>,
    pub disable_parallel_tool_use: Option<bool>,
    pub response_format: Option<ResponseFormat>,
    /// Extra headers merged into the outgoing request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Request metadata forwarded under the provider's metadata field.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Per-provider deltas keyed by provider id. Recognized keys are
    /// provider-specific (`reasoning_format`, `parallel_tool_calls`,
    /// `logprobs`, ...) plus the `extra_body` / `extra_headers` escape
    /// hatches.
    #[serde(default)]
    pub provider_options: HashMap<String, Value>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = Some(choice);
        self
    }

    pub fn with_response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = Some(format);
        self
    }

    /// Stores a provider-specific delta under `provider_id`.
    pub fn with_provider_option(
        mut self,
        provider_id: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        let entry = self
            .provider_options
            .entry(provider_id.into())
            .or_insert_with(|| Value::Object(Default::default()));
        if let Value::Object(map) = entry {
            map.insert(key.into(), value.into());
        }
        self
    }

    /// Looks up the delta object for `provider_id`, falling back to `alias`
    /// so `deepseek-openai` style compatibility ids resolve both ways.
    pub fn provider_delta(&self, provider_id: &str, alias: Option<&str>) -> Option<&Value> {
        self.provider_options
            .get(provider_id)
            .or_else(|| alias.and_then(|a| self.provider_options.get(a)))
    }
}

/// Tool invocation requested by the model.
///
/// `arguments` stays a raw JSON string to preserve round-trip fidelity; use
/// [`ToolCallRequest::arguments_value`] to decode it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Model-emitted identifier; synthesized from the call index when the
    /// wire format omits it.
    pub id: Option<String>,
    pub name: String,
    pub arguments: String,
}

impl ToolCallRequest {
    pub fn new(
        id: impl Into<Option<String>>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Decodes the raw arguments into a JSON value.
    pub fn arguments_value(&self) -> Result<Value, serde_json::Error> {
        if self.arguments.trim().is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        serde_json::from_str(&self.arguments)
    }
}

/// Token usage metrics collected from the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub reasoning_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    /// Provider-specific accounting details (cache reads, etc.).
    pub details: Option<HashMap<String, Value>>,
}

impl TokenUsage {
    /// Adds another usage report into this one, summing what both sides know.
    pub fn accumulate(&mut self, other: &TokenUsage) {
        fn add(a: &mut Option<u64>, b: Option<u64>) {
            if let Some(v) = b {
                *a = Some(a.unwrap_or(0) + v);
            }
        }
        add(&mut self.prompt_tokens, other.prompt_tokens);
        add(&mut self.completion_tokens, other.completion_tokens);
        add(&mut self.reasoning_tokens, other.reasoning_tokens);
        add(&mut self.total_tokens, other.total_tokens);
    }
}

/// Why a chat response stopped generating content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    /// Anthropic long-running server tool pause; not a terminal condition
    /// for the conversation.
    PauseTurn,
    Error,
    Other(String),
}

/// Metadata about the provider invocation behind a response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseMetadata {
    /// Provider identifier such as `openai`.
    pub provider: String,
    /// Upstream request identifier.
    pub request_id: Option<String>,
    /// Server-side response id (OpenAI Responses conversation state).
    pub response_id: Option<String>,
    /// Endpoint description or URL.
    pub endpoint: Option<String>,
    /// Raw response excerpt for debugging.
    pub raw: Option<Value>,
}

/// Aggregated chat response returned by a provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Concatenated assistant text, when any was produced.
    pub text: Option<String>,
    /// Model-visible thinking surfaced on its own channel.
    pub thinking: Option<String>,
    /// Locally-executable tool invocations requested by the model.
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRequest>,
    /// Provider-executed tool blocks (web search results, MCP calls, ...),
    /// passed through unchanged.
    #[serde(default)]
    pub provider_outputs: Vec<Value>,
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<FinishReason>,
    /// Non-fatal notes collected while compiling or parsing the request.
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Effective model identifier reported by the provider.
    pub model: Option<String>,
    #[serde(default)]
    pub metadata: ResponseMetadata,
}

impl ChatResponse {
    /// Returns `true` when the model requested at least one local tool call.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Returns the text, defaulting to an empty string.
    pub fn text_or_empty(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }
}

/// Protocol-agnostic event emitted by streaming chats.
///
/// Providers translate their wire events into this sequence; the
/// [`crate::stream_parts`] adapter further lifts it into uniform stream
/// parts with explicit channel start/end markers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChatEvent {
    /// Assistant text fragment on output channel `index`.
    TextDelta { index: usize, text: String },
    /// Thinking/reasoning fragment.
    ThinkingDelta { text: String },
    /// Incremental tool-call fragment. Only the first fragment of an index
    /// carries `id` and `name`.
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments_delta: Option<String>,
    },
    /// Fully aggregated tool call for `index`.
    ToolCall { index: usize, call: ToolCallRequest },
    /// Citation payload attached to the text block at `index`.
    CitationsDelta { index: usize, citation: Value },
    /// Provider-executed content block (server tool use, MCP calls), raw.
    ProviderExecuted { block: Value },
    /// Server-side response identifier, when the protocol reports one.
    ResponseId { id: String },
    /// Usage/finish report. Non-terminal completions carry cumulative usage
    /// without ending the stream; exactly one terminal completion closes it.
    Completion {
        finish_reason: Option<FinishReason>,
        usage: Option<TokenUsage>,
        terminal: bool,
    },
}
