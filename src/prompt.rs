//! Role-tagged prompt messages containing ordered typed content parts.
//!
//! Prompts are constructed by callers (or by the task API from plain
//! strings) and immutable once handed to a call. No empty-parts invariant is
//! imposed here; the protocol compilers reject messages whose serialized
//! content would be empty.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::types::ToolCallRequest;

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

/// MIME descriptor for file parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MimeType(pub String);

impl MimeType {
    pub fn new(mime: impl Into<String>) -> Self {
        Self(mime.into())
    }

    pub fn is_image(&self) -> bool {
        self.0.starts_with("image/")
    }

    pub fn is_pdf(&self) -> bool {
        self.0 == "application/pdf"
    }

    pub fn is_text(&self) -> bool {
        self.0.starts_with("text/")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Payload of a tool-result part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResultPayload {
    /// Plain text result.
    Text { text: String },
    /// Structured JSON result.
    Json { value: Value },
    /// Error message fed back so the model can self-correct.
    Error { message: String },
    /// Nested content parts (e.g. text plus an image).
    Parts { parts: Vec<MessagePart> },
}

impl ToolResultPayload {
    /// Renders the payload as the string providers expect in flat contexts.
    pub fn to_content_string(&self) -> String {
        match self {
            ToolResultPayload::Text { text } => text.clone(),
            ToolResultPayload::Json { value } => value.to_string(),
            ToolResultPayload::Error { message } => format!("[Error: {message}]"),
            ToolResultPayload::Parts { parts } => parts
                .iter()
                .filter_map(|p| match p {
                    MessagePart::Text { text, .. } => Some(text.clone()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ToolResultPayload::Error { .. })
    }
}

/// One typed content part inside a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    /// Plain text, optionally carrying per-part provider options keyed by
    /// provider id (e.g. Anthropic `cache_control`).
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        options: HashMap<String, Value>,
    },
    /// Model-visible thinking replayed into the conversation.
    Reasoning { text: String },
    /// Inline bytes plus MIME descriptor.
    InlineFile {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        mime: MimeType,
    },
    /// Remote file referenced by URL.
    UrlFile { url: String, mime: MimeType },
    /// Tool invocation previously emitted by the assistant.
    ToolCall(ToolCallRequest),
    /// Result of a tool invocation.
    ToolResult {
        call_id: String,
        payload: ToolResultPayload,
    },
}

impl MessagePart {
    /// Creates a plain text part.
    pub fn text(text: impl Into<String>) -> Self {
        MessagePart::Text {
            text: text.into(),
            options: HashMap::new(),
        }
    }

    /// Reads a provider-scoped option attached to this part.
    pub fn provider_option(&self, provider_id: &str, key: &str) -> Option<&Value> {
        match self {
            MessagePart::Text { options, .. } => options.get(provider_id)?.get(key),
            _ => None,
        }
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Role-tagged message with ordered content parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
    /// Message-level provider options keyed by provider id.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub provider_options: HashMap<String, Value>,
}

impl ChatMessage {
    pub fn new(role: ChatRole, parts: Vec<MessagePart>) -> Self {
        Self {
            role,
            parts,
            provider_options: HashMap::new(),
        }
    }

    /// Single-text-part message.
    pub fn text(role: ChatRole, text: impl Into<String>) -> Self {
        Self::new(role, vec![MessagePart::text(text)])
    }

    /// Concatenates the text parts of this message.
    pub fn joined_text(&self) -> String {
        let mut buffer = String::new();
        for part in &self.parts {
            if let MessagePart::Text { text, .. } = part {
                if !buffer.is_empty() {
                    buffer.push('\n');
                }
                buffer.push_str(text);
            }
        }
        buffer
    }
}

/// Ordered list of role-tagged messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub messages: Vec<ChatMessage>,
}

impl Prompt {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self { messages }
    }

    /// Builds a one-message prompt from plain user text.
    ///
    /// # Examples
    ///
    /// ```
    /// use tsunagi_llm::prompt::{ChatRole, Prompt};
    ///
    /// let prompt = Prompt::user("Hello");
    /// assert_eq!(prompt.messages.len(), 1);
    /// assert_eq!(prompt.messages[0].role, ChatRole::User);
    /// ```
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(vec![ChatMessage::text(ChatRole::User, text)])
    }

    /// Builds a two-message prompt: system instructions plus user text.
    pub fn with_system(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self::new(vec![
            ChatMessage::text(ChatRole::System, system),
            ChatMessage::text(ChatRole::User, user),
        ])
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// Returns `true` when any system-role message is present.
    pub fn has_system(&self) -> bool {
        self.messages
            .iter()
            .any(|m| m.role == ChatRole::System)
    }
}

impl From<&str> for Prompt {
    fn from(text: &str) -> Self {
        Prompt::user(text)
    }
}

impl From<String> for Prompt {
    fn from(text: String) -> Self {
        Prompt::user(text)
    }
}

impl From<Vec<ChatMessage>> for Prompt {
    fn from(messages: Vec<ChatMessage>) -> Self {
        Prompt::new(messages)
    }
}

/// Accretes content parts into a [`ChatMessage`].
///
/// Provider-specific per-part options are staged with methods like
/// [`MessageBuilder::cache_ephemeral`] and attached to the next emitted text
/// part.
///
/// # Examples
///
/// ```
/// use tsunagi_llm::prompt::{ChatRole, MessageBuilder};
///
/// let message = MessageBuilder::new(ChatRole::User)
///     .cache_ephemeral()
///     .text("long shared context")
///     .text("actual question")
///     .build();
/// assert_eq!(message.parts.len(), 2);
/// assert!(message.parts[0].provider_option("anthropic", "cache_control").is_some());
/// assert!(message.parts[1].provider_option("anthropic", "cache_control").is_none());
/// ```
#[derive(Debug)]
pub struct MessageBuilder {
    role: ChatRole,
    parts: Vec<MessagePart>,
    provider_options: HashMap<String, Value>,
    pending_text_options: HashMap<String, Value>,
}

impl MessageBuilder {
    pub fn new(role: ChatRole) -> Self {
        Self {
            role,
            parts: Vec::new(),
            provider_options: HashMap::new(),
            pending_text_options: HashMap::new(),
        }
    }

    /// Appends a text part, consuming any staged per-part options.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        let options = std::mem::take(&mut self.pending_text_options);
        self.parts.push(MessagePart::Text {
            text: text.into(),
            options,
        });
        self
    }

    /// Appends a reasoning part.
    pub fn reasoning(mut self, text: impl Into<String>) -> Self {
        self.parts.push(MessagePart::Reasoning { text: text.into() });
        self
    }

    /// Appends an inline file part.
    pub fn inline_file(mut self, data: Vec<u8>, mime: impl Into<String>) -> Self {
        self.parts.push(MessagePart::InlineFile {
            data,
            mime: MimeType::new(mime),
        });
        self
    }

    /// Appends a URL file part.
    pub fn url_file(mut self, url: impl Into<String>, mime: impl Into<String>) -> Self {
        self.parts.push(MessagePart::UrlFile {
            url: url.into(),
            mime: MimeType::new(mime),
        });
        self
    }

    /// Appends a tool-call part (assistant messages replaying a call).
    pub fn tool_call(mut self, call: ToolCallRequest) -> Self {
        self.parts.push(MessagePart::ToolCall(call));
        self
    }

    /// Appends a tool-result part.
    pub fn tool_result(mut self, call_id: impl Into<String>, payload: ToolResultPayload) -> Self {
        self.parts.push(MessagePart::ToolResult {
            call_id: call_id.into(),
            payload,
        });
        self
    }

    /// Marks the next text part with an Anthropic ephemeral cache breakpoint.
    pub fn cache_ephemeral(mut self) -> Self {
        self.pending_text_options
            .insert("anthropic".to_string(), json!({"cache_control": {"type": "ephemeral"}}));
        self
    }

    /// Marks the next text part with a TTL'd cache breakpoint (`"1h"`).
    pub fn cache_ttl(mut self, ttl: impl Into<String>) -> Self {
        self.pending_text_options.insert(
            "anthropic".to_string(),
            json!({"cache_control": {"type": "ephemeral", "ttl": ttl.into()}}),
        );
        self
    }

    /// Attaches a message-level provider option.
    pub fn provider_option(
        mut self,
        provider_id: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.provider_options.insert(provider_id.into(), value.into());
        self
    }

    pub fn build(self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            parts: self.parts,
            provider_options: self.provider_options,
        }
    }
}
