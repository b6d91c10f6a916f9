//! Structured output: coerce free-form model text into typed objects.
//!
//! Pre-call, a JSON-schema response format is attached; post-call the raw
//! text is parsed tolerantly, locating the outermost balanced JSON object or
//! array even when the model wrapped it in prose. The streaming variant
//! accumulates text deltas and resolves the typed object at stream end.

use std::marker::PhantomData;

use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{LLMError, truncate_payload};
use crate::provider::{ChatCall, ChatStream, LanguageModel};
use crate::types::{ChatEvent, ChatResponse, ResponseFormat};

/// Locates the outermost balanced JSON object or array inside `text`.
///
/// Tolerates leading and trailing prose; string literals and escapes are
/// respected so braces inside strings do not confuse the scan.
pub(crate) fn extract_balanced_json(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let opener = text[start..].chars().next()?;
    let closer = if opener == '{' { '}' } else { ']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            c if c == opener => depth += 1,
            c if c == closer => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + idx + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parses model text into `T`, tolerating surrounding prose.
///
/// # Examples
///
/// ```
/// use tsunagi_llm::structured::parse_structured_json;
///
/// let parsed: serde_json::Value =
///     parse_structured_json("Sure: {\"name\":\"Ada\"} — hope that helps.").unwrap();
/// assert_eq!(parsed["name"], "Ada");
/// ```
///
/// # Errors
///
/// Returns [`LLMError::ResponseFormat`] carrying a truncated raw payload
/// when no balanced JSON is found or it does not deserialize into `T`.
pub fn parse_structured_json<T: DeserializeOwned>(text: &str) -> Result<T, LLMError> {
    let candidate = extract_balanced_json(text).ok_or_else(|| LLMError::ResponseFormat {
        message: "no JSON object or array found in model output".to_string(),
        raw: truncate_payload(text),
    })?;
    serde_json::from_str(candidate).map_err(|err| LLMError::ResponseFormat {
        message: format!("failed to decode structured output: {err}"),
        raw: truncate_payload(text),
    })
}

/// Output specification for object generation.
#[derive(Debug, Clone)]
pub struct ObjectSpec {
    /// Schema name reported to the provider.
    pub name: Option<String>,
    /// JSON Schema the output must satisfy.
    pub schema: Value,
}

impl ObjectSpec {
    pub fn new(schema: Value) -> Self {
        Self { name: None, schema }
    }

    pub fn named(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: Some(name.into()),
            schema,
        }
    }

    fn response_format(&self) -> ResponseFormat {
        ResponseFormat::JsonSchema {
            name: self.name.clone(),
            schema: self.schema.clone(),
            strict: None,
        }
    }
}

/// Typed object plus the raw response it was parsed from.
#[derive(Debug)]
pub struct GenerateObjectResult<T> {
    pub object: T,
    pub response: ChatResponse,
}

/// Attaches the schema response format (when the call has none) and parses
/// the response text into `T`.
pub async fn generate_object_with_model<T: DeserializeOwned>(
    model: &dyn LanguageModel,
    mut call: ChatCall,
    spec: &ObjectSpec,
) -> Result<GenerateObjectResult<T>, LLMError> {
    if call.options.response_format.is_none() {
        call.options.response_format = Some(spec.response_format());
    }
    let response = model.chat(call).await?;
    let text = response.text.clone().unwrap_or_default();
    let object = parse_structured_json(&text)?;
    Ok(GenerateObjectResult { object, response })
}

/// Streaming object generation: live events plus a final typed object.
///
/// Consume events with [`StreamObjectResult::next_event`] (text deltas are
/// accumulated internally), then resolve the object with
/// [`StreamObjectResult::finish`], which drains any remaining events first.
pub struct StreamObjectResult<T> {
    stream: ChatStream,
    buffer: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> StreamObjectResult<T> {
    /// Yields the next stream event, accumulating text into the buffer.
    pub async fn next_event(&mut self) -> Option<Result<ChatEvent, LLMError>> {
        let event = self.stream.next().await?;
        if let Ok(ChatEvent::TextDelta { text, .. }) = &event {
            self.buffer.push_str(text);
        }
        Some(event)
    }

    /// Raw text accumulated so far.
    pub fn accumulated_text(&self) -> &str {
        &self.buffer
    }

    /// Drains the rest of the stream and parses the accumulated text.
    pub async fn finish(mut self) -> Result<T, LLMError> {
        while let Some(event) = self.next_event().await {
            // Stream errors end object resolution; parse failures of
            // individual chunks were already dropped upstream.
            event?;
        }
        parse_structured_json(&self.buffer)
    }
}

/// Starts a streaming object generation against `model`.
pub async fn stream_object_with_model<T: DeserializeOwned>(
    model: &dyn LanguageModel,
    mut call: ChatCall,
    spec: &ObjectSpec,
) -> Result<StreamObjectResult<T>, LLMError> {
    if call.options.response_format.is_none() {
        call.options.response_format = Some(spec.response_format());
    }
    let stream = model.stream_chat(call).await?;
    Ok(StreamObjectResult {
        stream,
        buffer: String::new(),
        _marker: PhantomData,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Person {
        name: String,
        age: u32,
    }

    /// 模型输出夹杂说明文字时仍能解析
    #[test]
    fn parses_object_surrounded_by_prose() {
        let text = r#"Sure, here you go: {"name":"Ada","age":36} — hope that helps."#;
        let person: Person = parse_structured_json(text).expect("parse");
        assert_eq!(
            person,
            Person {
                name: "Ada".to_string(),
                age: 36
            }
        );
    }

    #[test]
    fn respects_braces_inside_string_literals() {
        let text = r#"note: {"text":"a } inside","n":1} trailing"#;
        let value: Value = parse_structured_json(text).expect("parse");
        assert_eq!(value["text"], "a } inside");
    }

    #[test]
    fn parses_arrays_too() {
        let text = "the list: [1, 2, 3] as requested";
        let value: Vec<u32> = parse_structured_json(text).expect("parse");
        assert_eq!(value, vec![1, 2, 3]);
    }

    #[test]
    fn missing_json_is_a_response_format_error_with_truncated_raw() {
        let text = "I cannot produce that.".repeat(100);
        let err = parse_structured_json::<Value>(&text).expect_err("should fail");
        match err {
            LLMError::ResponseFormat { raw, .. } => {
                assert!(raw.len() < text.len());
            }
            other => panic!("expected ResponseFormat, got {other:?}"),
        }
    }

    #[test]
    fn schema_mismatch_is_a_response_format_error() {
        let err =
            parse_structured_json::<Person>(r#"{"name":"Ada"}"#).expect_err("missing age field");
        assert!(matches!(err, LLMError::ResponseFormat { .. }));
    }

    #[test]
    fn object_spec_builds_json_schema_format() {
        let spec = ObjectSpec::named("person", json!({"type": "object"}));
        match spec.response_format() {
            ResponseFormat::JsonSchema { name, .. } => {
                assert_eq!(name.as_deref(), Some("person"));
            }
            other => panic!("unexpected format {other:?}"),
        }
    }
}
