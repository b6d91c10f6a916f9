use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use serde_json::{Value, json};
use tsunagi_llm::config::{ProviderConfig, ext};
use tsunagi_llm::error::LLMError;
use tsunagi_llm::http::{
    HttpBodyStream, HttpRequest, HttpResponse, HttpStreamResponse, HttpTransport,
};
use tsunagi_llm::prompt::{ChatRole, MessageBuilder, Prompt};
use tsunagi_llm::provider::anthropic_messages::AnthropicMessagesModel;
use tsunagi_llm::provider::{ChatCall, LanguageModel};
use tsunagi_llm::stream_parts::{StreamTextPart, into_stream_parts};
use tsunagi_llm::types::{CallOptions, FinishReason};

struct MockTransport {
    requests: Mutex<Vec<HttpRequest>>,
    response_body: String,
    stream_frames: Vec<String>,
}

impl MockTransport {
    fn json(response_body: &str) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            response_body: response_body.to_string(),
            stream_frames: Vec::new(),
        })
    }

    fn sse(frames: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            response_body: String::new(),
            stream_frames: frames
                .iter()
                .map(|(event, data)| format!("event: {event}\ndata: {data}\n\n"))
                .collect(),
        })
    }

    fn captured_body(&self, index: usize) -> Value {
        let requests = self.requests.lock().unwrap();
        serde_json::from_slice(requests[index].body.as_deref().unwrap_or(b"{}"))
            .expect("captured body should be JSON")
    }

    fn captured_headers(&self, index: usize) -> HashMap<String, String> {
        self.requests.lock().unwrap()[index].headers.clone()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, LLMError> {
        self.requests.lock().unwrap().push(request);
        Ok(HttpResponse {
            status: 200,
            headers: HashMap::new(),
            body: self.response_body.clone().into_bytes(),
        })
    }

    async fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, LLMError> {
        self.requests.lock().unwrap().push(request);
        let chunks: Vec<Result<Vec<u8>, LLMError>> = self
            .stream_frames
            .iter()
            .map(|c| Ok(c.clone().into_bytes()))
            .collect();
        let body: HttpBodyStream = Box::pin(stream::iter(chunks));
        Ok(HttpStreamResponse {
            status: 200,
            headers: HashMap::new(),
            body,
        })
    }
}

fn model_with(transport: Arc<MockTransport>, config: ProviderConfig) -> AnthropicMessagesModel {
    AnthropicMessagesModel::new(
        transport,
        config.with_api_key("sk-ant").with_model("claude-sonnet-4-20250514"),
    )
}

const EMPTY_RESPONSE: &str = r#"{
    "id": "msg_1",
    "model": "claude-sonnet-4-20250514",
    "content": [{"type": "text", "text": "ok"}],
    "stop_reason": "end_turn",
    "usage": {"input_tokens": 1, "output_tokens": 1}
}"#;

#[tokio::test]
async fn request_uses_api_key_and_version_headers() {
    let transport = MockTransport::json(EMPTY_RESPONSE);
    let model = model_with(transport.clone(), ProviderConfig::new());

    let options = CallOptions::default().with_max_tokens(128);
    model
        .chat(ChatCall::new("hello").with_options(options))
        .await
        .expect("chat");

    let headers = transport.captured_headers(0);
    assert_eq!(headers.get("x-api-key").unwrap(), "sk-ant");
    assert_eq!(headers.get("anthropic-version").unwrap(), "2023-06-01");
    assert!(!headers.contains_key("Authorization"));
}

/// 六个缓存断点只保留前四个
#[tokio::test]
async fn cache_breakpoints_are_capped_at_four_in_input_order() {
    let transport = MockTransport::json(EMPTY_RESPONSE);
    let model = model_with(transport.clone(), ProviderConfig::new());

    let mut builder = MessageBuilder::new(ChatRole::User);
    for i in 0..6 {
        builder = builder.cache_ephemeral().text(format!("chunk {i}"));
    }
    let prompt = Prompt::new(vec![builder.build()]);
    model
        .chat(ChatCall::new(prompt).with_options(CallOptions::default().with_max_tokens(64)))
        .await
        .expect("chat");

    let body = transport.captured_body(0);
    let blocks = body["messages"][0]["content"].as_array().expect("blocks");
    let tagged: Vec<bool> = blocks
        .iter()
        .map(|b| b.get("cache_control").is_some())
        .collect();
    assert_eq!(tagged, vec![true, true, true, true, false, false]);
}

#[tokio::test]
async fn one_hour_ttl_triggers_extended_cache_beta_header() {
    let transport = MockTransport::json(EMPTY_RESPONSE);
    let model = model_with(transport.clone(), ProviderConfig::new());

    let message = MessageBuilder::new(ChatRole::User)
        .cache_ttl("1h")
        .text("big shared context")
        .text("question")
        .build();
    model
        .chat(
            ChatCall::new(Prompt::new(vec![message]))
                .with_options(CallOptions::default().with_max_tokens(64)),
        )
        .await
        .expect("chat");

    let headers = transport.captured_headers(0);
    assert!(
        headers
            .get("anthropic-beta")
            .expect("beta header")
            .contains("extended-cache-ttl-2025-04-11")
    );
}

/// thinking 预算与采样参数互斥
#[tokio::test]
async fn thinking_budget_reshapes_request_body() {
    let transport = MockTransport::json(EMPTY_RESPONSE);
    let model = model_with(
        transport.clone(),
        ProviderConfig::new().with_extension(ext::THINKING_BUDGET, 2048u32),
    );

    let options = CallOptions {
        max_tokens: Some(1024),
        temperature: Some(0.7),
        top_p: Some(0.9),
        top_k: Some(50),
        ..Default::default()
    };
    model
        .chat(ChatCall::new("think").with_options(options))
        .await
        .expect("chat");

    let body = transport.captured_body(0);
    assert_eq!(
        body["thinking"],
        json!({"type": "enabled", "budget_tokens": 2048})
    );
    assert!(body.get("temperature").is_none());
    assert!(body.get("top_p").is_none());
    assert!(body.get("top_k").is_none());
    assert_eq!(body["max_tokens"], json!(1024 + 2048));
}

/// thinking 与 tool_use 混合流要得到稳定的 part 序列
#[tokio::test]
async fn thinking_and_tool_use_stream_produces_expected_part_sequence() {
    let transport = MockTransport::sse(&[
        (
            "message_start",
            r#"{"type":"message_start","message":{"id":"msg_1","usage":{"input_tokens":5,"output_tokens":0}}}"#,
        ),
        (
            "content_block_start",
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"thinking"}}"#,
        ),
        (
            "content_block_delta",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"Let me think…"}}"#,
        ),
        (
            "content_block_stop",
            r#"{"type":"content_block_stop","index":0}"#,
        ),
        (
            "content_block_start",
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"tu_1","name":"calc"}}"#,
        ),
        (
            "content_block_delta",
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"a\":"}}"#,
        ),
        (
            "content_block_delta",
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"1}"}}"#,
        ),
        (
            "content_block_stop",
            r#"{"type":"content_block_stop","index":1}"#,
        ),
        (
            "message_delta",
            r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":9}}"#,
        ),
        ("message_stop", r#"{"type":"message_stop"}"#),
    ]);
    let model = model_with(transport, ProviderConfig::new());

    let events = model
        .stream_chat(
            ChatCall::new("compute").with_options(CallOptions::default().with_max_tokens(64)),
        )
        .await
        .expect("stream");
    let parts: Vec<StreamTextPart> = into_stream_parts(events)
        .map(|p| p.expect("part"))
        .collect()
        .await;

    assert_eq!(
        parts[..6],
        vec![
            StreamTextPart::ThinkingDelta {
                delta: "Let me think…".to_string()
            },
            StreamTextPart::ToolInputStart {
                id: "tu_1".to_string(),
                tool_name: "calc".to_string()
            },
            StreamTextPart::ToolInputDelta {
                id: "tu_1".to_string(),
                partial_json: "{\"a\":".to_string()
            },
            StreamTextPart::ToolInputDelta {
                id: "tu_1".to_string(),
                partial_json: "1}".to_string()
            },
            StreamTextPart::ToolInputEnd {
                id: "tu_1".to_string()
            },
            StreamTextPart::ToolCall {
                id: "tu_1".to_string(),
                tool_name: "calc".to_string(),
                arguments: "{\"a\":1}".to_string()
            },
        ]
    );
    match parts.last().expect("finish part") {
        StreamTextPart::Finish { reason, usage } => {
            assert_eq!(reason, &Some(FinishReason::ToolCalls));
            let usage = usage.as_ref().expect("usage");
            assert_eq!(usage.prompt_tokens, Some(5));
            assert_eq!(usage.completion_tokens, Some(9));
        }
        other => panic!("expected Finish, got {other:?}"),
    }
    assert_eq!(parts.len(), 7);
}
