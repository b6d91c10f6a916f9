use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use serde_json::{Value, json};
use tsunagi_llm::config::ProviderConfig;
use tsunagi_llm::error::LLMError;
use tsunagi_llm::http::{
    HttpBodyStream, HttpRequest, HttpResponse, HttpStreamResponse, HttpTransport,
};
use tsunagi_llm::provider::openai_chat::OpenAiChatModel;
use tsunagi_llm::provider::{ChatCall, LanguageModel};
use tsunagi_llm::stream_parts::{StreamTextPart, into_stream_parts};
use tsunagi_llm::types::{CallOptions, ChatEvent, FinishReason, ToolChoice, ToolSpec};

/// Transport fake that records outgoing requests and replays canned
/// responses.
struct MockTransport {
    requests: Mutex<Vec<HttpRequest>>,
    response_body: String,
    stream_chunks: Vec<String>,
}

impl MockTransport {
    fn json(response_body: &str) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            response_body: response_body.to_string(),
            stream_chunks: Vec::new(),
        })
    }

    fn sse(chunks: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            response_body: String::new(),
            stream_chunks: chunks.iter().map(|c| format!("{c}\n\n")).collect(),
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
            .stream_chunks
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

fn model_with(transport: Arc<MockTransport>) -> OpenAiChatModel {
    OpenAiChatModel::new(
        transport,
        ProviderConfig::new()
            .with_api_key("sk-test")
            .with_model("gpt-4o"),
    )
}

#[tokio::test]
async fn basic_text_dialog_round_trips() {
    let transport = MockTransport::json(
        r#"{
            "id": "chatcmpl-1",
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hello there!"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12}
        }"#,
    );
    let model = model_with(transport.clone());

    let response = model.chat(ChatCall::new("Say hello")).await.expect("chat");

    assert_eq!(response.text.as_deref(), Some("Hello there!"));
    assert_eq!(response.finish_reason, Some(FinishReason::Stop));
    assert_eq!(response.usage.unwrap().total_tokens, Some(12));

    let body = transport.captured_body(0);
    assert_eq!(body["model"], json!("gpt-4o"));
    assert_eq!(body["messages"][0]["role"], json!("user"));
    assert_eq!(body["messages"][0]["content"], json!("Say hello"));
    assert_eq!(body["stream"], json!(false));

    let headers = transport.captured_headers(0);
    assert_eq!(headers.get("Authorization").unwrap(), "Bearer sk-test");
}

#[tokio::test]
async fn tool_call_dialog_maps_arguments_verbatim() {
    let transport = MockTransport::json(
        r#"{
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "get_current_weather",
                                      "arguments": "{\"location\":\"Boston, MA\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        }"#,
    );
    let model = model_with(transport.clone());

    let options = CallOptions::default()
        .with_tools(vec![ToolSpec::new(
            "get_current_weather",
            "Get the current weather for a location",
            json!({
                "type": "object",
                "properties": {"location": {"type": "string"}},
                "required": ["location"]
            }),
        )])
        .with_tool_choice(ToolChoice::Tool {
            name: "get_current_weather".to_string(),
        });
    let call = ChatCall::new("What is the weather in Boston?").with_options(options);
    let response = model.chat(call).await.expect("chat");

    assert_eq!(response.tool_calls.len(), 1);
    assert_eq!(response.tool_calls[0].name, "get_current_weather");
    assert_eq!(
        response.tool_calls[0].arguments,
        r#"{"location":"Boston, MA"}"#
    );
    assert_eq!(response.finish_reason, Some(FinishReason::ToolCalls));

    let body = transport.captured_body(0);
    assert_eq!(body["tools"][0]["function"]["name"], json!("get_current_weather"));
    assert_eq!(
        body["tool_choice"]["function"]["name"],
        json!("get_current_weather")
    );
}

#[tokio::test]
async fn streamed_tool_call_aggregates_into_uniform_parts() {
    let transport = MockTransport::sse(&[
        r#"data: {"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"get_weather","arguments":"{\"city\":\""}}]}}]}"#,
        r#"data: {"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"NYC\"}"}}]}}]}"#,
        r#"data: {"choices":[{"index":0,"finish_reason":"tool_calls"}],"usage":{"prompt_tokens":12,"completion_tokens":7,"total_tokens":19}}"#,
        "data: [DONE]",
    ]);
    let model = model_with(transport);

    let events = model
        .stream_chat(ChatCall::new("weather?"))
        .await
        .expect("stream");
    let parts: Vec<StreamTextPart> = into_stream_parts(events)
        .map(|p| p.expect("part"))
        .collect()
        .await;

    let tool_call = parts
        .iter()
        .find_map(|p| match p {
            StreamTextPart::ToolCall {
                id,
                tool_name,
                arguments,
            } => Some((id.clone(), tool_name.clone(), arguments.clone())),
            _ => None,
        })
        .expect("aggregated tool call part");
    assert_eq!(tool_call.0, "call_1");
    assert_eq!(tool_call.1, "get_weather");
    assert_eq!(tool_call.2, r#"{"city":"NYC"}"#);

    match parts.last().expect("finish part") {
        StreamTextPart::Finish { reason, usage } => {
            assert_eq!(reason, &Some(FinishReason::ToolCalls));
            let usage = usage.as_ref().expect("usage");
            assert_eq!(usage.prompt_tokens, Some(12));
            assert_eq!(usage.completion_tokens, Some(7));
            assert_eq!(usage.total_tokens, Some(19));
        }
        other => panic!("expected Finish, got {other:?}"),
    }
}

#[tokio::test]
async fn streamed_text_keeps_channel_ordering() {
    let transport = MockTransport::sse(&[
        r#"data: {"choices":[{"index":0,"delta":{"content":"Hel"}}]}"#,
        r#"data: {"choices":[{"index":0,"delta":{"content":"lo"},"finish_reason":"stop"}]}"#,
        "data: [DONE]",
    ]);
    let model = model_with(transport);

    let events = model
        .stream_chat(ChatCall::new("hi"))
        .await
        .expect("stream");
    let text: String = events
        .map(|e| e.expect("event"))
        .filter_map(|e| async move {
            match e {
                ChatEvent::TextDelta { text, .. } => Some(text),
                _ => None,
            }
        })
        .collect()
        .await;
    assert_eq!(text, "Hello");
}
