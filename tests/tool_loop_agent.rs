//! End-to-end agent flow over a mock transport: the model requests a tool,
//! the loop executes it, feeds the result back, and the model answers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use tsunagi_llm::agent::{Tool, ToolLoop};
use tsunagi_llm::config::ProviderConfig;
use tsunagi_llm::error::LLMError;
use tsunagi_llm::http::{HttpRequest, HttpResponse, HttpStreamResponse, HttpTransport};
use tsunagi_llm::provider::openai_chat::OpenAiChatModel;
use tsunagi_llm::structured::{ObjectSpec, generate_object_with_model};
use tsunagi_llm::provider::ChatCall;
use tsunagi_llm::types::CallOptions;

/// Replays one canned JSON response per request, in order.
struct ScriptedTransport {
    requests: Mutex<Vec<HttpRequest>>,
    responses: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    fn new(responses: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            responses: Mutex::new(responses.iter().rev().map(|r| r.to_string()).collect()),
        })
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn captured_body(&self, index: usize) -> Value {
        let requests = self.requests.lock().unwrap();
        serde_json::from_slice(requests[index].body.as_deref().unwrap_or(b"{}"))
            .expect("captured body should be JSON")
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, LLMError> {
        self.requests.lock().unwrap().push(request);
        let body = self
            .responses
            .lock()
            .unwrap()
            .pop()
            .expect("scripted transport ran out of responses");
        Ok(HttpResponse {
            status: 200,
            headers: HashMap::new(),
            body: body.into_bytes(),
        })
    }

    async fn send_stream(&self, _request: HttpRequest) -> Result<HttpStreamResponse, LLMError> {
        Err(LLMError::other("streaming not used in this test"))
    }
}

struct WeatherTool;

#[async_trait]
impl Tool for WeatherTool {
    fn name(&self) -> &str {
        "get_weather"
    }

    fn description(&self) -> &str {
        "Look up the weather for a city"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"city": {"type": "string"}},
            "required": ["city"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<Value, String> {
        let city = arguments["city"].as_str().unwrap_or_default();
        Ok(json!({"city": city, "temperature_c": 21}))
    }
}

const TOOL_CALL_RESPONSE: &str = r#"{
    "choices": [{
        "index": 0,
        "message": {
            "role": "assistant",
            "content": null,
            "tool_calls": [{
                "id": "call_1",
                "type": "function",
                "function": {"name": "get_weather", "arguments": "{\"city\":\"NYC\"}"}
            }]
        },
        "finish_reason": "tool_calls"
    }],
    "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
}"#;

const FINAL_RESPONSE: &str = r#"{
    "choices": [{
        "index": 0,
        "message": {"role": "assistant", "content": "It is 21C in NYC."},
        "finish_reason": "stop"
    }],
    "usage": {"prompt_tokens": 24, "completion_tokens": 8, "total_tokens": 32}
}"#;

#[tokio::test]
async fn agent_round_trip_executes_tool_and_finishes() {
    let transport = ScriptedTransport::new(&[TOOL_CALL_RESPONSE, FINAL_RESPONSE]);
    let model = Arc::new(OpenAiChatModel::new(
        transport.clone(),
        ProviderConfig::new()
            .with_api_key("sk-test")
            .with_model("gpt-4o"),
    ));

    let outcome = ToolLoop::new(model)
        .with_tool(Arc::new(WeatherTool))
        .run("What's the weather in NYC?", CallOptions::default(), None)
        .await
        .expect("outcome");

    assert_eq!(transport.request_count(), 2);
    assert_eq!(outcome.steps, 2);
    assert_eq!(outcome.text, "It is 21C in NYC.");
    assert_eq!(outcome.exchanges.len(), 1);
    assert_eq!(outcome.usage.total_tokens, Some(47));

    // The second request must replay the assistant tool call and promote the
    // result to a tool-role message.
    let second = transport.captured_body(1);
    let messages = second["messages"].as_array().expect("messages");
    assert_eq!(messages[0]["role"], json!("user"));
    assert_eq!(messages[1]["role"], json!("assistant"));
    assert_eq!(
        messages[1]["tool_calls"][0]["function"]["name"],
        json!("get_weather")
    );
    assert_eq!(messages[2]["role"], json!("tool"));
    assert_eq!(messages[2]["tool_call_id"], json!("call_1"));
    assert!(
        messages[2]["content"]
            .as_str()
            .unwrap()
            .contains("temperature_c")
    );

    // The loop advertises its registered tools to the model.
    let first = transport.captured_body(0);
    assert_eq!(
        first["tools"][0]["function"]["name"],
        json!("get_weather")
    );
}

/// 结构化输出：模型文本夹带说明文字仍可解析
#[tokio::test]
async fn generate_object_tolerates_surrounding_prose() {
    let transport = ScriptedTransport::new(&[r#"{
        "choices": [{
            "index": 0,
            "message": {"role": "assistant",
                         "content": "Sure, here you go: {\"name\":\"Ada\",\"age\":36} — hope that helps."},
            "finish_reason": "stop"
        }]
    }"#]);
    let model = OpenAiChatModel::new(
        transport.clone(),
        ProviderConfig::new()
            .with_api_key("sk-test")
            .with_model("gpt-4o"),
    );

    #[derive(Debug, serde::Deserialize, PartialEq)]
    struct Person {
        name: String,
        age: u32,
    }

    let spec = ObjectSpec::named(
        "person",
        json!({
            "type": "object",
            "properties": {"name": {"type": "string"}, "age": {"type": "integer"}},
            "required": ["name", "age"]
        }),
    );
    let result = generate_object_with_model::<Person>(
        &model,
        ChatCall::new("Describe Ada as JSON"),
        &spec,
    )
    .await
    .expect("object");

    assert_eq!(
        result.object,
        Person {
            name: "Ada".to_string(),
            age: 36
        }
    );

    // the schema was attached as a response_format
    let body = transport.captured_body(0);
    assert_eq!(body["response_format"]["type"], json!("json_schema"));
    assert_eq!(
        body["response_format"]["json_schema"]["name"],
        json!("person")
    );
}
