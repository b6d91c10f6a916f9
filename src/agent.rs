//! Multi-turn tool-calling loop.
//!
//! Drives a conversation until the model stops requesting local tools:
//! detect tool calls in a response, dispatch them, feed the results back,
//! and continue — bounded by a step limit and a cooperative cancellation
//! token. Provider-executed tools (MCP calls, Responses builtins) are
//! recorded as outputs and never dispatched locally.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::LLMError;
use crate::prompt::{ChatMessage, ChatRole, MessagePart, Prompt, ToolResultPayload};
use crate::provider::{ChatCall, DynLanguageModel};
use crate::types::{
    CallOptions, FinishReason, TokenUsage, ToolCallRequest, ToolSpec,
};

/// A locally-executable tool the loop can dispatch.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name exposed to the model.
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// JSON Schema of the arguments object.
    fn parameters(&self) -> Value;

    /// Executes with decoded JSON arguments.
    ///
    /// An `Err` is not fatal: it becomes an `is_error` tool result the model
    /// can react to on the next turn.
    async fn execute(&self, arguments: Value) -> Result<Value, String>;
}

pub type DynTool = Arc<dyn Tool>;

/// One dispatched tool call and the payload fed back to the model.
#[derive(Debug, Clone)]
pub struct ToolExchange {
    pub call: ToolCallRequest,
    pub payload: ToolResultPayload,
}

/// Accumulated result of a finished loop.
#[derive(Debug, Clone, Default)]
pub struct ToolLoopOutcome {
    /// Assistant text concatenated across steps.
    pub text: String,
    /// Model-visible thinking concatenated across steps.
    pub thinking: String,
    /// Every locally-dispatched tool exchange, in call order per step.
    pub exchanges: Vec<ToolExchange>,
    /// Provider-executed tool calls and blocks, recorded but not executed.
    pub provider_outputs: Vec<Value>,
    /// Usage summed across steps.
    pub usage: TokenUsage,
    pub warnings: Vec<String>,
    pub finish_reason: Option<FinishReason>,
    /// Number of model round-trips issued.
    pub steps: usize,
    /// `true` when the loop stopped because of the step limit or
    /// cancellation rather than a terminal response.
    pub stopped_early: bool,
    /// The full conversation including appended tool results.
    pub conversation: Prompt,
}

const DEFAULT_MAX_STEPS: usize = 8;

/// Configurable driver for the tool-calling state machine.
pub struct ToolLoop {
    model: DynLanguageModel,
    tools: HashMap<String, DynTool>,
    max_steps: usize,
}

impl ToolLoop {
    pub fn new(model: DynLanguageModel) -> Self {
        Self {
            model,
            tools: HashMap::new(),
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    /// Registers a tool; its name must be unique within the loop.
    pub fn with_tool(mut self, tool: DynTool) -> Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    fn tool_specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .values()
            .map(|tool| ToolSpec::new(tool.name(), tool.description(), tool.parameters()))
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Runs the loop to completion.
    ///
    /// Cancellation is cooperative: the token is checked before every model
    /// call and after every dispatch round; on cancellation the accumulated
    /// partial outcome is returned with `stopped_early` set.
    pub async fn run(
        &self,
        prompt: impl Into<Prompt>,
        mut options: CallOptions,
        cancel: Option<CancellationToken>,
    ) -> Result<ToolLoopOutcome, LLMError> {
        let mut conversation: Prompt = prompt.into();
        let mut outcome = ToolLoopOutcome::default();

        if options.tools.is_none() && !self.tools.is_empty() {
            options.tools = Some(self.tool_specs());
        }
        let parallel = !options.disable_parallel_tool_use.unwrap_or(false);

        loop {
            if is_cancelled(&cancel) {
                outcome.stopped_early = true;
                break;
            }
            if outcome.steps >= self.max_steps {
                outcome.stopped_early = true;
                break;
            }

            let call = ChatCall {
                prompt: conversation.clone(),
                options: options.clone(),
                cancel: cancel.clone(),
            };
            let response = self.model.chat(call).await?;
            outcome.steps += 1;

            if let Some(text) = &response.text {
                outcome.text.push_str(text);
            }
            if let Some(thinking) = &response.thinking {
                outcome.thinking.push_str(thinking);
            }
            if let Some(usage) = &response.usage {
                outcome.usage.accumulate(usage);
            }
            outcome.warnings.extend(response.warnings.clone());
            outcome
                .provider_outputs
                .extend(response.provider_outputs.clone());
            outcome.finish_reason = response.finish_reason.clone();

            if response.tool_calls.is_empty() {
                break;
            }

            // Split local from provider-executed calls; unknown names are
            // treated as provider-executed: recorded as outputs, never
            // dispatched, paired with a synthetic result when replayed.
            let mut local_calls = Vec::new();
            for call in &response.tool_calls {
                if self.tools.contains_key(&call.name) {
                    local_calls.push(call.clone());
                } else {
                    outcome.provider_outputs.push(serde_json::json!({
                        "type": "unresolved_tool_call",
                        "id": call.id,
                        "name": call.name,
                        "arguments": call.arguments,
                    }));
                }
            }
            if local_calls.is_empty() {
                break;
            }

            let exchanges = self.dispatch(&local_calls, parallel).await;

            // Replay the assistant turn, then feed results back in the order
            // the model emitted the calls. Every replayed tool call must
            // have a paired result in the next turn, so calls with no local
            // executable get a synthetic error payload.
            let mut assistant = Vec::new();
            if let Some(text) = &response.text {
                if !text.is_empty() {
                    assistant.push(MessagePart::text(text.clone()));
                }
            }
            for call in &response.tool_calls {
                assistant.push(MessagePart::ToolCall(call.clone()));
            }
            conversation.push(ChatMessage::new(ChatRole::Assistant, assistant));

            let mut local_exchanges = exchanges.iter();
            let results: Vec<MessagePart> = response
                .tool_calls
                .iter()
                .map(|call| {
                    let payload = if self.tools.contains_key(&call.name) {
                        local_exchanges
                            .next()
                            .expect("one exchange per local call")
                            .payload
                            .clone()
                    } else {
                        ToolResultPayload::Error {
                            message: format!("tool `{}` has no local executable", call.name),
                        }
                    };
                    MessagePart::ToolResult {
                        call_id: call.id.clone().unwrap_or_else(|| call.name.clone()),
                        payload,
                    }
                })
                .collect();
            conversation.push(ChatMessage::new(ChatRole::User, results));
            outcome.exchanges.extend(exchanges);

            if is_cancelled(&cancel) {
                outcome.stopped_early = true;
                break;
            }
        }

        outcome.conversation = conversation;
        Ok(outcome)
    }

    /// Executes one step's local calls, concurrently unless parallel tool
    /// use is disabled. Results come back in call order either way.
    async fn dispatch(&self, calls: &[ToolCallRequest], parallel: bool) -> Vec<ToolExchange> {
        if parallel && calls.len() > 1 {
            let futures = calls.iter().map(|call| self.dispatch_one(call.clone()));
            join_all(futures).await
        } else {
            let mut exchanges = Vec::with_capacity(calls.len());
            for call in calls {
                exchanges.push(self.dispatch_one(call.clone()).await);
            }
            exchanges
        }
    }

    async fn dispatch_one(&self, call: ToolCallRequest) -> ToolExchange {
        let tool = self
            .tools
            .get(&call.name)
            .expect("dispatch_one is only called for registered tools")
            .clone();

        // Undecodable arguments are fatal for the call, not the loop: the
        // model sees a synthetic error result and may correct itself.
        let arguments = match call.arguments_value() {
            Ok(value) => value,
            Err(err) => {
                return ToolExchange {
                    payload: ToolResultPayload::Error {
                        message: format!("failed to decode arguments for {}: {err}", call.name),
                    },
                    call,
                };
            }
        };

        let payload = match tool.execute(arguments).await {
            Ok(value) => match value {
                Value::String(text) => ToolResultPayload::Text { text },
                other => ToolResultPayload::Json { value: other },
            },
            Err(message) => ToolResultPayload::Error { message },
        };
        ToolExchange { call, payload }
    }
}

fn is_cancelled(cancel: &Option<CancellationToken>) -> bool {
    cancel.as_ref().is_some_and(|token| token.is_cancelled())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::capability::CapabilitySet;
    use crate::provider::{ChatStream, LanguageModel};
    use crate::types::ChatResponse;
    use serde_json::json;

    /// Model that always requests the same tool call.
    struct AlwaysToolModel {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LanguageModel for AlwaysToolModel {
        async fn chat(&self, _call: ChatCall) -> Result<ChatResponse, LLMError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ChatResponse {
                tool_calls: vec![ToolCallRequest::new(
                    Some("call_1".to_string()),
                    "echo",
                    r#"{"value":"again"}"#,
                )],
                finish_reason: Some(FinishReason::ToolCalls),
                usage: Some(TokenUsage {
                    prompt_tokens: Some(1),
                    completion_tokens: Some(1),
                    ..Default::default()
                }),
                ..Default::default()
            })
        }

        async fn stream_chat(&self, _call: ChatCall) -> Result<ChatStream, LLMError> {
            Err(LLMError::other("not used"))
        }

        fn capabilities(&self) -> CapabilitySet {
            CapabilitySet::new()
        }

        fn provider_id(&self) -> &str {
            "mock"
        }
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {"value": {"type": "string"}}})
        }

        async fn execute(&self, arguments: Value) -> Result<Value, String> {
            Ok(arguments["value"].clone())
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "boom"
        }

        fn parameters(&self) -> Value {
            json!({"type": "object"})
        }

        async fn execute(&self, _arguments: Value) -> Result<Value, String> {
            Err("disk on fire".to_string())
        }
    }

    /// 到达步数上限后必须停止，且不再发起额外请求
    #[tokio::test]
    async fn loop_stops_at_max_steps_without_extra_calls() {
        let model = Arc::new(AlwaysToolModel {
            calls: AtomicUsize::new(0),
        });
        let tool_loop = ToolLoop::new(model.clone())
            .with_tool(Arc::new(EchoTool))
            .with_max_steps(3);

        let outcome = tool_loop
            .run("go", CallOptions::default(), None)
            .await
            .expect("outcome");

        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.steps, 3);
        assert!(outcome.stopped_early);
        assert_eq!(outcome.exchanges.len(), 3);
        assert_eq!(outcome.usage.prompt_tokens, Some(3));
        // conversation grew by assistant+results pairs
        assert_eq!(outcome.conversation.messages.len(), 1 + 3 * 2);
    }

    /// Model that requests a tool once, then answers.
    struct OneShotToolModel {
        calls: AtomicUsize,
        tool_call: ToolCallRequest,
    }

    #[async_trait]
    impl LanguageModel for OneShotToolModel {
        async fn chat(&self, call: ChatCall) -> Result<ChatResponse, LLMError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Ok(ChatResponse {
                    tool_calls: vec![self.tool_call.clone()],
                    finish_reason: Some(FinishReason::ToolCalls),
                    ..Default::default()
                })
            } else {
                // The previous turn must contain the fed-back tool result.
                let last = call.prompt.messages.last().expect("result message");
                let has_result = last
                    .parts
                    .iter()
                    .any(|p| matches!(p, MessagePart::ToolResult { .. }));
                assert!(has_result, "tool results were not appended");
                Ok(ChatResponse {
                    text: Some("done".to_string()),
                    finish_reason: Some(FinishReason::Stop),
                    ..Default::default()
                })
            }
        }

        async fn stream_chat(&self, _call: ChatCall) -> Result<ChatStream, LLMError> {
            Err(LLMError::other("not used"))
        }

        fn capabilities(&self) -> CapabilitySet {
            CapabilitySet::new()
        }

        fn provider_id(&self) -> &str {
            "mock"
        }
    }

    #[tokio::test]
    async fn tool_results_feed_back_and_loop_terminates_on_stop() {
        let model = Arc::new(OneShotToolModel {
            calls: AtomicUsize::new(0),
            tool_call: ToolCallRequest::new(
                Some("call_1".to_string()),
                "echo",
                r#"{"value":"hi"}"#,
            ),
        });
        let tool_loop = ToolLoop::new(model).with_tool(Arc::new(EchoTool));

        let outcome = tool_loop
            .run("go", CallOptions::default(), None)
            .await
            .expect("outcome");

        assert_eq!(outcome.text, "done");
        assert!(!outcome.stopped_early);
        assert_eq!(outcome.finish_reason, Some(FinishReason::Stop));
        assert_eq!(outcome.exchanges.len(), 1);
        assert!(matches!(
            outcome.exchanges[0].payload,
            ToolResultPayload::Text { ref text } if text == "hi"
        ));
    }

    #[tokio::test]
    async fn tool_failures_become_error_payloads_not_loop_errors() {
        let model = Arc::new(OneShotToolModel {
            calls: AtomicUsize::new(0),
            tool_call: ToolCallRequest::new(Some("call_1".to_string()), "boom", "{}"),
        });
        let tool_loop = ToolLoop::new(model).with_tool(Arc::new(FailingTool));

        let outcome = tool_loop
            .run("go", CallOptions::default(), None)
            .await
            .expect("outcome");

        let payload = &outcome.exchanges[0].payload;
        assert!(payload.is_error());
        assert!(payload.to_content_string().starts_with("[Error: "));
    }

    #[tokio::test]
    async fn undecodable_arguments_produce_synthetic_error_result() {
        let model = Arc::new(OneShotToolModel {
            calls: AtomicUsize::new(0),
            tool_call: ToolCallRequest::new(Some("call_1".to_string()), "echo", "{not json"),
        });
        let tool_loop = ToolLoop::new(model).with_tool(Arc::new(EchoTool));

        let outcome = tool_loop
            .run("go", CallOptions::default(), None)
            .await
            .expect("outcome");

        let content = outcome.exchanges[0].payload.to_content_string();
        assert!(content.starts_with("[Error: "));
        assert!(content.contains("failed to decode arguments"));
    }

    #[tokio::test]
    async fn unknown_tool_calls_are_recorded_not_executed() {
        let model = Arc::new(OneShotToolModel {
            calls: AtomicUsize::new(0),
            tool_call: ToolCallRequest::new(Some("mcp_1".to_string()), "mcp_remote_thing", "{}"),
        });
        let tool_loop = ToolLoop::new(model).with_tool(Arc::new(EchoTool));

        let outcome = tool_loop
            .run("go", CallOptions::default(), None)
            .await
            .expect("outcome");

        // No local executable: recorded as an output, loop terminal.
        assert!(outcome.exchanges.is_empty());
        assert_eq!(outcome.provider_outputs.len(), 1);
        assert_eq!(
            outcome.provider_outputs[0]["type"],
            "unresolved_tool_call"
        );
        assert_eq!(outcome.steps, 1);
    }

    /// Model mixing one local and one provider-executed call, asserting the
    /// fed-back results on the second turn.
    struct MixedCallsModel {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LanguageModel for MixedCallsModel {
        async fn chat(&self, call: ChatCall) -> Result<ChatResponse, LLMError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                return Ok(ChatResponse {
                    tool_calls: vec![
                        ToolCallRequest::new(
                            Some("call_a".to_string()),
                            "echo",
                            r#"{"value":"hi"}"#,
                        ),
                        ToolCallRequest::new(Some("call_b".to_string()), "mcp_remote_thing", "{}"),
                    ],
                    finish_reason: Some(FinishReason::ToolCalls),
                    ..Default::default()
                });
            }
            // Every replayed tool call must come back paired with a result.
            let last = call.prompt.messages.last().expect("results message");
            let results: Vec<(String, ToolResultPayload)> = last
                .parts
                .iter()
                .filter_map(|p| match p {
                    MessagePart::ToolResult { call_id, payload } => {
                        Some((call_id.clone(), payload.clone()))
                    }
                    _ => None,
                })
                .collect();
            assert_eq!(results.len(), 2, "one result per replayed call");
            assert_eq!(results[0].0, "call_a");
            assert!(!results[0].1.is_error());
            assert_eq!(results[1].0, "call_b");
            assert!(results[1].1.is_error());
            Ok(ChatResponse {
                text: Some("done".to_string()),
                finish_reason: Some(FinishReason::Stop),
                ..Default::default()
            })
        }

        async fn stream_chat(&self, _call: ChatCall) -> Result<ChatStream, LLMError> {
            Err(LLMError::other("not used"))
        }

        fn capabilities(&self) -> CapabilitySet {
            CapabilitySet::new()
        }

        fn provider_id(&self) -> &str {
            "mock"
        }
    }

    #[tokio::test]
    async fn mixed_local_and_unresolved_calls_pair_every_call_id() {
        let model = Arc::new(MixedCallsModel {
            calls: AtomicUsize::new(0),
        });
        let tool_loop = ToolLoop::new(model).with_tool(Arc::new(EchoTool));

        let outcome = tool_loop
            .run("go", CallOptions::default(), None)
            .await
            .expect("outcome");

        assert_eq!(outcome.steps, 2);
        assert_eq!(outcome.text, "done");
        // only the local call was dispatched; the unresolved one was
        // recorded as an output
        assert_eq!(outcome.exchanges.len(), 1);
        assert_eq!(outcome.exchanges[0].call.name, "echo");
        assert_eq!(outcome.provider_outputs.len(), 1);
        assert_eq!(outcome.provider_outputs[0]["type"], "unresolved_tool_call");
    }

    #[tokio::test]
    async fn cancellation_exits_with_partial_results() {
        let model = Arc::new(AlwaysToolModel {
            calls: AtomicUsize::new(0),
        });
        let token = CancellationToken::new();
        token.cancel();
        let tool_loop = ToolLoop::new(model.clone()).with_tool(Arc::new(EchoTool));

        let outcome = tool_loop
            .run("go", CallOptions::default(), Some(token))
            .await
            .expect("outcome");

        assert!(outcome.stopped_early);
        assert_eq!(outcome.steps, 0);
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }
}
