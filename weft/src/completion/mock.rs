//! Scripted gateway for tests and local development.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use super::{CompletionRequest, CompletionsGateway, PartStream, ProviderConfig};
use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::stream::{FinishReason, StreamPart};
use crate::tool::ToolCall;
use crate::usage::Usage;

/// One scripted provider call.
#[derive(Debug, Clone)]
enum ScriptedStep {
    /// Yield these parts, then end cleanly.
    Parts(Vec<StreamPart>),
    /// Yield these parts, then fail.
    Fail {
        parts: Vec<StreamPart>,
        message: String,
    },
}

const DEFAULT_SCRIPT: &str = "";

/// A [`CompletionsGateway`] that replays scripted steps in order.
///
/// Steps scripted with the `push_*` methods go to a default queue; the
/// `*_for` variants script a queue keyed by model name, which keeps
/// concurrent runs of different manifests deterministic. Each call consumes
/// the next step of the model's queue, falling back to the default queue.
///
/// The produced stream checks the run context before every part and turns an
/// abort into a provider error, the same way a real adapter's transport would
/// fail.
#[derive(Debug, Default)]
pub struct MockGateway {
    scripts: Mutex<HashMap<String, VecDeque<ScriptedStep>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockGateway {
    /// Create a gateway with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, model: &str, step: ScriptedStep) {
        self.scripts
            .lock()
            .expect("script mutex poisoned")
            .entry(model.to_owned())
            .or_default()
            .push_back(step);
    }

    fn pop(&self, model: &str) -> Option<ScriptedStep> {
        let mut scripts = self.scripts.lock().expect("script mutex poisoned");
        if let Some(step) = scripts.get_mut(model).and_then(VecDeque::pop_front) {
            return Some(step);
        }
        scripts
            .get_mut(DEFAULT_SCRIPT)
            .and_then(VecDeque::pop_front)
    }

    /// Script a step that yields the given parts then ends.
    pub fn push_parts(&self, parts: Vec<StreamPart>) {
        self.push(DEFAULT_SCRIPT, ScriptedStep::Parts(parts));
    }

    /// Script a step for the named model.
    pub fn push_parts_for(&self, model: &str, parts: Vec<StreamPart>) {
        self.push(model, ScriptedStep::Parts(parts));
    }

    /// Script a step that yields the given parts then fails.
    pub fn push_error(&self, parts: Vec<StreamPart>, message: impl Into<String>) {
        self.push(
            DEFAULT_SCRIPT,
            ScriptedStep::Fail {
                parts,
                message: message.into(),
            },
        );
    }

    /// Script a plain-text step finishing with `stop`.
    pub fn push_text_step(&self, text: impl Into<String>) {
        self.push_parts(text_step(text));
    }

    /// Script a plain-text step for the named model.
    pub fn push_text_step_for(&self, model: &str, text: impl Into<String>) {
        self.push_parts_for(model, text_step(text));
    }

    /// Script a step that calls the given tools.
    pub fn push_tool_step(&self, calls: Vec<ToolCall>) {
        self.push_parts(tool_step(calls));
    }

    /// Script a tool-calling step for the named model.
    pub fn push_tool_step_for(&self, model: &str, calls: Vec<ToolCall>) {
        self.push_parts_for(model, tool_step(calls));
    }

    /// Script a step that requests approval for a single tool call.
    pub fn push_approval_step(
        &self,
        approval_id: impl Into<String>,
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        tool_args: Value,
        description: impl Into<String>,
    ) {
        self.push_parts(approval_step(
            approval_id,
            tool_call_id,
            tool_name,
            tool_args,
            description,
        ));
    }

    /// Script an approval-requesting step for the named model.
    pub fn push_approval_step_for(
        &self,
        model: &str,
        approval_id: impl Into<String>,
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        tool_args: Value,
        description: impl Into<String>,
    ) {
        self.push_parts_for(
            model,
            approval_step(approval_id, tool_call_id, tool_name, tool_args, description),
        );
    }

    /// Requests observed so far.
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.requests.lock().expect("request mutex poisoned").len()
    }

    /// Clone of the nth observed request.
    #[must_use]
    pub fn request(&self, index: usize) -> Option<CompletionRequest> {
        self.requests
            .lock()
            .expect("request mutex poisoned")
            .get(index)
            .cloned()
    }

    /// Remaining unconsumed scripted steps across all queues.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.scripts
            .lock()
            .expect("script mutex poisoned")
            .values()
            .map(VecDeque::len)
            .sum()
    }
}

fn text_step(text: impl Into<String>) -> Vec<StreamPart> {
    vec![
        StreamPart::text_delta(text),
        StreamPart::finish(FinishReason::Stop, Usage::new(10, 5)),
    ]
}

fn tool_step(calls: Vec<ToolCall>) -> Vec<StreamPart> {
    let mut parts: Vec<StreamPart> = calls.into_iter().map(StreamPart::tool_call).collect();
    parts.push(StreamPart::finish(FinishReason::ToolCalls, Usage::new(10, 5)));
    parts
}

fn approval_step(
    approval_id: impl Into<String>,
    tool_call_id: impl Into<String>,
    tool_name: impl Into<String>,
    tool_args: Value,
    description: impl Into<String>,
) -> Vec<StreamPart> {
    let tool_call_id = tool_call_id.into();
    let tool_name = tool_name.into();
    vec![
        StreamPart::ToolApprovalRequest {
            approval_id: approval_id.into(),
            tool_call_id: tool_call_id.clone(),
            tool_name: tool_name.clone(),
            tool_args: tool_args.clone(),
            description: description.into(),
        },
        StreamPart::ToolCall {
            tool_call: ToolCall::new(tool_call_id, tool_name, tool_args),
        },
        StreamPart::finish(FinishReason::ToolCalls, Usage::new(10, 5)),
    ]
}

#[async_trait]
impl CompletionsGateway for MockGateway {
    async fn stream_completion(
        &self,
        ctx: &RunContext,
        provider: &ProviderConfig,
        request: CompletionRequest,
    ) -> Result<PartStream> {
        self.requests
            .lock()
            .expect("request mutex poisoned")
            .push(request);

        let step = self
            .pop(&provider.model)
            .ok_or_else(|| Error::provider("mock gateway script exhausted"))?;

        let ctx = ctx.clone();
        let stream = async_stream::stream! {
            let (parts, failure) = match step {
                ScriptedStep::Parts(parts) => (parts, None),
                ScriptedStep::Fail { parts, message } => (parts, Some(message)),
            };
            for part in parts {
                if ctx.is_aborted() {
                    yield Err(Error::provider("stream aborted"));
                    return;
                }
                yield Ok(part);
            }
            if let Some(message) = failure {
                yield Err(Error::provider(message));
            }
        };
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn request() -> CompletionRequest {
        CompletionRequest {
            messages: Vec::new(),
            tools: Vec::new(),
            stop_after_steps: 1,
            tool_choice: None,
            active_tools: None,
        }
    }

    #[tokio::test]
    async fn replays_script_in_order() {
        let gateway = MockGateway::new();
        gateway.push_text_step("hello");

        let ctx = RunContext::new();
        let provider = ProviderConfig::new("mock", "test");
        let mut stream = gateway
            .stream_completion(&ctx, &provider, request())
            .await
            .unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, StreamPart::text_delta("hello"));
        assert!(stream.next().await.unwrap().unwrap().is_finish());
        assert!(stream.next().await.is_none());
        assert_eq!(gateway.request_count(), 1);
        assert_eq!(gateway.remaining(), 0);
    }

    #[tokio::test]
    async fn per_model_scripts_take_precedence() {
        let gateway = MockGateway::new();
        gateway.push_text_step("default");
        gateway.push_text_step_for("special", "routed");

        let ctx = RunContext::new();
        let special = ProviderConfig::new("mock", "special");
        let mut stream = gateway
            .stream_completion(&ctx, &special, request())
            .await
            .unwrap();
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            StreamPart::text_delta("routed")
        );

        let other = ProviderConfig::new("mock", "other");
        let mut stream = gateway
            .stream_completion(&ctx, &other, request())
            .await
            .unwrap();
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            StreamPart::text_delta("default")
        );
    }

    #[tokio::test]
    async fn abort_turns_into_provider_error() {
        let gateway = MockGateway::new();
        gateway.push_text_step("never delivered");

        let ctx = RunContext::new();
        ctx.abort();
        let provider = ProviderConfig::new("mock", "test");
        let mut stream = gateway
            .stream_completion(&ctx, &provider, request())
            .await
            .unwrap();

        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn exhausted_script_errors() {
        let gateway = MockGateway::new();
        let ctx = RunContext::new();
        let provider = ProviderConfig::new("mock", "test");
        assert!(
            gateway
                .stream_completion(&ctx, &provider, request())
                .await
                .is_err()
        );
    }
}
