//! One LLM step: open a streaming completion, surface allowed events, and
//! accumulate the normalized step aggregate.
//!
//! Emission and accumulation are orthogonal: a consumer that filters out every
//! configurable event still receives a correct aggregate, because parts are
//! folded into the aggregate before the filter is consulted.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use tracing::debug;

use crate::completion::{
    CompletionRequest, CompletionsGateway, ProviderConfig, ToolChoice, ToolDescriptor,
};
use crate::context::RunContext;
use crate::error::Result;
use crate::event::{AgentEvent, EventKind, EventPayload};
use crate::manifest::StreamingConfig;
use crate::message::Message;
use crate::stream::{FinishReason, StreamPart};
use crate::suspension::Suspension;
use crate::tool::ToolCall;
use crate::usage::Usage;

/// Inputs for one streamed step.
pub(crate) struct StepRequest {
    pub gateway: Arc<dyn CompletionsGateway>,
    pub ctx: RunContext,
    pub provider: ProviderConfig,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDescriptor>,
    pub tool_choice: Option<ToolChoice>,
    pub active_tools: Option<Vec<String>>,
    pub streaming: StreamingConfig,
    pub step_number: u32,
    pub manifest_id: String,
    pub parent_manifest_id: Option<String>,
}

/// Normalized aggregate of one step.
#[derive(Debug, Default)]
pub(crate) struct StepAggregate {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub approval_requests: Vec<Suspension>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

/// One item of a step stream: events while streaming, then the terminal
/// aggregate (or the first provider error).
pub(crate) enum StepItem {
    Event(AgentEvent),
    Done(Result<StepAggregate>),
}

/// Drive one LLM step.
pub(crate) fn stream_step(req: StepRequest) -> impl Stream<Item = StepItem> + Send {
    async_stream::stream! {
        let request = CompletionRequest {
            messages: req.messages,
            tools: req.tools,
            stop_after_steps: 1,
            tool_choice: req.tool_choice,
            active_tools: req.active_tools,
        };

        let mut parts = match req
            .gateway
            .stream_completion(&req.ctx, &req.provider, request)
            .await
        {
            Ok(parts) => parts,
            Err(e) => {
                yield StepItem::Done(Err(e));
                return;
            }
        };

        let mut aggregate = StepAggregate::default();

        while let Some(part) = parts.next().await {
            let part = match part {
                Ok(part) => part,
                Err(e) => {
                    // First provider error is the terminal value; no partial
                    // success.
                    yield StepItem::Done(Err(e));
                    return;
                }
            };

            match part {
                StreamPart::TextDelta { delta } => {
                    aggregate.text.push_str(&delta);
                    if req.streaming.allows(EventKind::TextDelta) {
                        yield StepItem::Event(AgentEvent::now(
                            req.manifest_id.clone(),
                            req.parent_manifest_id.clone(),
                            req.step_number,
                            EventPayload::TextDelta { delta },
                        ));
                    }
                }
                StreamPart::ToolCall { tool_call } => {
                    aggregate.tool_calls.push(tool_call.clone());
                    if req.streaming.allows(EventKind::ToolCall) {
                        yield StepItem::Event(AgentEvent::now(
                            req.manifest_id.clone(),
                            req.parent_manifest_id.clone(),
                            req.step_number,
                            EventPayload::ToolCall { tool_call },
                        ));
                    }
                }
                StreamPart::ToolApprovalRequest {
                    approval_id,
                    tool_call_id,
                    tool_name,
                    tool_args,
                    description,
                } => {
                    aggregate.approval_requests.push(Suspension::tool_approval(
                        approval_id,
                        tool_call_id,
                        tool_name,
                        tool_args,
                        description,
                    ));
                }
                StreamPart::FinishStep {
                    finish_reason,
                    usage,
                } => {
                    aggregate.finish_reason = finish_reason;
                    aggregate.usage = usage;
                }
                StreamPart::Other => {
                    debug!(step = req.step_number, "Skipping uninterpreted stream part");
                }
            }
        }

        yield StepItem::Done(Ok(aggregate));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::MockGateway;
    use crate::event::EventKind;
    use crate::manifest::StreamingConfig;
    use serde_json::json;

    fn request(gateway: Arc<MockGateway>, streaming: StreamingConfig) -> StepRequest {
        StepRequest {
            gateway,
            ctx: RunContext::new(),
            provider: ProviderConfig::new("mock", "test"),
            messages: vec![Message::user("hi")],
            tools: Vec::new(),
            tool_choice: None,
            active_tools: None,
            streaming,
            step_number: 1,
            manifest_id: "m".into(),
            parent_manifest_id: None,
        }
    }

    async fn drive(req: StepRequest) -> (Vec<AgentEvent>, Result<StepAggregate>) {
        let stream = stream_step(req);
        futures::pin_mut!(stream);
        let mut events = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                StepItem::Event(event) => events.push(event),
                StepItem::Done(result) => return (events, result),
            }
        }
        panic!("step stream ended without terminal value");
    }

    #[tokio::test]
    async fn accumulates_and_emits() {
        let gateway = Arc::new(MockGateway::new());
        gateway.push_parts(vec![
            StreamPart::text_delta("hel"),
            StreamPart::text_delta("lo"),
            StreamPart::tool_call(ToolCall::new("c1", "echo", json!({"x": 1}))),
            StreamPart::finish(FinishReason::ToolCalls, Usage::new(7, 3)),
        ]);

        let (events, result) = drive(request(gateway, StreamingConfig::default())).await;
        let aggregate = result.unwrap();

        assert_eq!(aggregate.text, "hello");
        assert_eq!(aggregate.tool_calls.len(), 1);
        assert_eq!(aggregate.finish_reason, FinishReason::ToolCalls);
        assert_eq!(aggregate.usage, Usage::new(7, 3));

        let kinds: Vec<EventKind> = events.iter().map(AgentEvent::kind).collect();
        assert_eq!(
            kinds,
            [EventKind::TextDelta, EventKind::TextDelta, EventKind::ToolCall]
        );
    }

    #[tokio::test]
    async fn filtering_does_not_affect_aggregate() {
        let gateway = Arc::new(MockGateway::new());
        gateway.push_parts(vec![
            StreamPart::text_delta("quiet"),
            StreamPart::tool_call(ToolCall::new("c1", "echo", json!({}))),
            StreamPart::finish(FinishReason::ToolCalls, Usage::new(1, 1)),
        ]);

        let (events, result) =
            drive(request(gateway, StreamingConfig::only([EventKind::StepFinish]))).await;
        let aggregate = result.unwrap();

        assert!(events.is_empty());
        assert_eq!(aggregate.text, "quiet");
        assert_eq!(aggregate.tool_calls.len(), 1);
    }

    #[tokio::test]
    async fn approval_requests_are_accumulated_not_emitted() {
        let gateway = Arc::new(MockGateway::new());
        gateway.push_approval_step("A1", "c1", "delete", json!({"path": "/x"}), "delete /x");

        let (events, result) = drive(request(gateway, StreamingConfig::default())).await;
        let aggregate = result.unwrap();

        assert_eq!(aggregate.approval_requests.len(), 1);
        assert_eq!(aggregate.approval_requests[0].approval_id(), "A1");
        // Only the tool-call event; approval requests carry no configurable
        // event kind.
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::ToolCall);
    }

    #[tokio::test]
    async fn first_provider_error_is_terminal() {
        let gateway = Arc::new(MockGateway::new());
        gateway.push_error(vec![StreamPart::text_delta("partial")], "stream broke");

        let (events, result) = drive(request(gateway, StreamingConfig::default())).await;
        assert_eq!(events.len(), 1);
        assert_eq!(result.unwrap_err().code(), "provider_error");
    }
}
