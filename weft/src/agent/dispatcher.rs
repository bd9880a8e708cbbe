//! Parallel tool dispatch with fair event interleaving.
//!
//! Every tool call of a step runs as its own task. Their event streams are
//! merged first-to-arrive: each live producer has exactly one in-flight read,
//! re-armed after every yield, so no producer can starve the others or force
//! unbounded buffering. Outbound event order is arrival order; terminal result
//! order is the original call order.

use std::pin::Pin;

use futures::stream::SelectAll;
use futures::{Stream, StreamExt};
use tracing::debug;

use crate::event::AgentEvent;
use crate::suspension::SuspendedBranch;
use crate::tool::{
    AgentToolResult, ExecutionContext, ToolCall, ToolItem, ToolOutput, ToolResultPart, ToolSet,
    ToolStream,
};

/// Verdict of dispatching one step's tool calls.
#[derive(Debug)]
pub(crate) enum DispatchOutcome {
    /// Every call ran to a model-visible result.
    Completed { results: Vec<ToolResultPart> },
    /// At least one call suspended inside a sub-agent.
    Suspended {
        /// The suspended branches, in call order.
        branches: Vec<SuspendedBranch>,
        /// Results of the calls that did complete, in call order, so the
        /// model can be fed back deterministically on resume.
        completed_results: Vec<ToolResultPart>,
    },
}

/// One item of a dispatch stream.
pub(crate) enum DispatchItem {
    Event(AgentEvent),
    Done(DispatchOutcome),
}

type TaggedStream = Pin<Box<dyn Stream<Item = (usize, ToolItem)> + Send>>;

/// Run all tool calls of a step in parallel.
pub(crate) fn dispatch_tools(
    tool_calls: Vec<ToolCall>,
    tools: ToolSet,
    exec: ExecutionContext,
) -> impl Stream<Item = DispatchItem> + Send {
    async_stream::stream! {
        if tool_calls.is_empty() {
            yield DispatchItem::Done(DispatchOutcome::Completed {
                results: Vec::new(),
            });
            return;
        }

        let mut merged: SelectAll<TaggedStream> = SelectAll::new();
        for (index, call) in tool_calls.iter().enumerate() {
            let producer: ToolStream = match tools.get(&call.tool_name) {
                Some(tool) => tool.execute(call.clone(), exec.clone()),
                None => {
                    debug!(tool = %call.tool_name, "Unknown tool requested");
                    unknown_tool_stream(call.clone())
                }
            };
            merged.push(Box::pin(producer.map(move |item| (index, item))));
        }

        let mut outcomes: Vec<Option<AgentToolResult>> = vec![None; tool_calls.len()];
        while let Some((index, item)) = merged.next().await {
            match item {
                ToolItem::Event(event) => yield DispatchItem::Event(event),
                ToolItem::Done(result) => outcomes[index] = Some(result),
            }
        }

        let mut results = Vec::new();
        let mut branches = Vec::new();
        for (call, outcome) in tool_calls.iter().zip(outcomes.into_iter()) {
            match outcome {
                Some(AgentToolResult::Success { value }) => {
                    results.push(ToolResultPart::success(&call.id, &call.tool_name, value));
                }
                Some(AgentToolResult::Error {
                    error,
                    code,
                    retryable,
                }) => {
                    results.push(ToolResultPart {
                        tool_call_id: call.id.clone(),
                        tool_name: call.tool_name.clone(),
                        output: ToolOutput::Error {
                            message: error,
                            code,
                            retryable,
                        },
                    });
                }
                Some(AgentToolResult::Suspended {
                    run_id,
                    manifest_id,
                    manifest_version,
                    suspensions,
                    child_stacks,
                }) => {
                    branches.push(SuspendedBranch {
                        tool_call_id: call.id.clone(),
                        child_state_id: run_id,
                        child_manifest_id: manifest_id,
                        child_manifest_version: manifest_version,
                        suspensions,
                        child_stacks,
                    });
                }
                None => {
                    results.push(ToolResultPart::error(
                        &call.id,
                        &call.tool_name,
                        "tool stream ended without a result",
                    ));
                }
            }
        }

        if branches.is_empty() {
            yield DispatchItem::Done(DispatchOutcome::Completed { results });
        } else {
            yield DispatchItem::Done(DispatchOutcome::Suspended {
                branches,
                completed_results: results,
            });
        }
    }
}

fn unknown_tool_stream(call: ToolCall) -> ToolStream {
    Box::pin(async_stream::stream! {
        yield ToolItem::Done(AgentToolResult::Error {
            error: format!("unknown tool '{}'", call.tool_name),
            code: Some("unknown_tool".to_owned()),
            retryable: false,
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{AgentRunId, RunContext};
    use crate::event::EventPayload;
    use crate::tool::{AgentTool, FnTool, ToolDefinition};
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::time::Duration;

    fn exec() -> ExecutionContext {
        ExecutionContext {
            ctx: RunContext::new(),
            state_id: AgentRunId::from("run-1"),
            manifest_id: "m".into(),
            parent_manifest_id: None,
            step_number: 1,
            messages: Arc::new(Vec::new()),
        }
    }

    fn echo_tool() -> Arc<dyn AgentTool> {
        Arc::new(FnTool::new(
            ToolDefinition::new("echo", "echo back", json!({"type": "object"})),
            |args| async move { Ok(args["x"].clone()) },
        ))
    }

    /// Tool that emits N events spaced by a delay, then returns its name.
    struct ChattyTool {
        name: String,
        events: usize,
        delay: Duration,
    }

    impl AgentTool for ChattyTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new(&self.name, "chatty", json!({"type": "object"}))
        }

        fn execute(&self, _call: ToolCall, exec: ExecutionContext) -> ToolStream {
            let name = self.name.clone();
            let events = self.events;
            let delay = self.delay;
            Box::pin(async_stream::stream! {
                for i in 0..events {
                    tokio::time::sleep(delay).await;
                    yield ToolItem::Event(AgentEvent::now(
                        exec.manifest_id.clone(),
                        None,
                        exec.step_number,
                        EventPayload::TextDelta { delta: format!("{name}-{i}") },
                    ));
                }
                yield ToolItem::Done(AgentToolResult::success(Value::String(name)));
            })
        }
    }

    async fn drive(
        calls: Vec<ToolCall>,
        tools: ToolSet,
    ) -> (Vec<AgentEvent>, DispatchOutcome) {
        let stream = dispatch_tools(calls, tools, exec());
        futures::pin_mut!(stream);
        let mut events = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                DispatchItem::Event(event) => events.push(event),
                DispatchItem::Done(outcome) => return (events, outcome),
            }
        }
        panic!("dispatch stream ended without terminal value");
    }

    #[tokio::test]
    async fn empty_calls_complete_immediately() {
        let (events, outcome) = drive(Vec::new(), ToolSet::new()).await;
        assert!(events.is_empty());
        match outcome {
            DispatchOutcome::Completed { results } => assert!(results.is_empty()),
            DispatchOutcome::Suspended { .. } => panic!("unexpected suspension"),
        }
    }

    #[tokio::test]
    async fn results_keep_call_order_even_when_finish_order_differs() {
        let tools = ToolSet::new()
            .with(Arc::new(ChattyTool {
                name: "slow".into(),
                events: 2,
                delay: Duration::from_millis(30),
            }))
            .with(Arc::new(ChattyTool {
                name: "fast".into(),
                events: 1,
                delay: Duration::from_millis(1),
            }));

        let (events, outcome) = drive(
            vec![
                ToolCall::new("c1", "slow", json!({})),
                ToolCall::new("c2", "fast", json!({})),
            ],
            tools,
        )
        .await;

        // The fast tool's event arrives before the slow tool's first event.
        let first_delta = match &events[0].payload {
            EventPayload::TextDelta { delta } => delta.clone(),
            other => panic!("unexpected payload: {other:?}"),
        };
        assert_eq!(first_delta, "fast-0");

        // Terminal results are in call order regardless.
        match outcome {
            DispatchOutcome::Completed { results } => {
                assert_eq!(results[0].tool_call_id, "c1");
                assert_eq!(results[1].tool_call_id, "c2");
            }
            DispatchOutcome::Suspended { .. } => panic!("unexpected suspension"),
        }
    }

    #[tokio::test]
    async fn unknown_tool_becomes_error_result() {
        let (_, outcome) = drive(
            vec![ToolCall::new("c1", "ghost", json!({}))],
            ToolSet::new().with(echo_tool()),
        )
        .await;
        match outcome {
            DispatchOutcome::Completed { results } => match &results[0].output {
                ToolOutput::Error { code, .. } => {
                    assert_eq!(code.as_deref(), Some("unknown_tool"));
                }
                other => panic!("unexpected output: {other:?}"),
            },
            DispatchOutcome::Suspended { .. } => panic!("unexpected suspension"),
        }
    }

    #[tokio::test]
    async fn tool_error_is_data_not_failure() {
        let failing: Arc<dyn AgentTool> = Arc::new(FnTool::new(
            ToolDefinition::new("bomb", "fails", json!({"type": "object"})),
            |_| async move { Err("kaboom".to_owned()) },
        ));
        let (_, outcome) = drive(
            vec![
                ToolCall::new("c1", "bomb", json!({})),
                ToolCall::new("c2", "echo", json!({"x": 42})),
            ],
            ToolSet::new().with(failing).with(echo_tool()),
        )
        .await;

        match outcome {
            DispatchOutcome::Completed { results } => {
                assert!(matches!(results[0].output, ToolOutput::Error { .. }));
                assert!(results[1].is_success());
            }
            DispatchOutcome::Suspended { .. } => panic!("unexpected suspension"),
        }
    }

    /// Tool standing in for a sub-agent that suspends.
    struct SuspendingTool;

    impl AgentTool for SuspendingTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("approver", "suspends", json!({"type": "object"}))
        }

        fn execute(&self, _call: ToolCall, _exec: ExecutionContext) -> ToolStream {
            Box::pin(async_stream::stream! {
                yield ToolItem::Done(AgentToolResult::Suspended {
                    run_id: AgentRunId::from("child-1"),
                    manifest_id: "child".into(),
                    manifest_version: "1".into(),
                    suspensions: vec![crate::suspension::Suspension::tool_approval(
                        "A1", "inner-c1", "delete", json!({}), "inner delete",
                    )],
                    child_stacks: Vec::new(),
                });
            })
        }
    }

    #[tokio::test]
    async fn partial_suspension_keeps_completed_peers() {
        let tools = ToolSet::new()
            .with(Arc::new(SuspendingTool))
            .with(echo_tool());

        let (_, outcome) = drive(
            vec![
                ToolCall::new("c1", "echo", json!({"x": 42})),
                ToolCall::new("c2", "approver", json!({})),
            ],
            tools,
        )
        .await;

        match outcome {
            DispatchOutcome::Suspended {
                branches,
                completed_results,
            } => {
                assert_eq!(branches.len(), 1);
                assert_eq!(branches[0].tool_call_id, "c2");
                assert_eq!(branches[0].child_state_id, AgentRunId::from("child-1"));
                assert_eq!(completed_results.len(), 1);
                assert_eq!(completed_results[0].tool_call_id, "c1");
            }
            DispatchOutcome::Completed { .. } => panic!("expected suspension"),
        }
    }
}
