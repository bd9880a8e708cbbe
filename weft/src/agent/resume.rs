//! Resume preludes: the work a resumed run performs before re-entering its
//! step loop.
//!
//! Suspension stacks are data, not control flow. A leaf approval is resolved
//! by executing (or denying) the gated tool right here; an approval that
//! targets a descendant re-invokes the orchestrator on the persisted child
//! state id and folds the child's terminal value back into this frame as a
//! tool result. Either way the loop is re-entered only once no suspensions
//! remain on the frame.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use tracing::debug;

use super::orchestrator::Orchestrator;
use super::result::{AgentRunResult, RunItem};
use super::{AgentInput, ContinueResponse};
use crate::context::RunContext;
use crate::error::Error;
use crate::event::AgentEvent;
use crate::manifest::AgentManifest;
use crate::message::{ContentPart, Message, MessageContent};
use crate::state::AgentRunState;
use crate::suspension::{
    SuspendedBranch, Suspension, SuspensionStack, build_suspension_stacks,
};
use crate::tool::{
    AgentToolResult, ExecutionContext, ToolCall, ToolItem, ToolOutput, ToolResultPart, ToolSet,
};

/// What a resumed envelope must do before driving its loop.
pub(crate) enum ResumePrelude {
    /// Fresh run or reply; nothing to resolve.
    None,
    /// The approval targets this frame's own suspension.
    ResolveApproval {
        suspension: Suspension,
        approved: bool,
        reason: Option<String>,
    },
    /// The approval targets a descendant described by this stack.
    ResumeChild {
        stack: SuspensionStack,
        response: ContinueResponse,
    },
    /// Replay persisted pending tool results without an approval.
    ReplayPending,
}

/// One item of a prelude stream.
pub(crate) enum PreludeItem {
    Event(AgentEvent),
    Done(PreludeOutcome),
}

/// Terminal value of a prelude.
pub(crate) enum PreludeOutcome {
    /// The frame is whole again; drive the step loop.
    ContinueLoop(Box<AgentRunState>),
    /// Suspensions remain on the frame; finalize as suspended again. The
    /// state's `suspensions`, `suspension_stacks` and `pending_tool_results`
    /// are already up to date.
    SuspendAgain(Box<AgentRunState>),
    /// The prelude itself failed.
    Fail {
        error: Error,
        state: Box<AgentRunState>,
    },
}

/// Everything a prelude needs besides the state.
pub(crate) struct PreludeDeps {
    pub manifest: Arc<AgentManifest>,
    pub tools: ToolSet,
    pub orchestrator: Orchestrator,
    pub ctx: RunContext,
    pub parent_manifest_id: Option<String>,
}

/// Run a prelude against the working state.
pub(crate) fn run_prelude(
    prelude: ResumePrelude,
    state: Box<AgentRunState>,
    deps: PreludeDeps,
) -> impl Stream<Item = PreludeItem> + Send {
    async_stream::stream! {
        let mut state = state;
        match prelude {
            ResumePrelude::None => {
                yield PreludeItem::Done(PreludeOutcome::ContinueLoop(state));
            }

            ResumePrelude::ResolveApproval {
                suspension,
                approved,
                reason,
            } => {
                let Suspension::ToolApproval {
                    approval_id,
                    tool_call_id,
                    tool_name,
                    tool_args,
                    ..
                } = suspension;
                state
                    .suspensions
                    .retain(|s| s.approval_id() != approval_id);

                if approved {
                    debug!(tool = %tool_name, approval = %approval_id, "Approval granted, executing gated tool");
                    let Some(tool) = deps.tools.get(&tool_name).map(Arc::clone) else {
                        state.pending_tool_results.push(ToolResultPart::error(
                            &tool_call_id,
                            &tool_name,
                            "approved tool has no executor",
                        ));
                        yield PreludeItem::Done(settle(state));
                        return;
                    };

                    let exec = ExecutionContext {
                        ctx: deps.ctx.clone(),
                        state_id: state.run_id.clone(),
                        manifest_id: state.manifest_id.clone(),
                        parent_manifest_id: deps.parent_manifest_id.clone(),
                        step_number: state.current_step_number,
                        messages: Arc::new(state.messages.clone()),
                    };
                    let call = ToolCall::new(&tool_call_id, &tool_name, tool_args);
                    let mut producer = tool.execute(call, exec);

                    let mut terminal = None;
                    while let Some(item) = producer.next().await {
                        match item {
                            ToolItem::Event(event) => yield PreludeItem::Event(event),
                            ToolItem::Done(result) => terminal = Some(result),
                        }
                    }

                    match terminal {
                        Some(AgentToolResult::Success { value }) => {
                            state.pending_tool_results.push(ToolResultPart::success(
                                &tool_call_id,
                                &tool_name,
                                value,
                            ));
                        }
                        Some(AgentToolResult::Error {
                            error,
                            code,
                            retryable,
                        }) => {
                            state.pending_tool_results.push(ToolResultPart {
                                tool_call_id: tool_call_id.clone(),
                                tool_name: tool_name.clone(),
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
                            // The approved tool was itself a sub-agent that
                            // suspended; republish it as a branch of this
                            // frame.
                            let branch = SuspendedBranch {
                                tool_call_id: tool_call_id.clone(),
                                child_state_id: run_id,
                                child_manifest_id: manifest_id,
                                child_manifest_version: manifest_version,
                                suspensions,
                                child_stacks,
                            };
                            let stacks = build_suspension_stacks(
                                &state.manifest_id,
                                &state.manifest_version,
                                &state.run_id,
                                std::slice::from_ref(&branch),
                            );
                            if !state.child_state_ids.contains(&branch.child_state_id) {
                                state.child_state_ids.push(branch.child_state_id.clone());
                            }
                            state.suspension_stacks.extend(stacks);
                            yield PreludeItem::Done(PreludeOutcome::SuspendAgain(state));
                            return;
                        }
                        None => {
                            state.pending_tool_results.push(ToolResultPart::error(
                                &tool_call_id,
                                &tool_name,
                                "tool stream ended without a result",
                            ));
                        }
                    }
                } else {
                    debug!(tool = %tool_name, approval = %approval_id, "Approval rejected");
                    state.pending_tool_results.push(ToolResultPart::denied(
                        &tool_call_id,
                        &tool_name,
                        reason,
                    ));
                }

                yield PreludeItem::Done(settle(state));
            }

            ResumePrelude::ResumeChild { stack, response } => {
                let Some(pending_call_id) = stack
                    .agents
                    .first()
                    .and_then(|entry| entry.pending_tool_call_id.clone())
                else {
                    yield PreludeItem::Done(PreludeOutcome::Fail {
                        error: Error::internal("suspension stack has no pending tool call"),
                        state,
                    });
                    return;
                };
                let Some(child_entry) = stack.child_entry().cloned() else {
                    yield PreludeItem::Done(PreludeOutcome::Fail {
                        error: Error::internal("suspension stack has no child frame"),
                        state,
                    });
                    return;
                };

                // The stack is being acted on; drop it from the frame. Its
                // replacement (if the child re-suspends) is rebuilt below.
                let leaf_approval = stack.leaf_suspension.approval_id().to_owned();
                state
                    .suspension_stacks
                    .retain(|s| s.leaf_suspension.approval_id() != leaf_approval);

                let tool_name = find_tool_name(&state.messages, &pending_call_id)
                    .unwrap_or_else(|| child_entry.manifest_id.clone());

                debug!(
                    child = %child_entry.state_id,
                    approval = %leaf_approval,
                    "Resuming suspended descendant"
                );
                let mut child_run = deps.orchestrator.run(
                    deps.ctx.child(),
                    AgentInput::Approval {
                        run_id: child_entry.state_id.clone(),
                        response,
                    },
                );

                let mut terminal = None;
                while let Some(item) = child_run.next().await {
                    match item {
                        RunItem::Event(event) => yield PreludeItem::Event(event),
                        RunItem::Done(result) => terminal = Some(result),
                    }
                }

                match terminal {
                    Some(AgentRunResult::Complete { result, .. }) => {
                        state.pending_tool_results.push(ToolResultPart::success(
                            &pending_call_id,
                            &tool_name,
                            result,
                        ));
                    }
                    Some(AgentRunResult::Suspended {
                        suspensions,
                        suspension_stacks,
                        run_id,
                    }) => {
                        let branch = SuspendedBranch {
                            tool_call_id: pending_call_id,
                            child_state_id: run_id,
                            child_manifest_id: child_entry.manifest_id,
                            child_manifest_version: child_entry.manifest_version,
                            suspensions,
                            child_stacks: suspension_stacks,
                        };
                        let stacks = build_suspension_stacks(
                            &state.manifest_id,
                            &state.manifest_version,
                            &state.run_id,
                            std::slice::from_ref(&branch),
                        );
                        state.suspension_stacks.extend(stacks);
                        yield PreludeItem::Done(PreludeOutcome::SuspendAgain(state));
                        return;
                    }
                    Some(AgentRunResult::Cancelled { .. }) => {
                        state.pending_tool_results.push(ToolResultPart::error(
                            &pending_call_id,
                            &tool_name,
                            "sub-agent run was cancelled",
                        ));
                    }
                    Some(AgentRunResult::Error { error, .. }) => {
                        state.pending_tool_results.push(ToolResultPart::error(
                            &pending_call_id,
                            &tool_name,
                            format!("sub-agent run failed: {error}"),
                        ));
                    }
                    Some(AgentRunResult::AlreadyRunning { .. }) => {
                        state.pending_tool_results.push(ToolResultPart::error(
                            &pending_call_id,
                            &tool_name,
                            "sub-agent run is already being executed",
                        ));
                    }
                    None => {
                        state.pending_tool_results.push(ToolResultPart::error(
                            &pending_call_id,
                            &tool_name,
                            "sub-agent stream ended without a result",
                        ));
                    }
                }

                yield PreludeItem::Done(settle(state));
            }

            ResumePrelude::ReplayPending => {
                // No approval to wait on: splice what completed, surface what
                // did not, and hand the decision back to the model.
                let mut parts = std::mem::take(&mut state.pending_tool_results);
                for stack in std::mem::take(&mut state.suspension_stacks) {
                    if let Some(call_id) = stack
                        .agents
                        .first()
                        .and_then(|entry| entry.pending_tool_call_id.clone())
                    {
                        let tool_name = find_tool_name(&state.messages, &call_id)
                            .unwrap_or_else(|| "sub_agent".to_owned());
                        parts.push(ToolResultPart::error(
                            call_id,
                            tool_name,
                            "sub-agent result still pending",
                        ));
                    }
                }
                for suspension in std::mem::take(&mut state.suspensions) {
                    parts.push(ToolResultPart::error(
                        suspension.tool_call_id(),
                        suspension.tool_name(),
                        "approval still pending; the call was not executed",
                    ));
                }
                if !parts.is_empty() {
                    state.messages.push(Message::tool_results(parts));
                }
                state.touch();
                yield PreludeItem::Done(PreludeOutcome::ContinueLoop(state));
            }
        }
    }
}

/// Once nothing on the frame is waiting anymore, splice the accumulated
/// results into the conversation and continue; otherwise stay suspended.
fn settle(mut state: Box<AgentRunState>) -> PreludeOutcome {
    if state.suspensions.is_empty() && state.suspension_stacks.is_empty() {
        let parts = std::mem::take(&mut state.pending_tool_results);
        if !parts.is_empty() {
            state.messages.push(Message::tool_results(parts));
        }
        state.touch();
        PreludeOutcome::ContinueLoop(state)
    } else {
        state.touch();
        PreludeOutcome::SuspendAgain(state)
    }
}

/// Recover the tool name of a recorded call from the conversation.
fn find_tool_name(messages: &[Message], tool_call_id: &str) -> Option<String> {
    messages.iter().rev().find_map(|message| {
        let MessageContent::Parts(parts) = &message.content else {
            return None;
        };
        parts.iter().find_map(|part| match part {
            ContentPart::ToolCall { tool_call } if tool_call.id == tool_call_id => {
                Some(tool_call.tool_name.clone())
            }
            _ => None,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_name_recovered_from_conversation() {
        let messages = vec![
            Message::user("hi"),
            Message::assistant_with_tool_calls(
                None,
                vec![ToolCall::new("c9", "researcher", json!({"prompt": "dig"}))],
            ),
        ];
        assert_eq!(
            find_tool_name(&messages, "c9").as_deref(),
            Some("researcher")
        );
        assert!(find_tool_name(&messages, "c1").is_none());
    }
}
