//! The step loop: the decision machine driving a run to a terminal value.
//!
//! Per iteration, in order: cancellation check, timeout check, step-start
//! hook, step stream, approval gate, tool dispatch, tool-result events,
//! sub-agent suspension check, output-tool validation, step record,
//! step-finish hook, stop conditions, message append. The loop owns the
//! working state and hands it back inside its terminal [`LoopResult`].

use std::sync::Arc;
use std::time::Instant;

use futures::{Stream, StreamExt};
use serde_json::json;
use tracing::{debug, warn};

use super::Services;
use super::dispatcher::{DispatchItem, DispatchOutcome, dispatch_tools};
use super::result::LoopResult;
use super::streamer::{StepAggregate, StepItem, StepRequest, stream_step};
use crate::completion::ToolDescriptor;
use crate::context::RunContext;
use crate::error::Error;
use crate::event::{AgentEvent, EventKind, EventPayload};
use crate::hooks::HookContext;
use crate::manifest::{AgentManifest, StopCondition, TextOnlyPolicy};
use crate::message::Message;
use crate::state::{AgentRunState, StepRecord};
use crate::stream::FinishReason;
use crate::tool::{ExecutionContext, ToolCall, ToolResultPart, ToolSet};

/// One item of the loop's output stream.
pub(crate) enum LoopItem {
    Event(AgentEvent),
    Done(LoopResult),
}

/// Inputs of one loop invocation.
pub(crate) struct LoopParams {
    pub services: Services,
    pub manifest: Arc<AgentManifest>,
    /// Executors for dispatch, including sub-agent tools.
    pub tools: ToolSet,
    /// Model-facing tool listing, including the output tool.
    pub descriptors: Vec<ToolDescriptor>,
    pub state: Box<AgentRunState>,
    pub ctx: RunContext,
    pub parent_manifest_id: Option<String>,
    /// Execution time accumulated by previous envelope invocations.
    pub previous_elapsed_ms: u64,
    /// Monotonic start of this invocation.
    pub start: Instant,
}

/// Drive the loop to a terminal [`LoopResult`].
pub(crate) fn run_step_loop(params: LoopParams) -> impl Stream<Item = LoopItem> + Send {
    async_stream::stream! {
        let LoopParams {
            services,
            manifest,
            tools,
            descriptors,
            mut state,
            ctx,
            parent_manifest_id,
            previous_elapsed_ms,
            start,
        } = params;

        loop {
            // Cancellation: the abort flag is the source of truth; the
            // cancellation store is folded into it at iteration boundaries so
            // external operators can reach a running executor.
            if !ctx.is_aborted() {
                match services.cancellations.get(&ctx, &state.run_id).await {
                    Ok(true) => ctx.abort(),
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, run = %state.run_id, "Cancellation store lookup failed"),
                }
            }
            if ctx.is_aborted() {
                yield LoopItem::Done(LoopResult::Cancelled { final_state: state });
                return;
            }

            // Timeout, accumulated across resumes.
            let elapsed_ms = previous_elapsed_ms
                + u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
            if elapsed_ms > state.timeout_ms {
                yield LoopItem::Done(LoopResult::Error {
                    error: Error::Timeout {
                        elapsed_ms,
                        timeout_ms: state.timeout_ms,
                    },
                    final_state: state,
                });
                return;
            }

            state.current_step_number += 1;
            let step_number = state.current_step_number;
            debug!(agent = %manifest.id, step = step_number, "Starting step");

            let overrides = match manifest
                .hooks
                .fire_step_start(hook_ctx(&state, &manifest, step_number))
                .await
            {
                Ok(overrides) => overrides,
                Err(error) => {
                    yield LoopItem::Done(LoopResult::Error { error, final_state: state });
                    return;
                }
            };
            let mut tool_choice = None;
            let mut active_tools = None;
            if let Some(overrides) = overrides {
                if let Some(messages) = overrides.messages {
                    state.messages = messages;
                }
                tool_choice = overrides.tool_choice;
                active_tools = overrides.active_tools;
            }

            if manifest.streaming.allows(EventKind::StepStart) {
                yield LoopItem::Event(AgentEvent::now(
                    manifest.id.clone(),
                    parent_manifest_id.clone(),
                    step_number,
                    EventPayload::StepStart,
                ));
            }

            // Stream the LLM step.
            let step_stream = stream_step(StepRequest {
                gateway: Arc::clone(&services.gateway),
                ctx: ctx.clone(),
                provider: manifest.provider.clone(),
                messages: state.messages.clone(),
                tools: descriptors.clone(),
                tool_choice,
                active_tools,
                streaming: manifest.streaming.clone(),
                step_number,
                manifest_id: manifest.id.clone(),
                parent_manifest_id: parent_manifest_id.clone(),
            });
            futures::pin_mut!(step_stream);
            let mut terminal = None;
            while let Some(item) = step_stream.next().await {
                match item {
                    StepItem::Event(event) => yield LoopItem::Event(event),
                    StepItem::Done(result) => terminal = Some(result),
                }
            }
            let aggregate = match terminal {
                Some(Ok(aggregate)) => aggregate,
                Some(Err(error)) => {
                    // A provider failure while aborted is a cancellation, not
                    // an error.
                    if ctx.is_aborted() {
                        yield LoopItem::Done(LoopResult::Cancelled { final_state: state });
                    } else {
                        yield LoopItem::Done(LoopResult::Error { error, final_state: state });
                    }
                    return;
                }
                None => {
                    yield LoopItem::Done(LoopResult::Error {
                        error: Error::internal("step stream ended without a terminal value"),
                        final_state: state,
                    });
                    return;
                }
            };

            // Approval gate: persist the iteration's assistant record without
            // any tool results and suspend.
            if !aggregate.approval_requests.is_empty() {
                if let Some(message) = assistant_message(&aggregate) {
                    state.messages.push(message);
                }
                state.touch();
                yield LoopItem::Done(LoopResult::Suspended {
                    suspensions: aggregate.approval_requests,
                    branches: Vec::new(),
                    completed_tool_results: Vec::new(),
                    final_state: state,
                });
                return;
            }

            // Dispatch the step's executable calls. Output-tool calls are
            // virtual and validated below instead of dispatched.
            let output_tool_name = manifest
                .output_tool
                .as_ref()
                .map(|spec| spec.definition.name.clone());
            let (output_calls, exec_calls): (Vec<ToolCall>, Vec<ToolCall>) =
                aggregate.tool_calls.iter().cloned().partition(|call| {
                    Some(&call.tool_name) == output_tool_name.as_ref()
                });

            let dispatch = dispatch_tools(
                exec_calls,
                tools.clone(),
                ExecutionContext {
                    ctx: ctx.clone(),
                    state_id: state.run_id.clone(),
                    manifest_id: manifest.id.clone(),
                    parent_manifest_id: parent_manifest_id.clone(),
                    step_number,
                    messages: Arc::new(state.messages.clone()),
                },
            );
            futures::pin_mut!(dispatch);
            let mut verdict = None;
            while let Some(item) = dispatch.next().await {
                match item {
                    DispatchItem::Event(event) => yield LoopItem::Event(event),
                    DispatchItem::Done(outcome) => verdict = Some(outcome),
                }
            }
            let verdict = verdict.unwrap_or(DispatchOutcome::Completed {
                results: Vec::new(),
            });

            // Configurable tool-result events cover completed calls only,
            // never suspended branches.
            let completed = match &verdict {
                DispatchOutcome::Completed { results } => results.clone(),
                DispatchOutcome::Suspended {
                    completed_results, ..
                } => completed_results.clone(),
            };
            if manifest.streaming.allows(EventKind::ToolResult) {
                for tool_result in &completed {
                    yield LoopItem::Event(AgentEvent::now(
                        manifest.id.clone(),
                        parent_manifest_id.clone(),
                        step_number,
                        EventPayload::ToolResult {
                            tool_result: tool_result.clone(),
                        },
                    ));
                }
            }

            // Sub-agent suspension: the completed peers stay out of the
            // message stream and ride along for replay on resume.
            if let DispatchOutcome::Suspended {
                branches,
                completed_results,
            } = verdict
            {
                if let Some(message) = assistant_message(&aggregate) {
                    state.messages.push(message);
                }
                state.touch();
                yield LoopItem::Done(LoopResult::Suspended {
                    suspensions: Vec::new(),
                    branches,
                    completed_tool_results: completed_results,
                    final_state: state,
                });
                return;
            }
            let mut results = completed;

            // Output-tool validation.
            if let (Some(spec), Some(call)) =
                (manifest.output_tool.as_ref(), output_calls.first())
            {
                match spec.validate(&call.args) {
                    Ok(()) => {
                        let recorded = ToolResultPart::success(
                            &call.id,
                            &call.tool_name,
                            json!({"status": "recorded"}),
                        );
                        if manifest.streaming.allows(EventKind::ToolResult) {
                            yield LoopItem::Event(AgentEvent::now(
                                manifest.id.clone(),
                                parent_manifest_id.clone(),
                                step_number,
                                EventPayload::ToolResult {
                                    tool_result: recorded.clone(),
                                },
                            ));
                        }
                        results.push(recorded);
                    }
                    Err(reason) => {
                        if state.output_validation_retries >= spec.max_retries {
                            let retries = state.output_validation_retries;
                            yield LoopItem::Done(LoopResult::Error {
                                error: Error::OutputValidation {
                                    retries,
                                    message: reason,
                                },
                                final_state: state,
                            });
                            return;
                        }
                        state.output_validation_retries += 1;
                        results.push(ToolResultPart::error(
                            &call.id,
                            &call.tool_name,
                            format!("invalid arguments: {reason}"),
                        ));
                        if let Some(message) = assistant_message(&aggregate) {
                            state.messages.push(message);
                        }
                        state.messages.push(Message::tool_results(results));
                        state.messages.push(Message::user(format!(
                            "The '{name}' arguments were invalid: {reason}. \
                             Call '{name}' again with corrected arguments.",
                            name = call.tool_name,
                        )));
                        state.touch();
                        continue;
                    }
                }
            }

            // Record the step.
            let record = StepRecord {
                step_number,
                text: (!aggregate.text.is_empty()).then(|| aggregate.text.clone()),
                tool_calls: aggregate.tool_calls.clone(),
                tool_results: results.clone(),
                finish_reason: aggregate.finish_reason,
                usage: aggregate.usage,
            };
            state.steps.push(record.clone());

            if manifest.streaming.allows(EventKind::StepFinish) {
                yield LoopItem::Event(AgentEvent::now(
                    manifest.id.clone(),
                    parent_manifest_id.clone(),
                    step_number,
                    EventPayload::StepFinish {
                        finish_reason: Some(aggregate.finish_reason),
                        usage: Some(aggregate.usage),
                    },
                ));
            }

            if let Err(error) = manifest
                .hooks
                .fire_step_finish(hook_ctx(&state, &manifest, step_number), record)
                .await
            {
                yield LoopItem::Done(LoopResult::Error { error, final_state: state });
                return;
            }

            // Append the iteration messages. The final step's reply lands in
            // the conversation too, so a later reply input can continue it.
            if let Some(message) = assistant_message(&aggregate) {
                state.messages.push(message);
            }
            if !results.is_empty() {
                state.messages.push(Message::tool_results(results));
            }
            state.touch();

            if stop_condition_fires(&manifest, step_number, &aggregate) {
                let result = build_agent_result(&manifest, &state.steps);
                debug!(agent = %manifest.id, steps = step_number, "Stop condition fired");
                yield LoopItem::Done(LoopResult::Complete {
                    result,
                    final_state: state,
                });
                return;
            }
        }
    }
}

fn hook_ctx(state: &AgentRunState, manifest: &AgentManifest, step_number: u32) -> HookContext {
    HookContext {
        run_id: state.run_id.clone(),
        manifest_id: manifest.id.clone(),
        step_number,
    }
}

/// The assistant record of one iteration: text plus tool-call parts, without
/// results.
fn assistant_message(aggregate: &StepAggregate) -> Option<Message> {
    let text = (!aggregate.text.is_empty()).then(|| aggregate.text.clone());
    if text.is_none() && aggregate.tool_calls.is_empty() {
        return None;
    }
    Some(Message::assistant_with_tool_calls(
        text,
        aggregate.tool_calls.clone(),
    ))
}

fn stop_condition_fires(
    manifest: &AgentManifest,
    step_number: u32,
    aggregate: &StepAggregate,
) -> bool {
    for condition in &manifest.stop_when {
        match condition {
            StopCondition::StepCount(count) => {
                if step_number >= *count {
                    return true;
                }
            }
            StopCondition::ToolUsed(name) => {
                if aggregate.tool_calls.iter().any(|c| c.tool_name == *name) {
                    return true;
                }
            }
        }
    }
    aggregate.finish_reason == FinishReason::Stop
        && aggregate.tool_calls.is_empty()
        && manifest.on_text_only == TextOnlyPolicy::Stop
}

/// Assemble the run's final value from its recorded steps.
fn build_agent_result(manifest: &AgentManifest, steps: &[StepRecord]) -> serde_json::Value {
    if let Some(spec) = &manifest.output_tool {
        for step in steps.iter().rev() {
            if let Some(call) = step
                .tool_calls
                .iter()
                .find(|c| c.tool_name == spec.definition.name)
            {
                return call.args.clone();
            }
        }
    }
    steps
        .iter()
        .rev()
        .find_map(|step| step.text.clone())
        .map_or(serde_json::Value::Null, serde_json::Value::String)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{AgentManifest, OutputToolSpec, StopCondition, TextOnlyPolicy};
    use crate::tool::ToolDefinition;
    use crate::usage::Usage;
    use serde_json::json;

    fn aggregate(
        text: &str,
        tool_calls: Vec<ToolCall>,
        finish_reason: FinishReason,
    ) -> StepAggregate {
        StepAggregate {
            text: text.to_owned(),
            tool_calls,
            approval_requests: Vec::new(),
            finish_reason,
            usage: Usage::zero(),
        }
    }

    #[test]
    fn step_count_stop() {
        let manifest = AgentManifest::builder("m", "1")
            .stop_when(StopCondition::StepCount(2))
            .build();
        let agg = aggregate("", vec![ToolCall::new("c", "echo", json!({}))], FinishReason::ToolCalls);
        assert!(!stop_condition_fires(&manifest, 1, &agg));
        assert!(stop_condition_fires(&manifest, 2, &agg));
    }

    #[test]
    fn tool_used_stop() {
        let manifest = AgentManifest::builder("m", "1")
            .stop_when(StopCondition::ToolUsed("report".into()))
            .build();
        let hit = aggregate("", vec![ToolCall::new("c", "report", json!({}))], FinishReason::ToolCalls);
        let miss = aggregate("", vec![ToolCall::new("c", "echo", json!({}))], FinishReason::ToolCalls);
        assert!(stop_condition_fires(&manifest, 1, &hit));
        assert!(!stop_condition_fires(&manifest, 1, &miss));
    }

    #[test]
    fn text_only_policy() {
        let stopping = AgentManifest::builder("m", "1").build();
        let looping = AgentManifest::builder("m", "1")
            .on_text_only(TextOnlyPolicy::Continue)
            .build();
        let text_only = aggregate("done", Vec::new(), FinishReason::Stop);
        assert!(stop_condition_fires(&stopping, 1, &text_only));
        assert!(!stop_condition_fires(&looping, 1, &text_only));
    }

    #[test]
    fn result_prefers_output_tool_args() {
        let manifest = AgentManifest::builder("m", "1")
            .output_tool(OutputToolSpec::new(ToolDefinition::new(
                "report",
                "final report",
                json!({"type": "object"}),
            )))
            .build();
        let steps = vec![
            StepRecord {
                step_number: 1,
                text: Some("thinking".into()),
                tool_calls: vec![ToolCall::new("c1", "echo", json!({}))],
                tool_results: Vec::new(),
                finish_reason: FinishReason::ToolCalls,
                usage: Usage::zero(),
            },
            StepRecord {
                step_number: 2,
                text: None,
                tool_calls: vec![ToolCall::new("c2", "report", json!({"title": "done"}))],
                tool_results: Vec::new(),
                finish_reason: FinishReason::ToolCalls,
                usage: Usage::zero(),
            },
        ];
        assert_eq!(build_agent_result(&manifest, &steps), json!({"title": "done"}));
    }

    #[test]
    fn result_falls_back_to_last_text() {
        let manifest = AgentManifest::builder("m", "1").build();
        let steps = vec![StepRecord {
            step_number: 1,
            text: Some("the answer".into()),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            finish_reason: FinishReason::Stop,
            usage: Usage::zero(),
        }];
        assert_eq!(build_agent_result(&manifest, &steps), json!("the answer"));
    }

    #[test]
    fn empty_aggregate_yields_no_assistant_message() {
        let agg = aggregate("", Vec::new(), FinishReason::Stop);
        assert!(assistant_message(&agg).is_none());
        let with_text = aggregate("hi", Vec::new(), FinishReason::Stop);
        assert!(assistant_message(&with_text).is_some());
    }
}
