//! The run envelope: one execution attempt of a run, bracketed by lock,
//! state, hooks, and lifecycle events.
//!
//! Order per attempt: acquire lock → create-or-update state → start/resume
//! hook → `agent-started` → resume prelude → step loop → clear cancellation →
//! finalize state → terminal hook → terminal event(s) → cleanup → release
//! lock. The lock is released on every exit path; a path that skips release
//! leaves the lock to its TTL.

use std::sync::Arc;
use std::time::Instant;

use futures::{Stream, StreamExt};
use tracing::{debug, info, warn};

use super::Services;
use super::orchestrator::Orchestrator;
use super::result::{AgentRunResult, LoopResult, RunItem};
use super::resume::{PreludeDeps, PreludeItem, PreludeOutcome, ResumePrelude, run_prelude};
use super::step_loop::{LoopItem, LoopParams, run_step_loop};
use crate::completion::ToolDescriptor;
use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::event::{AgentEvent, EventPayload};
use crate::hooks::HookContext;
use crate::manifest::AgentManifest;
use crate::state::{AgentRunState, RunStatus, offload_binary_parts};
use crate::store::RunLockHandle;
use crate::suspension::Suspension;
use crate::tool::ToolSet;

/// Inputs of one envelope invocation.
pub(crate) struct EnvelopeParams {
    pub services: Services,
    pub manifest: Arc<AgentManifest>,
    pub tools: ToolSet,
    pub descriptors: Vec<ToolDescriptor>,
    pub state: Box<AgentRunState>,
    pub is_new_state: bool,
    pub resolved_suspensions: Vec<Suspension>,
    pub prelude: ResumePrelude,
    pub orchestrator: Orchestrator,
    pub ctx: RunContext,
}

/// Drive one execution attempt.
pub(crate) fn run_envelope(params: EnvelopeParams) -> impl Stream<Item = RunItem> + Send {
    async_stream::stream! {
        let EnvelopeParams {
            services,
            manifest,
            tools,
            descriptors,
            mut state,
            is_new_state,
            resolved_suspensions,
            prelude,
            orchestrator,
            ctx,
        } = params;

        let run_id = state.run_id.clone();
        let parent_manifest_id = state
            .parent_context
            .as_ref()
            .map(|p| p.manifest_id.clone());

        // Lock first. A busy lock fires no hooks and emits no events.
        let lock = match services.locks.acquire(&ctx, &run_id).await {
            Ok(Some(handle)) => handle,
            Ok(None) => {
                info!(run = %run_id, agent = %manifest.id, "Run already being executed");
                yield RunItem::Done(AgentRunResult::AlreadyRunning { run_id });
                return;
            }
            Err(error) => {
                yield RunItem::Done(AgentRunResult::Error { error, run_id });
                return;
            }
        };

        let start = Instant::now();
        let previous_elapsed_ms = state.elapsed_execution_ms;

        info!(
            run = %run_id,
            agent = %manifest.id,
            resumed = !is_new_state,
            "Agent run started"
        );

        // Persist before hooks so hook-side lookups see the running state.
        state.mark_running();
        if let Err(error) = persist(&services, &ctx, &mut state).await {
            yield RunItem::Event(error_event(&manifest, parent_manifest_id.clone(), &state, &error));
            tools.cleanup().await;
            release(lock.as_ref()).await;
            yield RunItem::Done(AgentRunResult::Error { error, run_id });
            return;
        }

        let start_hook = if is_new_state {
            manifest
                .hooks
                .fire_agent_start(hook_ctx(&state, &manifest))
                .await
        } else {
            manifest
                .hooks
                .fire_agent_resume(hook_ctx(&state, &manifest), resolved_suspensions)
                .await
        };
        if let Err(error) = start_hook {
            state.status = RunStatus::Failed;
            state.touch();
            if let Err(e) = persist(&services, &ctx, &mut state).await {
                warn!(error = %e, run = %run_id, "State finalize failed after hook error");
            }
            yield RunItem::Event(error_event(&manifest, parent_manifest_id.clone(), &state, &error));
            tools.cleanup().await;
            release(lock.as_ref()).await;
            yield RunItem::Done(AgentRunResult::Error { error, run_id });
            return;
        }

        yield RunItem::Event(AgentEvent::now(
            manifest.id.clone(),
            parent_manifest_id.clone(),
            state.current_step_number,
            EventPayload::AgentStarted {
                state_id: run_id.clone(),
            },
        ));

        // Resume prelude: resolve approvals, re-enter descendants, or replay
        // pending results. A fresh run passes straight through.
        let prelude_stream = run_prelude(
            prelude,
            state,
            PreludeDeps {
                manifest: Arc::clone(&manifest),
                tools: tools.clone(),
                orchestrator,
                ctx: ctx.clone(),
                parent_manifest_id: parent_manifest_id.clone(),
            },
        );
        futures::pin_mut!(prelude_stream);
        let mut prelude_outcome = None;
        while let Some(item) = prelude_stream.next().await {
            match item {
                PreludeItem::Event(event) => yield RunItem::Event(event),
                PreludeItem::Done(outcome) => prelude_outcome = Some(outcome),
            }
        }

        let loop_result = match prelude_outcome {
            Some(PreludeOutcome::ContinueLoop(state)) => {
                let loop_stream = run_step_loop(LoopParams {
                    services: services.clone(),
                    manifest: Arc::clone(&manifest),
                    tools: tools.clone(),
                    descriptors,
                    state,
                    ctx: ctx.clone(),
                    parent_manifest_id: parent_manifest_id.clone(),
                    previous_elapsed_ms,
                    start,
                });
                futures::pin_mut!(loop_stream);
                let mut terminal = None;
                while let Some(item) = loop_stream.next().await {
                    match item {
                        LoopItem::Event(event) => yield RunItem::Event(event),
                        LoopItem::Done(result) => terminal = Some(result),
                    }
                }
                match terminal {
                    Some(result) => result,
                    None => {
                        // The loop always yields a terminal; reaching this arm
                        // is a bug, surfaced without a finalized state.
                        let error =
                            Error::internal("step loop ended without a terminal value");
                        yield RunItem::Event(AgentEvent::now(
                            manifest.id.clone(),
                            parent_manifest_id.clone(),
                            0,
                            EventPayload::AgentError {
                                code: error.code().to_owned(),
                                message: error.to_string(),
                            },
                        ));
                        tools.cleanup().await;
                        release(lock.as_ref()).await;
                        yield RunItem::Done(AgentRunResult::Error { error, run_id });
                        return;
                    }
                }
            }
            Some(PreludeOutcome::SuspendAgain(state)) => LoopResult::Suspended {
                suspensions: state.suspensions.clone(),
                branches: Vec::new(),
                completed_tool_results: state.pending_tool_results.clone(),
                final_state: state,
            },
            Some(PreludeOutcome::Fail { error, state }) => LoopResult::Error {
                error,
                final_state: state,
            },
            None => {
                let error = Error::internal("resume prelude ended without a terminal value");
                tools.cleanup().await;
                release(lock.as_ref()).await;
                yield RunItem::Done(AgentRunResult::Error { error, run_id });
                return;
            }
        };

        // Clear the cancellation signal; failures are logged and swallowed.
        if let Err(e) = services.cancellations.del(&ctx, &run_id).await {
            warn!(error = %e, run = %run_id, "Clearing cancellation signal failed");
        }

        // Finalize state from the loop's terminal value.
        let mut finalized = finalize_state(loop_result, previous_elapsed_ms, start);
        if let Err(persist_error) = persist_finalized(&services, &ctx, &mut finalized).await {
            yield RunItem::Event(error_event(
                &manifest,
                parent_manifest_id.clone(),
                finalized.state(),
                &persist_error,
            ));
            tools.cleanup().await;
            release(lock.as_ref()).await;
            yield RunItem::Done(AgentRunResult::Error {
                error: persist_error,
                run_id,
            });
            return;
        }

        // Terminal hook; state is already durable, so a hook failure is
        // surfaced as the envelope's error without losing the snapshot.
        let hook_result = match &finalized {
            Finalized::Complete { result, state } => {
                manifest
                    .hooks
                    .fire_agent_complete(hook_ctx(state, &manifest), result.clone())
                    .await
            }
            Finalized::Suspended { state } => {
                manifest
                    .hooks
                    .fire_agent_suspend(hook_ctx(state, &manifest), all_suspensions(state))
                    .await
            }
            Finalized::Cancelled { state } => {
                manifest
                    .hooks
                    .fire_agent_cancelled(hook_ctx(state, &manifest))
                    .await
            }
            Finalized::Error { error, state } => {
                manifest
                    .hooks
                    .fire_agent_error(hook_ctx(state, &manifest), error.to_string())
                    .await
            }
        };
        if let Err(hook_error) = hook_result {
            yield RunItem::Event(error_event(
                &manifest,
                parent_manifest_id.clone(),
                finalized.state(),
                &hook_error,
            ));
            tools.cleanup().await;
            release(lock.as_ref()).await;
            yield RunItem::Done(AgentRunResult::Error {
                error: hook_error,
                run_id,
            });
            return;
        }

        // Terminal event(s) and result.
        let result = match finalized {
            Finalized::Complete { result, state } => {
                info!(run = %run_id, agent = %manifest.id, steps = state.current_step_number, "Agent run completed");
                yield RunItem::Event(AgentEvent::now(
                    manifest.id.clone(),
                    parent_manifest_id.clone(),
                    state.current_step_number,
                    EventPayload::AgentDone {
                        result: result.clone(),
                    },
                ));
                AgentRunResult::Complete { result, run_id }
            }
            Finalized::Suspended { state } => {
                let suspensions = all_suspensions(&state);
                debug!(run = %run_id, count = suspensions.len(), "Agent run suspended");
                for suspension in &suspensions {
                    yield RunItem::Event(AgentEvent::now(
                        manifest.id.clone(),
                        parent_manifest_id.clone(),
                        state.current_step_number,
                        EventPayload::AgentSuspended {
                            suspension: suspension.clone(),
                            state_id: run_id.clone(),
                        },
                    ));
                }
                AgentRunResult::Suspended {
                    suspensions: state.suspensions.clone(),
                    suspension_stacks: state.suspension_stacks.clone(),
                    run_id,
                }
            }
            Finalized::Cancelled { state } => {
                info!(run = %run_id, agent = %manifest.id, "Agent run cancelled");
                yield RunItem::Event(AgentEvent::now(
                    manifest.id.clone(),
                    parent_manifest_id.clone(),
                    state.current_step_number,
                    EventPayload::AgentCancelled,
                ));
                AgentRunResult::Cancelled { run_id }
            }
            Finalized::Error { error, state } => {
                warn!(run = %run_id, agent = %manifest.id, error = %error, "Agent run failed");
                yield RunItem::Event(AgentEvent::now(
                    manifest.id.clone(),
                    parent_manifest_id.clone(),
                    state.current_step_number,
                    EventPayload::AgentError {
                        code: error.code().to_owned(),
                        message: error.to_string(),
                    },
                ));
                AgentRunResult::Error { error, run_id }
            }
        };

        tools.cleanup().await;
        release(lock.as_ref()).await;
        yield RunItem::Done(result);
    }
}

/// Loop terminal folded onto its finalized state.
enum Finalized {
    Complete {
        result: serde_json::Value,
        state: Box<AgentRunState>,
    },
    Suspended {
        state: Box<AgentRunState>,
    },
    Cancelled {
        state: Box<AgentRunState>,
    },
    Error {
        error: Error,
        state: Box<AgentRunState>,
    },
}

impl Finalized {
    fn state(&self) -> &AgentRunState {
        match self {
            Self::Complete { state, .. }
            | Self::Suspended { state }
            | Self::Cancelled { state }
            | Self::Error { state, .. } => state,
        }
    }

    fn state_mut(&mut self) -> &mut AgentRunState {
        match self {
            Self::Complete { state, .. }
            | Self::Suspended { state }
            | Self::Cancelled { state }
            | Self::Error { state, .. } => state,
        }
    }
}

fn finalize_state(result: LoopResult, previous_elapsed_ms: u64, start: Instant) -> Finalized {
    let mut finalized = match result {
        LoopResult::Complete {
            result,
            mut final_state,
        } => {
            final_state.status = RunStatus::Completed;
            final_state.suspensions.clear();
            final_state.suspension_stacks.clear();
            final_state.pending_tool_results.clear();
            Finalized::Complete {
                result,
                state: final_state,
            }
        }
        LoopResult::Suspended {
            suspensions,
            branches,
            completed_tool_results,
            mut final_state,
        } => {
            final_state.status = RunStatus::Suspended;
            final_state.suspensions = suspensions;
            for branch in &branches {
                if !final_state.child_state_ids.contains(&branch.child_state_id) {
                    final_state
                        .child_state_ids
                        .push(branch.child_state_id.clone());
                }
            }
            let new_stacks = crate::suspension::build_suspension_stacks(
                &final_state.manifest_id,
                &final_state.manifest_version,
                &final_state.run_id,
                &branches,
            );
            final_state.suspension_stacks.extend(new_stacks);
            final_state.pending_tool_results = completed_tool_results;
            Finalized::Suspended { state: final_state }
        }
        LoopResult::Cancelled { mut final_state } => {
            final_state.status = RunStatus::Cancelled;
            Finalized::Cancelled { state: final_state }
        }
        LoopResult::Error { error, mut final_state } => {
            final_state.status = RunStatus::Failed;
            Finalized::Error {
                error,
                state: final_state,
            }
        }
    };

    let state = finalized.state_mut();
    state.elapsed_execution_ms = previous_elapsed_ms
        + u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
    state.touch();
    finalized
}

fn all_suspensions(state: &AgentRunState) -> Vec<Suspension> {
    state
        .suspensions
        .iter()
        .cloned()
        .chain(
            state
                .suspension_stacks
                .iter()
                .map(|stack| stack.leaf_suspension.clone()),
        )
        .collect()
}

fn hook_ctx(state: &AgentRunState, manifest: &AgentManifest) -> HookContext {
    HookContext {
        run_id: state.run_id.clone(),
        manifest_id: manifest.id.clone(),
        step_number: state.current_step_number,
    }
}

fn error_event(
    manifest: &AgentManifest,
    parent_manifest_id: Option<String>,
    state: &AgentRunState,
    error: &Error,
) -> AgentEvent {
    AgentEvent::now(
        manifest.id.clone(),
        parent_manifest_id,
        state.current_step_number,
        EventPayload::AgentError {
            code: error.code().to_owned(),
            message: error.to_string(),
        },
    )
}

async fn persist(services: &Services, ctx: &RunContext, state: &mut AgentRunState) -> Result<()> {
    let run_id = state.run_id.clone();
    offload_binary_parts(services.storage.as_ref(), &run_id, &mut state.messages).await?;
    services.states.set(ctx, &run_id, state, None).await
}

async fn persist_finalized(
    services: &Services,
    ctx: &RunContext,
    finalized: &mut Finalized,
) -> Result<()> {
    persist(services, ctx, finalized.state_mut()).await
}

async fn release(lock: &dyn RunLockHandle) {
    if let Err(e) = lock.release().await {
        warn!(error = %e, "Run lock release failed");
    }
}
