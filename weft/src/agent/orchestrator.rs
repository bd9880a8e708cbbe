//! The orchestrator: entry point that classifies inputs and wires runs.
//!
//! Sub-agents are exposed to their parent as streaming tools whose executor is
//! a recursive orchestrator call bound to the child manifest; that mapping is
//! the only mechanism by which nesting occurs. Recursion terminates because
//! the registry's sub-agent graph is acyclic.

use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;
use tracing::debug;

use super::envelope::{EnvelopeParams, run_envelope};
use super::result::{AgentRunResult, RunItem, RunStream};
use super::resume::ResumePrelude;
use super::{AgentInput, ContinueResponse, Services};
use crate::completion::ToolDescriptor;
use crate::context::{AgentRunId, RunContext};
use crate::error::{Error, Result};
use crate::hooks::SubAgentMapper;
use crate::manifest::{AgentManifest, ManifestRegistry, SubAgentRef};
use crate::message::Message;
use crate::state::{AgentRunState, ParentContext, RunStatus, rehydrate_messages};
use crate::suspension::Suspension;
use crate::tool::{
    AgentTool, AgentToolResult, ExecutionContext, ToolCall, ToolDefinition, ToolItem, ToolSet,
    ToolStream,
};

/// The executor's entry point.
#[derive(Clone, Debug)]
pub struct Orchestrator {
    services: Services,
    registry: Arc<ManifestRegistry>,
}

impl Orchestrator {
    /// Create an orchestrator over a manifest registry.
    #[must_use]
    pub fn new(services: Services, registry: Arc<ManifestRegistry>) -> Self {
        Self { services, registry }
    }

    /// The manifest registry this orchestrator resolves against.
    #[must_use]
    pub fn registry(&self) -> &Arc<ManifestRegistry> {
        &self.registry
    }

    /// Classify an input and drive the matching execution path.
    ///
    /// Returns the run's event stream; the final item is the terminal
    /// [`AgentRunResult`](super::AgentRunResult).
    #[must_use]
    pub fn run(&self, ctx: RunContext, input: AgentInput) -> RunStream {
        let this = self.clone();
        Box::pin(async_stream::stream! {
            match input {
                AgentInput::Request {
                    manifest_id,
                    manifest_version,
                    prompt,
                    context,
                    parent,
                    root_manifest_id,
                } => {
                    let run_id = AgentRunId::generate();
                    let Some(manifest) = this.registry.get(&manifest_id, &manifest_version)
                    else {
                        yield RunItem::Done(AgentRunResult::Error {
                            error: Error::not_found(format!(
                                "manifest {manifest_id}:{manifest_version}"
                            )),
                            run_id,
                        });
                        return;
                    };
                    if let Err(error) = this.registry.validate() {
                        yield RunItem::Done(AgentRunResult::Error { error, run_id });
                        return;
                    }

                    let mut messages = Vec::new();
                    if !manifest.instructions.is_empty() {
                        messages.push(Message::system(&manifest.instructions));
                    }
                    messages.push(Message::user(prompt));

                    let root = root_manifest_id.unwrap_or_else(|| manifest.id.clone());
                    let state = Box::new(AgentRunState::new(
                        run_id,
                        &manifest,
                        root.clone(),
                        parent,
                        messages,
                        context,
                    ));

                    let tools = this.build_toolset(&manifest, &root);
                    let descriptors = build_descriptors(&manifest);
                    let envelope = run_envelope(EnvelopeParams {
                        services: this.services.clone(),
                        manifest,
                        tools,
                        descriptors,
                        state,
                        is_new_state: true,
                        resolved_suspensions: Vec::new(),
                        prelude: ResumePrelude::None,
                        orchestrator: this.clone(),
                        ctx,
                    });
                    futures::pin_mut!(envelope);
                    while let Some(item) = envelope.next().await {
                        yield item;
                    }
                }

                AgentInput::Reply { run_id, message } => {
                    let (mut state, manifest) = match this
                        .load_for_resume(&ctx, &run_id, RunStatus::Completed)
                        .await
                    {
                        Ok(loaded) => loaded,
                        Err(error) => {
                            yield RunItem::Done(AgentRunResult::Error { error, run_id });
                            return;
                        }
                    };
                    state.messages.push(Message::user(message));

                    let root = state.root_manifest_id.clone();
                    let tools = this.build_toolset(&manifest, &root);
                    let descriptors = build_descriptors(&manifest);
                    let envelope = run_envelope(EnvelopeParams {
                        services: this.services.clone(),
                        manifest,
                        tools,
                        descriptors,
                        state,
                        is_new_state: false,
                        resolved_suspensions: Vec::new(),
                        prelude: ResumePrelude::None,
                        orchestrator: this.clone(),
                        ctx,
                    });
                    futures::pin_mut!(envelope);
                    while let Some(item) = envelope.next().await {
                        yield item;
                    }
                }

                AgentInput::Approval { run_id, response } => {
                    let (state, manifest) = match this
                        .load_for_resume(&ctx, &run_id, RunStatus::Suspended)
                        .await
                    {
                        Ok(loaded) => loaded,
                        Err(error) => {
                            yield RunItem::Done(AgentRunResult::Error { error, run_id });
                            return;
                        }
                    };

                    let (prelude, resolved) = match classify_approval(&state, &response) {
                        Ok(classified) => classified,
                        Err(error) => {
                            yield RunItem::Done(AgentRunResult::Error { error, run_id });
                            return;
                        }
                    };

                    let root = state.root_manifest_id.clone();
                    let tools = this.build_toolset(&manifest, &root);
                    let descriptors = build_descriptors(&manifest);
                    let envelope = run_envelope(EnvelopeParams {
                        services: this.services.clone(),
                        manifest,
                        tools,
                        descriptors,
                        state,
                        is_new_state: false,
                        resolved_suspensions: resolved,
                        prelude,
                        orchestrator: this.clone(),
                        ctx,
                    });
                    futures::pin_mut!(envelope);
                    while let Some(item) = envelope.next().await {
                        yield item;
                    }
                }

                AgentInput::Continue { run_id } => {
                    let (state, manifest) = match this
                        .load_for_resume(&ctx, &run_id, RunStatus::Suspended)
                        .await
                    {
                        Ok(loaded) => loaded,
                        Err(error) => {
                            yield RunItem::Done(AgentRunResult::Error { error, run_id });
                            return;
                        }
                    };
                    if state.pending_tool_results.is_empty() {
                        yield RunItem::Done(AgentRunResult::Error {
                            error: Error::validation(
                                "run has no pending tool results to continue with",
                            ),
                            run_id,
                        });
                        return;
                    }

                    let root = state.root_manifest_id.clone();
                    let tools = this.build_toolset(&manifest, &root);
                    let descriptors = build_descriptors(&manifest);
                    let envelope = run_envelope(EnvelopeParams {
                        services: this.services.clone(),
                        manifest,
                        tools,
                        descriptors,
                        state,
                        is_new_state: false,
                        resolved_suspensions: Vec::new(),
                        prelude: ResumePrelude::ReplayPending,
                        orchestrator: this.clone(),
                        ctx,
                    });
                    futures::pin_mut!(envelope);
                    while let Some(item) = envelope.next().await {
                        yield item;
                    }
                }
            }
        })
    }

    /// Load a persisted state for resumption, checking its status and
    /// re-minting signed URLs on its messages.
    async fn load_for_resume(
        &self,
        ctx: &RunContext,
        run_id: &AgentRunId,
        required: RunStatus,
    ) -> Result<(Box<AgentRunState>, Arc<AgentManifest>)> {
        let Some(mut state) = self.services.states.get(ctx, run_id).await? else {
            return Err(Error::not_found(format!("run state {run_id}")));
        };
        if state.status != required {
            return Err(Error::validation(format!(
                "run {run_id} is {} but {} is required",
                state.status.as_str(),
                required.as_str()
            )));
        }
        let manifest = self
            .registry
            .get(&state.manifest_id, &state.manifest_version)
            .ok_or_else(|| {
                Error::not_found(format!(
                    "manifest {}:{}",
                    state.manifest_id, state.manifest_version
                ))
            })?;
        rehydrate_messages(self.services.storage.as_ref(), run_id, &mut state.messages).await?;
        Ok((Box::new(state), manifest))
    }

    /// Materialize the dispatchable tools of a manifest: declared executors
    /// plus each sub-agent exposed as a recursive-orchestrator tool.
    fn build_toolset(&self, manifest: &Arc<AgentManifest>, root_manifest_id: &str) -> ToolSet {
        let mut set = ToolSet::new();

        for definition in &manifest.tools {
            if let Some(executor) = manifest.hooks.tool_executors.get(&definition.name) {
                set.insert(Arc::clone(executor));
            }
        }
        // Executors registered without a declared definition still dispatch.
        let mut extra: Vec<&String> = manifest
            .hooks
            .tool_executors
            .keys()
            .filter(|name| !set.contains(name))
            .collect();
        extra.sort();
        for name in extra {
            if let Some(executor) = manifest.hooks.tool_executors.get(name) {
                set.insert(Arc::clone(executor));
            }
        }

        for sub_agent in &manifest.sub_agents {
            let mapper = manifest.hooks.sub_agent_mappers.get(&sub_agent.name).cloned();
            set.insert(Arc::new(SubAgentTool {
                orchestrator: self.clone(),
                sub_agent: sub_agent.clone(),
                root_manifest_id: root_manifest_id.to_owned(),
                mapper,
            }));
        }

        set
    }
}

/// Decide whether an approval targets this frame or a descendant.
fn classify_approval(
    state: &AgentRunState,
    response: &ContinueResponse,
) -> Result<(ResumePrelude, Vec<Suspension>)> {
    if let Some(suspension) = state
        .suspensions
        .iter()
        .find(|s| s.approval_id() == response.approval_id)
    {
        return Ok((
            ResumePrelude::ResolveApproval {
                suspension: suspension.clone(),
                approved: response.approved,
                reason: response.reason.clone(),
            },
            vec![suspension.clone()],
        ));
    }

    if let Some(stack) = state
        .suspension_stacks
        .iter()
        .find(|stack| stack.contains_approval(&response.approval_id))
    {
        return Ok((
            ResumePrelude::ResumeChild {
                stack: stack.clone(),
                response: response.clone(),
            },
            vec![stack.leaf_suspension.clone()],
        ));
    }

    Err(Error::not_found(format!(
        "no suspension awaits approval '{}'",
        response.approval_id
    )))
}

/// Model-facing tool listing: declared tools, sub-agent tools, and the output
/// tool, each with its approval gating resolved.
fn build_descriptors(manifest: &AgentManifest) -> Vec<ToolDescriptor> {
    let mut descriptors: Vec<ToolDescriptor> = manifest
        .tools
        .iter()
        .map(|definition| ToolDescriptor {
            definition: definition.clone(),
            requires_approval: manifest.requires_approval(&definition.name),
        })
        .collect();

    for sub_agent in &manifest.sub_agents {
        descriptors.push(ToolDescriptor {
            definition: sub_agent_definition(sub_agent),
            requires_approval: manifest.requires_approval(&sub_agent.name),
        });
    }

    if let Some(spec) = &manifest.output_tool {
        descriptors.push(ToolDescriptor {
            definition: spec.definition.clone(),
            requires_approval: false,
        });
    }

    descriptors
}

fn sub_agent_definition(sub_agent: &SubAgentRef) -> ToolDefinition {
    ToolDefinition::new(
        &sub_agent.name,
        format!(
            "Delegate a task to the '{}' sub-agent. {}",
            sub_agent.name, sub_agent.description
        ),
        json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "Task for the sub-agent."
                }
            },
            "required": ["prompt"]
        }),
    )
}

/// A sub-agent exposed as a streaming tool.
struct SubAgentTool {
    orchestrator: Orchestrator,
    sub_agent: SubAgentRef,
    root_manifest_id: String,
    mapper: Option<SubAgentMapper>,
}

impl SubAgentTool {
    fn child_prompt(&self, call: &ToolCall) -> Result<String> {
        match &self.mapper {
            Some(mapper) => mapper(call),
            None => Ok(call
                .args
                .get("prompt")
                .and_then(serde_json::Value::as_str)
                .map_or_else(|| call.args.to_string(), str::to_owned)),
        }
    }
}

impl AgentTool for SubAgentTool {
    fn definition(&self) -> ToolDefinition {
        sub_agent_definition(&self.sub_agent)
    }

    fn execute(&self, call: ToolCall, exec: ExecutionContext) -> ToolStream {
        let orchestrator = self.orchestrator.clone();
        let sub_agent = self.sub_agent.clone();
        let root_manifest_id = self.root_manifest_id.clone();
        let prompt = self.child_prompt(&call);

        Box::pin(async_stream::stream! {
            let prompt = match prompt {
                Ok(prompt) => prompt,
                Err(error) => {
                    yield ToolItem::Done(AgentToolResult::error(format!(
                        "sub-agent input mapping failed: {error}"
                    )));
                    return;
                }
            };

            debug!(sub_agent = %sub_agent.name, parent = %exec.manifest_id, "Invoking sub-agent");
            let input = AgentInput::Request {
                manifest_id: sub_agent.manifest_id.clone(),
                manifest_version: sub_agent.manifest_version.clone(),
                prompt,
                context: None,
                parent: Some(ParentContext {
                    state_id: exec.state_id.clone(),
                    manifest_id: exec.manifest_id.clone(),
                    tool_call_id: call.id.clone(),
                }),
                root_manifest_id: Some(root_manifest_id),
            };

            let mut child = orchestrator.run(exec.ctx.child(), input);
            while let Some(item) = child.next().await {
                match item {
                    RunItem::Event(event) => yield ToolItem::Event(event),
                    RunItem::Done(result) => {
                        let terminal = match result {
                            AgentRunResult::Complete { result, .. } => {
                                AgentToolResult::Success { value: result }
                            }
                            AgentRunResult::Suspended {
                                suspensions,
                                suspension_stacks,
                                run_id,
                            } => AgentToolResult::Suspended {
                                run_id,
                                manifest_id: sub_agent.manifest_id.clone(),
                                manifest_version: sub_agent.manifest_version.clone(),
                                suspensions,
                                child_stacks: suspension_stacks,
                            },
                            AgentRunResult::Cancelled { .. } => AgentToolResult::Error {
                                error: "sub-agent run was cancelled".to_owned(),
                                code: Some("cancelled".to_owned()),
                                retryable: false,
                            },
                            AgentRunResult::Error { error, .. } => AgentToolResult::Error {
                                error: error.to_string(),
                                code: Some(error.code().to_owned()),
                                retryable: false,
                            },
                            AgentRunResult::AlreadyRunning { .. } => AgentToolResult::Error {
                                error: "sub-agent run is already being executed".to_owned(),
                                code: Some("lock_busy".to_owned()),
                                retryable: true,
                            },
                        };
                        yield ToolItem::Done(terminal);
                        return;
                    }
                }
            }
            yield ToolItem::Done(AgentToolResult::error(
                "sub-agent stream ended without a result",
            ));
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::collect_run;
    use crate::completion::MockGateway;
    use crate::store::{
        InMemoryCancellationCache, InMemoryRunLock, InMemoryStateCache, InMemoryStorage,
    };

    fn services() -> Services {
        Services {
            gateway: Arc::new(MockGateway::new()),
            states: Arc::new(InMemoryStateCache::new()),
            locks: Arc::new(InMemoryRunLock::new()),
            cancellations: Arc::new(InMemoryCancellationCache::new()),
            storage: Arc::new(InMemoryStorage::new()),
        }
    }

    #[tokio::test]
    async fn unknown_manifest_is_not_found() {
        let orchestrator = Orchestrator::new(services(), Arc::new(ManifestRegistry::new()));
        let (events, result) = collect_run(orchestrator.run(
            RunContext::new(),
            AgentInput::request("ghost", "1", "hi"),
        ))
        .await;
        assert!(events.is_empty());
        match result {
            AgentRunResult::Error { error, .. } => assert_eq!(error.code(), "not_found"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reply_requires_completed_state() {
        let orchestrator = Orchestrator::new(
            services(),
            Arc::new(
                ManifestRegistry::new()
                    .with(AgentManifest::builder("m", "1").instructions("hi").build()),
            ),
        );
        let (_, result) = collect_run(orchestrator.run(
            RunContext::new(),
            AgentInput::Reply {
                run_id: AgentRunId::from("missing"),
                message: "more".into(),
            },
        ))
        .await;
        match result {
            AgentRunResult::Error { error, .. } => assert_eq!(error.code(), "not_found"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn approval_classification_prefers_own_suspensions() {
        let manifest = AgentManifest::builder("m", "1").build();
        let mut state = AgentRunState::new(
            AgentRunId::from("run-1"),
            &manifest,
            "m",
            None,
            Vec::new(),
            None,
        );
        state.suspensions.push(Suspension::tool_approval(
            "A1",
            "c1",
            "delete",
            json!({}),
            "delete things",
        ));

        let response = ContinueResponse {
            approval_id: "A1".into(),
            approved: true,
            reason: None,
        };
        let (prelude, resolved) = classify_approval(&state, &response).unwrap();
        assert!(matches!(prelude, ResumePrelude::ResolveApproval { .. }));
        assert_eq!(resolved.len(), 1);

        let miss = ContinueResponse {
            approval_id: "A9".into(),
            approved: true,
            reason: None,
        };
        assert!(classify_approval(&state, &miss).is_err());
    }

    #[test]
    fn descriptors_cover_tools_sub_agents_and_output_tool() {
        use crate::manifest::OutputToolSpec;

        let manifest = AgentManifest::builder("m", "1")
            .tool(ToolDefinition::new("echo", "echoes", json!({"type": "object"})))
            .sub_agent(SubAgentRef::new("helper", "helps out", "child", "1"))
            .output_tool(OutputToolSpec::new(ToolDefinition::new(
                "report",
                "final output",
                json!({"type": "object"}),
            )))
            .require_approval("helper")
            .build();

        let descriptors = build_descriptors(&manifest);
        let names: Vec<&str> = descriptors
            .iter()
            .map(|d| d.definition.name.as_str())
            .collect();
        assert_eq!(names, ["echo", "helper", "report"]);
        assert!(!descriptors[0].requires_approval);
        assert!(descriptors[1].requires_approval);
        assert!(!descriptors[2].requires_approval);
    }
}
