//! The agent execution engine.
//!
//! Composition: [`Orchestrator`] → run envelope → step loop → (step streamer |
//! tool dispatcher → sub-agent recursion). The envelope is the only component
//! that talks to the run lock, the state cache, and the cancellation store.

mod dispatcher;
mod envelope;
mod orchestrator;
mod resume;
mod result;
mod step_loop;
mod streamer;

pub use orchestrator::Orchestrator;
pub use result::{AgentRunResult, RunItem, RunStream, collect_run};

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::completion::CompletionsGateway;
use crate::context::AgentRunId;
use crate::state::ParentContext;
use crate::store::{AgentCancellationCache, AgentRunLock, AgentStateCache, StorageService};

/// The executor's external collaborators, shared by every run.
#[derive(Clone)]
pub struct Services {
    /// Streaming LLM endpoint.
    pub gateway: Arc<dyn CompletionsGateway>,
    /// Persisted run state.
    pub states: Arc<dyn AgentStateCache>,
    /// Distributed per-run lock.
    pub locks: Arc<dyn AgentRunLock>,
    /// Cancellation-signal store.
    pub cancellations: Arc<dyn AgentCancellationCache>,
    /// Blob store for binary message content.
    pub storage: Arc<dyn StorageService>,
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}

/// A human decision on one pending approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinueResponse {
    /// The approval being answered.
    pub approval_id: String,
    /// Whether the gated call may run.
    pub approved: bool,
    /// Reason supplied with the decision, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Input delivered into the executor; classified by the orchestrator.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum AgentInput {
    /// Start a fresh run of a manifest.
    Request {
        /// Manifest id to run.
        manifest_id: String,
        /// Manifest version to run.
        manifest_version: String,
        /// The user prompt.
        prompt: String,
        /// Caller-supplied context variables.
        context: Option<Value>,
        /// Lineage when this request spawns a nested sub-agent run.
        parent: Option<ParentContext>,
        /// Manifest id of the run tree's root; defaults to the requested
        /// manifest.
        root_manifest_id: Option<String>,
    },
    /// Continue a completed run with a new user message.
    Reply {
        /// The run to continue.
        run_id: AgentRunId,
        /// The new user message.
        message: String,
    },
    /// Resume a suspended run with an approval decision.
    Approval {
        /// The run to resume.
        run_id: AgentRunId,
        /// The decision.
        response: ContinueResponse,
    },
    /// Resume a suspended run by replaying its pending tool results, without
    /// an approval.
    Continue {
        /// The run to resume.
        run_id: AgentRunId,
    },
}

impl AgentInput {
    /// A fresh-run request without context or lineage.
    pub fn request(
        manifest_id: impl Into<String>,
        manifest_version: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self::Request {
            manifest_id: manifest_id.into(),
            manifest_version: manifest_version.into(),
            prompt: prompt.into(),
            context: None,
            parent: None,
            root_manifest_id: None,
        }
    }

    /// An approval input.
    pub fn approval(run_id: impl Into<AgentRunId>, response: ContinueResponse) -> Self {
        Self::Approval {
            run_id: run_id.into(),
            response,
        }
    }
}
