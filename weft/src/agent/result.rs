//! Terminal values of the step loop and of a whole run.

use std::pin::Pin;

use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::context::AgentRunId;
use crate::error::Error;
use crate::event::AgentEvent;
use crate::state::AgentRunState;
use crate::suspension::{SuspendedBranch, Suspension, SuspensionStack};
use crate::tool::ToolResultPart;

/// Internal terminal value of the step loop.
///
/// Carries the working state back to the envelope for finalization.
#[derive(Debug)]
pub(crate) enum LoopResult {
    /// The loop hit a stop condition.
    Complete {
        /// The assembled agent result.
        result: Value,
        /// The working state at completion.
        final_state: Box<AgentRunState>,
    },
    /// The loop suspended awaiting external input.
    Suspended {
        /// This run's own approval suspensions.
        suspensions: Vec<Suspension>,
        /// Sub-agent branches that suspended mid-step.
        branches: Vec<SuspendedBranch>,
        /// Results of the suspending step's completed peers, replayed on
        /// resume.
        completed_tool_results: Vec<ToolResultPart>,
        /// The working state at suspension.
        final_state: Box<AgentRunState>,
    },
    /// The run context was aborted.
    Cancelled {
        /// The working state at cancellation.
        final_state: Box<AgentRunState>,
    },
    /// The loop failed.
    Error {
        /// What failed.
        error: Error,
        /// The working state at failure.
        final_state: Box<AgentRunState>,
    },
}

/// External terminal value of one run invocation.
#[derive(Debug)]
#[non_exhaustive]
pub enum AgentRunResult {
    /// The run completed with a result.
    Complete {
        /// The final value.
        result: Value,
        /// The run.
        run_id: AgentRunId,
    },
    /// The run suspended; resume with an approval targeting one of the
    /// suspensions or stack leaves.
    Suspended {
        /// Suspensions owned by the run itself.
        suspensions: Vec<Suspension>,
        /// Stacks for suspensions inside nested sub-agents.
        suspension_stacks: Vec<SuspensionStack>,
        /// The run.
        run_id: AgentRunId,
    },
    /// The run was cancelled.
    Cancelled {
        /// The run.
        run_id: AgentRunId,
    },
    /// The run failed.
    Error {
        /// What failed.
        error: Error,
        /// The run.
        run_id: AgentRunId,
    },
    /// Another executor already holds this run's lock. No events were
    /// emitted and no hooks fired.
    AlreadyRunning {
        /// The contested run.
        run_id: AgentRunId,
    },
}

impl AgentRunResult {
    /// The run this result belongs to.
    #[must_use]
    pub const fn run_id(&self) -> &AgentRunId {
        match self {
            Self::Complete { run_id, .. }
            | Self::Suspended { run_id, .. }
            | Self::Cancelled { run_id }
            | Self::Error { run_id, .. }
            | Self::AlreadyRunning { run_id } => run_id,
        }
    }

    /// Whether the run completed with a result.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }

    /// Whether the run suspended.
    #[must_use]
    pub const fn is_suspended(&self) -> bool {
        matches!(self, Self::Suspended { .. })
    }

    /// The completion value, if any.
    #[must_use]
    pub const fn result(&self) -> Option<&Value> {
        match self {
            Self::Complete { result, .. } => Some(result),
            _ => None,
        }
    }
}

/// One item of a run's output stream: events while running, then exactly one
/// terminal result.
#[derive(Debug)]
pub enum RunItem {
    /// An event.
    Event(AgentEvent),
    /// The terminal result; the stream ends after yielding this.
    Done(AgentRunResult),
}

/// A boxed run-output stream.
pub type RunStream = Pin<Box<dyn Stream<Item = RunItem> + Send>>;

/// Drain a run stream into its events and terminal result.
///
/// A stream that ends without a terminal item yields an internal error, which
/// indicates a bug in the envelope.
pub async fn collect_run(mut stream: RunStream) -> (Vec<AgentEvent>, AgentRunResult) {
    let mut events = Vec::new();
    while let Some(item) = stream.next().await {
        match item {
            RunItem::Event(event) => events.push(event),
            RunItem::Done(result) => return (events, result),
        }
    }
    (
        events,
        AgentRunResult::Error {
            error: Error::internal("run stream ended without a terminal result"),
            run_id: AgentRunId::from("unknown"),
        },
    )
}
