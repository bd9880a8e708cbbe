//! Run identifiers and the per-run execution context.
//!
//! A [`RunContext`] carries the abort flag that every decision point in the
//! step loop consults. Cloning a context shares the flag, which is how
//! cancellation propagates into parallel tool tasks and recursive sub-agent
//! runs.

use std::fmt;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier of an agent run and of its persisted state snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentRunId(String);

impl AgentRunId {
    /// Generate a fresh run id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// View the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for AgentRunId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for AgentRunId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Per-run execution context.
///
/// The abort flag is the single source of truth for cancellation at decision
/// points. External operators signal through the cancellation cache; the
/// executor folds that signal into this flag at iteration boundaries.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    abort: Arc<AtomicBool>,
}

impl RunContext {
    /// Create a fresh, un-aborted context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of the run and everything sharing this context.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// A child context sharing this context's abort flag.
    ///
    /// Sub-agent runs and tool tasks receive children so that aborting the
    /// root aborts the whole tree.
    #[must_use]
    pub fn child(&self) -> Self {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_propagates_to_children() {
        let ctx = RunContext::new();
        let child = ctx.child();
        assert!(!child.is_aborted());
        ctx.abort();
        assert!(child.is_aborted());
    }

    #[test]
    fn run_ids_are_unique() {
        assert_ne!(AgentRunId::generate(), AgentRunId::generate());
    }
}
