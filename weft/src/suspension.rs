//! Durable suspension records.
//!
//! A suspension is a pause awaiting external input. The leaf record is a
//! [`Suspension`]; when the pause happens inside a nested sub-agent, the run
//! that owns the event stream persists a [`SuspensionStack`] describing the
//! ancestor chain from itself down to the suspended leaf. Stacks are data, not
//! control flow: resumption re-invokes the orchestrator with the persisted
//! child state id rather than walking any saved runtime stack.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::AgentRunId;

/// A durable pause awaiting external input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
#[non_exhaustive]
pub enum Suspension {
    /// A tool call gated on human approval.
    ToolApproval {
        /// Identifier the approval response must echo.
        approval_id: String,
        /// The tool call awaiting the decision.
        tool_call_id: String,
        /// Name of the gated tool.
        tool_name: String,
        /// Arguments the model supplied.
        tool_args: Value,
        /// Human-readable description of what is being approved.
        description: String,
    },
}

impl Suspension {
    /// Create a tool-approval suspension.
    pub fn tool_approval(
        approval_id: impl Into<String>,
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        tool_args: Value,
        description: impl Into<String>,
    ) -> Self {
        Self::ToolApproval {
            approval_id: approval_id.into(),
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            tool_args,
            description: description.into(),
        }
    }

    /// The approval id this suspension waits on.
    #[must_use]
    pub fn approval_id(&self) -> &str {
        match self {
            Self::ToolApproval { approval_id, .. } => approval_id,
        }
    }

    /// The tool call this suspension is bound to.
    #[must_use]
    pub fn tool_call_id(&self) -> &str {
        match self {
            Self::ToolApproval { tool_call_id, .. } => tool_call_id,
        }
    }

    /// Name of the gated tool.
    #[must_use]
    pub fn tool_name(&self) -> &str {
        match self {
            Self::ToolApproval { tool_name, .. } => tool_name,
        }
    }

    /// Arguments of the gated call.
    #[must_use]
    pub fn tool_args(&self) -> &Value {
        match self {
            Self::ToolApproval { tool_args, .. } => tool_args,
        }
    }
}

/// Record of one suspended sub-agent tool call within a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspendedBranch {
    /// The tool call that invoked the sub-agent.
    pub tool_call_id: String,
    /// The child run's state id.
    pub child_state_id: AgentRunId,
    /// The child's manifest id.
    pub child_manifest_id: String,
    /// The child's manifest version.
    pub child_manifest_version: String,
    /// Suspensions owned by the child itself.
    pub suspensions: Vec<Suspension>,
    /// Stacks for suspensions deeper in the child's own sub-tree.
    pub child_stacks: Vec<SuspensionStack>,
}

/// One frame of a suspension stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackEntry {
    /// Manifest id of the agent at this level.
    pub manifest_id: String,
    /// Manifest version of the agent at this level.
    pub manifest_version: String,
    /// State id of the run at this level.
    pub state_id: AgentRunId,
    /// The tool call through which this level invoked the next-deeper level.
    ///
    /// `None` on the deepest entry: the leaf suspension belongs to that run
    /// itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_tool_call_id: Option<String>,
}

/// Persisted description of the ancestor chain from a run down to one
/// suspended leaf. `agents[0]` is the outermost ancestor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspensionStack {
    /// The chain, outermost first.
    pub agents: Vec<StackEntry>,
    /// The suspension at the deepest level.
    pub leaf_suspension: Suspension,
}

impl SuspensionStack {
    /// Whether this stack's leaf waits on the given approval id.
    #[must_use]
    pub fn contains_approval(&self, approval_id: &str) -> bool {
        self.leaf_suspension.approval_id() == approval_id
    }

    /// The entry one level below the owner of this stack, if any.
    #[must_use]
    pub fn child_entry(&self) -> Option<&StackEntry> {
        self.agents.get(1)
    }
}

/// Compose per-step suspension records into ordered ancestor chains.
///
/// For each suspended branch of the step, the current agent contributes the
/// outermost entry, carrying the tool call that invoked the branch. Branches
/// that already carry stacks of their own (deeper nesting) are republished
/// with the current entry prepended; direct child suspensions produce one
/// two-entry stack per leaf.
#[must_use]
pub fn build_suspension_stacks(
    manifest_id: &str,
    manifest_version: &str,
    state_id: &AgentRunId,
    branches: &[SuspendedBranch],
) -> Vec<SuspensionStack> {
    let mut stacks = Vec::new();

    for branch in branches {
        let current = StackEntry {
            manifest_id: manifest_id.to_owned(),
            manifest_version: manifest_version.to_owned(),
            state_id: state_id.clone(),
            pending_tool_call_id: Some(branch.tool_call_id.clone()),
        };

        if branch.child_stacks.is_empty() {
            let child = StackEntry {
                manifest_id: branch.child_manifest_id.clone(),
                manifest_version: branch.child_manifest_version.clone(),
                state_id: branch.child_state_id.clone(),
                pending_tool_call_id: None,
            };
            for suspension in &branch.suspensions {
                stacks.push(SuspensionStack {
                    agents: vec![current.clone(), child.clone()],
                    leaf_suspension: suspension.clone(),
                });
            }
        } else {
            for child_stack in &branch.child_stacks {
                let mut agents = Vec::with_capacity(child_stack.agents.len() + 1);
                agents.push(current.clone());
                agents.extend(child_stack.agents.iter().cloned());
                stacks.push(SuspensionStack {
                    agents,
                    leaf_suspension: child_stack.leaf_suspension.clone(),
                });
            }
            // A nested child can also suspend on its own behalf in the same
            // step it republishes deeper stacks.
            if !branch.suspensions.is_empty() {
                let child = StackEntry {
                    manifest_id: branch.child_manifest_id.clone(),
                    manifest_version: branch.child_manifest_version.clone(),
                    state_id: branch.child_state_id.clone(),
                    pending_tool_call_id: None,
                };
                for suspension in &branch.suspensions {
                    stacks.push(SuspensionStack {
                        agents: vec![current.clone(), child.clone()],
                        leaf_suspension: suspension.clone(),
                    });
                }
            }
        }
    }

    stacks
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn approval(id: &str) -> Suspension {
        Suspension::tool_approval(id, format!("call-{id}"), "delete", json!({}), "delete a file")
    }

    fn branch(tool_call_id: &str, child_state: &str, suspensions: Vec<Suspension>) -> SuspendedBranch {
        SuspendedBranch {
            tool_call_id: tool_call_id.into(),
            child_state_id: AgentRunId::from(child_state),
            child_manifest_id: "child".into(),
            child_manifest_version: "1".into(),
            suspensions,
            child_stacks: Vec::new(),
        }
    }

    #[test]
    fn direct_child_yields_two_entry_stack_per_leaf() {
        let root = AgentRunId::from("root-state");
        let stacks = build_suspension_stacks(
            "root",
            "1",
            &root,
            &[branch("tc-1", "child-state", vec![approval("A1"), approval("A2")])],
        );

        assert_eq!(stacks.len(), 2);
        for stack in &stacks {
            assert_eq!(stack.agents.len(), 2);
            assert_eq!(stack.agents[0].state_id, root);
            assert_eq!(
                stack.agents[0].pending_tool_call_id.as_deref(),
                Some("tc-1")
            );
            assert!(stack.agents[1].pending_tool_call_id.is_none());
        }
        assert!(stacks[0].contains_approval("A1"));
        assert!(stacks[1].contains_approval("A2"));
    }

    #[test]
    fn nested_stacks_are_republished_with_current_prepended() {
        let root = AgentRunId::from("root-state");
        let mid = AgentRunId::from("mid-state");
        let leaf = AgentRunId::from("leaf-state");

        let inner = SuspensionStack {
            agents: vec![
                StackEntry {
                    manifest_id: "mid".into(),
                    manifest_version: "1".into(),
                    state_id: mid,
                    pending_tool_call_id: Some("tc-inner".into()),
                },
                StackEntry {
                    manifest_id: "leaf".into(),
                    manifest_version: "1".into(),
                    state_id: leaf,
                    pending_tool_call_id: None,
                },
            ],
            leaf_suspension: approval("A9"),
        };

        let mut b = branch("tc-outer", "mid-state", Vec::new());
        b.child_stacks = vec![inner];

        let stacks = build_suspension_stacks("root", "1", &root, &[b]);
        assert_eq!(stacks.len(), 1);
        assert_eq!(stacks[0].agents.len(), 3);
        assert_eq!(stacks[0].agents[0].state_id, root);
        assert_eq!(
            stacks[0].agents[0].pending_tool_call_id.as_deref(),
            Some("tc-outer")
        );
        assert_eq!(stacks[0].agents[1].manifest_id, "mid");
        assert_eq!(stacks[0].agents[2].manifest_id, "leaf");
        assert!(stacks[0].contains_approval("A9"));
    }

    #[test]
    fn multiple_branches_each_contribute_stacks() {
        let root = AgentRunId::from("root-state");
        let stacks = build_suspension_stacks(
            "root",
            "1",
            &root,
            &[
                branch("tc-1", "c1", vec![approval("A1")]),
                branch("tc-2", "c2", vec![approval("A2")]),
            ],
        );
        assert_eq!(stacks.len(), 2);
        assert_eq!(stacks[0].agents[0].pending_tool_call_id.as_deref(), Some("tc-1"));
        assert_eq!(stacks[1].agents[0].pending_tool_call_id.as_deref(), Some("tc-2"));
    }
}
