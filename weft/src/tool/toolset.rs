//! Named collection of tools available to one agent.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::{AgentTool, ToolDefinition};

/// The tools one agent can dispatch, keyed by name.
///
/// Insertion order is preserved for definition listings so the model sees a
/// stable tool ordering across steps.
#[derive(Clone, Default)]
pub struct ToolSet {
    order: Vec<String>,
    tools: HashMap<String, Arc<dyn AgentTool>>,
}

impl ToolSet {
    /// Create an empty tool set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool. A tool with the same name is replaced.
    pub fn insert(&mut self, tool: Arc<dyn AgentTool>) {
        let name = tool.definition().name;
        if !self.tools.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.tools.insert(name, tool);
    }

    /// Builder-style insertion.
    #[must_use]
    pub fn with(mut self, tool: Arc<dyn AgentTool>) -> Self {
        self.insert(tool);
        self
    }

    /// Look up a tool by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn AgentTool>> {
        self.tools.get(name)
    }

    /// Whether a tool with this name exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Definitions of all tools, in insertion order.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.definition())
            .collect()
    }

    /// Number of tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Run every tool's cleanup, in insertion order.
    pub async fn cleanup(&self) {
        for name in &self.order {
            if let Some(tool) = self.tools.get(name) {
                tool.cleanup().await;
            }
        }
    }
}

impl fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolSet")
            .field("tools", &self.order)
            .finish()
    }
}
