//! Tools: the executor-facing contract and its value types.
//!
//! A tool is anything the model can invoke during a step. Tool executors are
//! *streaming*: they yield run events while working and finish with a terminal
//! [`AgentToolResult`]. Sub-agents are exposed through the same contract, which
//! is the only mechanism by which agent nesting occurs.

mod toolset;
mod traits;

pub use toolset::ToolSet;
pub use traits::{AgentTool, ExecutionContext, FnTool, ToolItem, ToolStream};

use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::AgentRunId;
use crate::suspension::{Suspension, SuspensionStack};

/// Declarative description of a tool, shown to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: String,
    /// What the tool does, for the model.
    pub description: String,
    /// JSON schema of the tool's arguments.
    pub parameters: Value,
}

impl ToolDefinition {
    /// Create a definition with an explicit parameter schema.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// Create a definition whose parameter schema is derived from `Args`.
    pub fn from_schema<Args: JsonSchema>(
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::to_value(schema_for!(Args)).unwrap_or(Value::Null),
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier of this call within the conversation.
    pub id: String,
    /// Name of the tool being called.
    pub tool_name: String,
    /// Arguments the model supplied.
    pub args: Value,
}

impl ToolCall {
    /// Create a tool call.
    pub fn new(id: impl Into<String>, tool_name: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            args,
        }
    }

    /// Parse the arguments into a concrete type.
    ///
    /// # Errors
    ///
    /// Returns the deserialization error when the arguments do not match.
    pub fn parse_args<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.args.clone())
    }
}

/// The model-facing outcome of one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolOutput {
    /// The tool succeeded.
    Success {
        /// The tool's return value.
        value: Value,
    },
    /// The tool failed. This is model-visible data, not a run failure.
    Error {
        /// What went wrong.
        message: String,
        /// Stable error code, if the tool provided one.
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        /// Whether retrying the same call could help.
        #[serde(default)]
        retryable: bool,
    },
    /// A human rejected the call at an approval gate.
    Denied {
        /// Reason supplied with the rejection, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// A tool result bound to the call that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultPart {
    /// The call this result answers.
    pub tool_call_id: String,
    /// Name of the tool.
    pub tool_name: String,
    /// The outcome.
    pub output: ToolOutput,
}

impl ToolResultPart {
    /// A successful result.
    pub fn success(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        value: Value,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            output: ToolOutput::Success { value },
        }
    }

    /// An error result.
    pub fn error(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            output: ToolOutput::Error {
                message: message.into(),
                code: None,
                retryable: false,
            },
        }
    }

    /// A denial result for a rejected approval.
    pub fn denied(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        reason: Option<String>,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            output: ToolOutput::Denied { reason },
        }
    }

    /// Whether this result reports success.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.output, ToolOutput::Success { .. })
    }
}

/// Terminal value of a tool executor's stream.
#[derive(Debug, Clone)]
pub enum AgentToolResult {
    /// The tool produced a value.
    Success {
        /// The value.
        value: Value,
    },
    /// The tool failed; folded into a model-visible error result.
    Error {
        /// What went wrong.
        error: String,
        /// Stable error code, if known.
        code: Option<String>,
        /// Whether retrying could help.
        retryable: bool,
    },
    /// The tool was a sub-agent that suspended awaiting external input.
    Suspended {
        /// The child run's state id.
        run_id: AgentRunId,
        /// The child's manifest id.
        manifest_id: String,
        /// The child's manifest version.
        manifest_version: String,
        /// Suspensions owned by the child itself.
        suspensions: Vec<Suspension>,
        /// Stacks for suspensions deeper in the child's own sub-tree.
        child_stacks: Vec<SuspensionStack>,
    },
}

impl AgentToolResult {
    /// A success result.
    #[must_use]
    pub const fn success(value: Value) -> Self {
        Self::Success { value }
    }

    /// An error result without a code.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
            code: None,
            retryable: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_args() {
        #[derive(Deserialize)]
        struct EchoArgs {
            x: String,
        }
        let call = ToolCall::new("c1", "echo", json!({"x": "hi"}));
        let args: EchoArgs = call.parse_args().unwrap();
        assert_eq!(args.x, "hi");
    }

    #[test]
    fn result_constructors() {
        assert!(ToolResultPart::success("c1", "echo", json!("hi")).is_success());
        assert!(!ToolResultPart::error("c1", "echo", "boom").is_success());
        let denied = ToolResultPart::denied("c1", "delete", Some("too risky".into()));
        assert!(matches!(denied.output, ToolOutput::Denied { .. }));
    }
}
