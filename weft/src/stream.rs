//! Provider-layer stream parts.
//!
//! A streaming completion yields [`StreamPart`]s. The step streamer translates
//! the parts it understands into run events and accumulates them into a step
//! aggregate; anything else is skipped.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tool::ToolCall;
use crate::usage::Usage;

/// One chunk of a streaming completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum StreamPart {
    /// Incremental text content.
    TextDelta {
        /// The text fragment.
        delta: String,
    },

    /// The model requested a tool invocation.
    ToolCall {
        /// The requested call.
        tool_call: ToolCall,
    },

    /// The model requested a tool invocation that requires human approval.
    ToolApprovalRequest {
        /// Identifier the eventual approval response must echo.
        approval_id: String,
        /// The tool call awaiting approval.
        tool_call_id: String,
        /// Name of the gated tool.
        tool_name: String,
        /// Arguments the model supplied.
        tool_args: Value,
        /// Human-readable description of what is being approved.
        description: String,
    },

    /// The step finished.
    FinishStep {
        /// Why the model stopped.
        finish_reason: FinishReason,
        /// Token usage for the step.
        usage: Usage,
    },

    /// A part this executor does not interpret.
    Other,
}

impl StreamPart {
    /// Create a text delta part.
    pub fn text_delta(delta: impl Into<String>) -> Self {
        Self::TextDelta {
            delta: delta.into(),
        }
    }

    /// Create a tool call part.
    #[must_use]
    pub const fn tool_call(tool_call: ToolCall) -> Self {
        Self::ToolCall { tool_call }
    }

    /// Create a finish-step part.
    #[must_use]
    pub const fn finish(finish_reason: FinishReason, usage: Usage) -> Self {
        Self::FinishStep {
            finish_reason,
            usage,
        }
    }

    /// Whether this part terminates the step.
    #[must_use]
    pub const fn is_finish(&self) -> bool {
        matches!(self, Self::FinishStep { .. })
    }
}

/// Reason why the model stopped generating a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum FinishReason {
    /// Natural stop (end of response).
    #[default]
    Stop,
    /// Model decided to call tools.
    ToolCalls,
    /// Maximum token limit reached.
    Length,
    /// Content was filtered.
    ContentFilter,
    /// The provider reported an error.
    Error,
    /// Anything else.
    Other,
}

impl FinishReason {
    /// String representation of the reason.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::ToolCalls => "tool_calls",
            Self::Length => "length",
            Self::ContentFilter => "content_filter",
            Self::Error => "error",
            Self::Other => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tagged_serialization() {
        let part = StreamPart::text_delta("hi");
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["type"], "text_delta");
        assert_eq!(json["delta"], "hi");
    }

    #[test]
    fn approval_request_roundtrip() {
        let part = StreamPart::ToolApprovalRequest {
            approval_id: "A1".into(),
            tool_call_id: "c1".into(),
            tool_name: "delete".into(),
            tool_args: json!({"path": "/tmp/x"}),
            description: "delete /tmp/x".into(),
        };
        let back: StreamPart =
            serde_json::from_value(serde_json::to_value(&part).unwrap()).unwrap();
        assert_eq!(back, part);
    }

    #[test]
    fn finish_detects() {
        assert!(StreamPart::finish(FinishReason::Stop, Usage::zero()).is_finish());
        assert!(!StreamPart::text_delta("x").is_finish());
    }
}
