//! Externally visible run events.
//!
//! Two families share one stream: configurable step events, filtered per
//! manifest by [`crate::manifest::StreamingConfig`], and lifecycle events that
//! are always emitted. `agent-started` precedes any step event; exactly one
//! terminal event family (`agent-done`, one-or-more `agent-suspended`,
//! `agent-cancelled`, `agent-error`) closes the stream.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::AgentRunId;
use crate::stream::FinishReason;
use crate::suspension::Suspension;
use crate::tool::{ToolCall, ToolResultPart};
use crate::usage::Usage;

/// One event on the run stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    /// Manifest of the agent that produced the event.
    pub manifest_id: String,
    /// Manifest of that agent's parent, when nested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_manifest_id: Option<String>,
    /// Step during which the event was produced.
    pub step_number: u32,
    /// Wall-clock emission time.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl AgentEvent {
    /// Stamp a payload with origin metadata and the current time.
    #[must_use]
    pub fn now(
        manifest_id: impl Into<String>,
        parent_manifest_id: Option<String>,
        step_number: u32,
        payload: EventPayload,
    ) -> Self {
        Self {
            manifest_id: manifest_id.into(),
            parent_manifest_id,
            step_number,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// The kind of this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

/// The payload of a run event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
#[non_exhaustive]
pub enum EventPayload {
    /// The model requested a tool invocation.
    ToolCall {
        /// The call.
        tool_call: ToolCall,
    },
    /// A tool finished and produced a model-visible result.
    ToolResult {
        /// The result.
        tool_result: ToolResultPart,
    },
    /// Incremental assistant text.
    TextDelta {
        /// The fragment.
        delta: String,
    },
    /// A step began.
    StepStart,
    /// A step finished.
    StepFinish {
        /// Why the model stopped, when known.
        #[serde(skip_serializing_if = "Option::is_none")]
        finish_reason: Option<FinishReason>,
        /// Usage for the step, when known.
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },

    /// The run began executing.
    AgentStarted {
        /// State id of the run.
        state_id: AgentRunId,
    },
    /// The run completed with a result.
    AgentDone {
        /// The final value.
        result: Value,
    },
    /// The run suspended awaiting external input. Emitted once per leaf.
    AgentSuspended {
        /// The suspension awaiting input.
        suspension: Suspension,
        /// State id of the run that owns the stream.
        state_id: AgentRunId,
    },
    /// The run failed.
    AgentError {
        /// Stable error code.
        code: String,
        /// Human-readable message.
        message: String,
    },
    /// The run was cancelled.
    AgentCancelled,
}

impl EventPayload {
    /// The kind of this payload.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::ToolCall { .. } => EventKind::ToolCall,
            Self::ToolResult { .. } => EventKind::ToolResult,
            Self::TextDelta { .. } => EventKind::TextDelta,
            Self::StepStart => EventKind::StepStart,
            Self::StepFinish { .. } => EventKind::StepFinish,
            Self::AgentStarted { .. } => EventKind::AgentStarted,
            Self::AgentDone { .. } => EventKind::AgentDone,
            Self::AgentSuspended { .. } => EventKind::AgentSuspended,
            Self::AgentError { .. } => EventKind::AgentError,
            Self::AgentCancelled => EventKind::AgentCancelled,
        }
    }
}

/// Discriminant of an event, used for per-manifest filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum EventKind {
    /// `tool-call` (configurable).
    ToolCall,
    /// `tool-result` (configurable).
    ToolResult,
    /// `text-delta` (configurable).
    TextDelta,
    /// `step-start` (configurable).
    StepStart,
    /// `step-finish` (configurable).
    StepFinish,
    /// `agent-started` (lifecycle, unconditional).
    AgentStarted,
    /// `agent-done` (lifecycle, unconditional).
    AgentDone,
    /// `agent-suspended` (lifecycle, unconditional).
    AgentSuspended,
    /// `agent-error` (lifecycle, unconditional).
    AgentError,
    /// `agent-cancelled` (lifecycle, unconditional).
    AgentCancelled,
}

impl EventKind {
    /// Whether events of this kind bypass manifest filtering.
    #[must_use]
    pub const fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::AgentStarted
                | Self::AgentDone
                | Self::AgentSuspended
                | Self::AgentError
                | Self::AgentCancelled
        )
    }

    /// String representation of the kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ToolCall => "tool-call",
            Self::ToolResult => "tool-result",
            Self::TextDelta => "text-delta",
            Self::StepStart => "step-start",
            Self::StepFinish => "step-finish",
            Self::AgentStarted => "agent-started",
            Self::AgentDone => "agent-done",
            Self::AgentSuspended => "agent-suspended",
            Self::AgentError => "agent-error",
            Self::AgentCancelled => "agent-cancelled",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lifecycle_classification() {
        assert!(EventKind::AgentDone.is_lifecycle());
        assert!(EventKind::AgentSuspended.is_lifecycle());
        assert!(!EventKind::TextDelta.is_lifecycle());
        assert!(!EventKind::StepFinish.is_lifecycle());
    }

    #[test]
    fn payload_kind_matches_tag() {
        let event = AgentEvent::now(
            "m1",
            None,
            3,
            EventPayload::TextDelta { delta: "hi".into() },
        );
        assert_eq!(event.kind(), EventKind::TextDelta);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "text-delta");
        assert_eq!(json["step_number"], 3);
    }

    #[test]
    fn tool_result_event_roundtrip() {
        let event = AgentEvent::now(
            "m1",
            Some("root".into()),
            1,
            EventPayload::ToolResult {
                tool_result: ToolResultPart::success("c1", "echo", json!("hi")),
            },
        );
        let back: AgentEvent =
            serde_json::from_value(serde_json::to_value(&event).unwrap()).unwrap();
        assert_eq!(back, event);
    }
}
