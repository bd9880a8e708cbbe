//! Error types for the execution core.
//!
//! One variant per failure kind the executor distinguishes. Tool failures are
//! deliberately *not* represented here as run failures: a tool error becomes a
//! model-visible tool-result part, and only surfaces as [`Error::Tool`] when a
//! collaborator needs to report it out of band.

use thiserror::Error;

use crate::context::AgentRunId;

/// A type alias for `Result<T, Error>`.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The main error type for agent run operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The input to an operation was malformed or inconsistent.
    #[error("validation error: {message}")]
    Validation {
        /// What was wrong with the input.
        message: String,
    },

    /// A state snapshot or suspension target could not be found.
    #[error("not found: {what}")]
    NotFound {
        /// Description of the missing entity.
        what: String,
    },

    /// Authentication failure passed through from a collaborator.
    #[error("unauthorized: {message}")]
    Unauthorized {
        /// The underlying message.
        message: String,
    },

    /// Authorization failure passed through from a collaborator.
    #[error("forbidden: {message}")]
    Forbidden {
        /// The underlying message.
        message: String,
    },

    /// The run exceeded its execution-time budget.
    #[error("agent timed out after {elapsed_ms}ms (budget {timeout_ms}ms)")]
    Timeout {
        /// Total execution time accumulated across resumes.
        elapsed_ms: u64,
        /// The configured budget.
        timeout_ms: u64,
    },

    /// The streaming LLM provider reported an error.
    #[error("provider error: {message}")]
    Provider {
        /// The underlying message.
        message: String,
    },

    /// A tool reported an error out of band.
    ///
    /// Inside the step loop tool failures are folded into tool-result parts
    /// instead; this variant exists for collaborators that must surface one.
    #[error("tool '{tool_name}' failed: {message}")]
    Tool {
        /// Name of the failing tool.
        tool_name: String,
        /// The underlying message.
        message: String,
    },

    /// Another executor holds the run lock for this state.
    #[error("run {run_id} is already being executed")]
    LockBusy {
        /// The contested run.
        run_id: AgentRunId,
    },

    /// A manifest hook returned an error.
    #[error("hook '{hook}' failed: {message}")]
    Hook {
        /// Which hook failed.
        hook: &'static str,
        /// The underlying message.
        message: String,
    },

    /// The output tool's arguments stayed invalid past the retry budget.
    #[error("output validation failed after {retries} retries: {message}")]
    OutputValidation {
        /// Retries consumed before giving up.
        retries: u32,
        /// The last validation failure.
        message: String,
    },

    /// The blob storage service failed.
    #[error("storage error: {message}")]
    Storage {
        /// The underlying message.
        message: String,
    },

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unexpected internal failure.
    #[error("internal error: {message}")]
    Internal {
        /// The underlying message.
        message: String,
    },
}

impl Error {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create a provider error.
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
        }
    }

    /// Create a tool error.
    pub fn tool(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    /// Create a hook error for the named hook.
    pub fn hook(hook: &'static str, message: impl Into<String>) -> Self {
        Self::Hook {
            hook,
            message: message.into(),
        }
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Stable machine-readable code, carried by `agent-error` events.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::NotFound { .. } => "not_found",
            Self::Unauthorized { .. } => "unauthorized",
            Self::Forbidden { .. } => "forbidden",
            Self::Timeout { .. } => "timeout",
            Self::Provider { .. } => "provider_error",
            Self::Tool { .. } => "tool_error",
            Self::LockBusy { .. } => "lock_busy",
            Self::Hook { .. } => "hook_error",
            Self::OutputValidation { .. } => "output_validation",
            Self::Storage { .. } => "storage_error",
            Self::Serialization(_) => "serialization_error",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Whether this error is the timeout kind.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::validation("bad").code(), "validation_error");
        assert_eq!(
            Error::Timeout {
                elapsed_ms: 1200,
                timeout_ms: 1000
            }
            .code(),
            "timeout"
        );
        assert_eq!(Error::provider("boom").code(), "provider_error");
    }

    #[test]
    fn timeout_message_carries_budget() {
        let err = Error::Timeout {
            elapsed_ms: 1200,
            timeout_ms: 1000,
        };
        assert!(err.is_timeout());
        assert!(err.to_string().contains("1200ms"));
        assert!(err.to_string().contains("1000ms"));
    }
}
