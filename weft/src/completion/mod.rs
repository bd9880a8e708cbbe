//! The streaming-completion gateway contract.
//!
//! The execution core never talks to an LLM provider directly; it hands a
//! [`CompletionRequest`] to a [`CompletionsGateway`] and consumes the
//! resulting stream of [`StreamPart`]s. Provider adapters live behind this
//! trait. [`MockGateway`] is the scripted implementation the tests drive.

pub mod mock;

pub use mock::MockGateway;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::RunContext;
use crate::error::Result;
use crate::message::Message;
use crate::stream::StreamPart;
use crate::tool::ToolDefinition;

/// A boxed stream of provider parts.
pub type PartStream = Pin<Box<dyn Stream<Item = Result<StreamPart>> + Send>>;

/// Which provider and model a manifest runs against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider name, e.g. `openai`.
    pub name: String,
    /// Model identifier, e.g. `gpt-4o`.
    pub model: String,
    /// Provider-specific settings passed through opaquely.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub settings: Value,
}

impl ProviderConfig {
    /// Create a provider config without extra settings.
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            settings: Value::Null,
        }
    }
}

/// How the model may pick tools for one step.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    /// The model decides freely.
    #[default]
    Auto,
    /// The model must not call tools.
    None,
    /// The model must call at least one tool.
    Required,
    /// The model must call the named tool.
    Tool {
        /// The required tool.
        name: String,
    },
}

/// A tool as presented to the provider, with its approval gating resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// The declarative definition.
    pub definition: ToolDefinition,
    /// Whether calls to this tool must be routed through human approval.
    pub requires_approval: bool,
}

/// One streaming-completion request; always bounded to a single step.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Conversation so far.
    pub messages: Vec<Message>,
    /// Tools available this step.
    pub tools: Vec<ToolDescriptor>,
    /// The request stops after this many model steps. Always 1 in the loop.
    pub stop_after_steps: u32,
    /// Tool-choice override for this step.
    pub tool_choice: Option<ToolChoice>,
    /// Restrict the model to this subset of tool names.
    pub active_tools: Option<Vec<String>>,
}

/// A streaming LLM endpoint.
#[async_trait]
pub trait CompletionsGateway: Send + Sync {
    /// Open a streaming completion.
    ///
    /// Implementations must honor the context's abort flag: once the run is
    /// aborted the stream should end with a provider error rather than
    /// continue producing parts.
    ///
    /// # Errors
    ///
    /// Returns a provider error when the completion cannot be opened.
    async fn stream_completion(
        &self,
        ctx: &RunContext,
        provider: &ProviderConfig,
        request: CompletionRequest,
    ) -> Result<PartStream>;
}
