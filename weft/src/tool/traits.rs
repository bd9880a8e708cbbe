//! The streaming tool-executor contract.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use futures::future::BoxFuture;
use serde_json::Value;

use super::{AgentToolResult, ToolCall, ToolDefinition};
use crate::context::{AgentRunId, RunContext};
use crate::event::AgentEvent;
use crate::message::Message;

/// One item yielded by a tool executor: events while working, then exactly one
/// terminal result.
#[derive(Debug)]
pub enum ToolItem {
    /// An event to forward onto the run stream.
    Event(AgentEvent),
    /// The terminal value; the stream ends after yielding this.
    Done(AgentToolResult),
}

/// A boxed stream of tool items.
pub type ToolStream = Pin<Box<dyn Stream<Item = ToolItem> + Send>>;

/// Everything a tool executor gets to see about the run invoking it.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// The run context; executors are expected to observe its abort flag.
    pub ctx: RunContext,
    /// State id of the invoking run.
    pub state_id: AgentRunId,
    /// Manifest id of the invoking agent.
    pub manifest_id: String,
    /// Manifest id of the invoking agent's parent, if nested.
    pub parent_manifest_id: Option<String>,
    /// The step that requested this call.
    pub step_number: u32,
    /// Conversation at the time of the call.
    pub messages: Arc<Vec<Message>>,
}

/// A tool the step loop can dispatch.
///
/// Executors are streaming: [`execute`](Self::execute) returns a lazy sequence
/// of [`ToolItem`]s ending in a [`ToolItem::Done`]. Implementations must honor
/// the execution context's abort flag; they are not force-killed.
pub trait AgentTool: Send + Sync {
    /// The declarative definition shown to the model.
    fn definition(&self) -> ToolDefinition;

    /// Execute one call.
    fn execute(&self, call: ToolCall, exec: ExecutionContext) -> ToolStream;

    /// Release any resources the tool holds (client handles, subprocesses).
    ///
    /// Called once per run from the envelope's cleanup phase.
    fn cleanup(&self) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }
}

/// Closure-backed tool for simple executors and tests.
///
/// The closure receives the call arguments and resolves to either a value or a
/// model-visible error message.
#[derive(Clone)]
pub struct FnTool {
    definition: ToolDefinition,
    #[allow(clippy::type_complexity)]
    f: Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>,
}

impl FnTool {
    /// Create a tool from a definition and an async closure.
    pub fn new<F, Fut>(definition: ToolDefinition, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        Self {
            definition,
            f: Arc::new(move |args| Box::pin(f(args))),
        }
    }
}

impl fmt::Debug for FnTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.definition.name)
            .finish_non_exhaustive()
    }
}

impl AgentTool for FnTool {
    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }

    fn execute(&self, call: ToolCall, _exec: ExecutionContext) -> ToolStream {
        let fut = (self.f)(call.args);
        Box::pin(async_stream::stream! {
            let result = match fut.await {
                Ok(value) => AgentToolResult::success(value),
                Err(message) => AgentToolResult::error(message),
            };
            yield ToolItem::Done(result);
        })
    }
}
