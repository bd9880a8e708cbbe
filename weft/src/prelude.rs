//! Convenience re-exports of the crate's common surface.

pub use crate::agent::{
    AgentInput, AgentRunResult, ContinueResponse, Orchestrator, RunItem, RunStream, Services,
    collect_run,
};
pub use crate::completion::{
    CompletionsGateway, MockGateway, PartStream, ProviderConfig, ToolChoice,
};
pub use crate::context::{AgentRunId, RunContext};
pub use crate::error::{Error, Result};
pub use crate::event::{AgentEvent, EventKind, EventPayload};
pub use crate::hooks::{HookContext, ManifestHooks, StepStartOverrides};
pub use crate::manifest::{
    AgentManifest, HumanInTheLoop, ManifestRegistry, OutputToolSpec, StopCondition,
    StreamingConfig, SubAgentRef, TextOnlyPolicy,
};
pub use crate::message::{ContentPart, Message, MessageContent, Role};
pub use crate::state::{AgentRunState, RunStatus, StepRecord};
pub use crate::store::{
    AgentCancellationCache, AgentRunLock, AgentStateCache, InMemoryCancellationCache,
    InMemoryRunLock, InMemoryStateCache, InMemoryStorage, RunLockHandle, StorageService,
};
pub use crate::stream::{FinishReason, StreamPart};
pub use crate::suspension::{Suspension, SuspensionStack};
pub use crate::tool::{
    AgentTool, AgentToolResult, FnTool, ToolCall, ToolDefinition, ToolOutput, ToolResultPart,
    ToolSet,
};
pub use crate::usage::Usage;
