//! Manifest hooks: lifecycle capabilities, tool executors, sub-agent mappers.
//!
//! Hooks are capabilities, not inheritance: a manifest carries a struct of
//! optional async callbacks and the engine null-checks at each call site. All
//! callbacks return `Result`; what a failure aborts depends on the stage (see
//! the run envelope).

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::completion::ToolChoice;
use crate::context::AgentRunId;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::state::StepRecord;
use crate::suspension::Suspension;
use crate::tool::{AgentTool, ToolCall};

/// Boxed future returned by hook callbacks.
pub type BoxHookFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

/// What a hook callback gets to know about its run.
#[derive(Debug, Clone)]
pub struct HookContext {
    /// The run's state id.
    pub run_id: AgentRunId,
    /// Manifest id of the agent.
    pub manifest_id: String,
    /// Current step number; 0 before the first step.
    pub step_number: u32,
}

/// Per-step overrides an `on_step_start` hook may return.
#[derive(Debug, Clone, Default)]
pub struct StepStartOverrides {
    /// Replace the carried conversation for this and subsequent steps.
    pub messages: Option<Vec<Message>>,
    /// Tool-choice override for this step only.
    pub tool_choice: Option<ToolChoice>,
    /// Restrict the model to these tools for this step only.
    pub active_tools: Option<Vec<String>>,
}

/// Lifecycle callback with no extra payload.
pub type LifecycleHook = Arc<dyn Fn(HookContext) -> BoxHookFuture<()> + Send + Sync>;
/// Callback receiving the suspensions being resumed or entered.
pub type SuspensionsHook =
    Arc<dyn Fn(HookContext, Vec<Suspension>) -> BoxHookFuture<()> + Send + Sync>;
/// Step-start callback, optionally overriding per-step inputs.
pub type StepStartHook =
    Arc<dyn Fn(HookContext) -> BoxHookFuture<Option<StepStartOverrides>> + Send + Sync>;
/// Step-finish callback receiving the completed record.
pub type StepFinishHook =
    Arc<dyn Fn(HookContext, StepRecord) -> BoxHookFuture<()> + Send + Sync>;
/// Completion callback receiving the final result value.
pub type CompleteHook = Arc<dyn Fn(HookContext, Value) -> BoxHookFuture<()> + Send + Sync>;
/// Error callback receiving the error message.
pub type ErrorHook = Arc<dyn Fn(HookContext, String) -> BoxHookFuture<()> + Send + Sync>;
/// Maps a sub-agent tool call onto the prompt the child run receives.
pub type SubAgentMapper = Arc<dyn Fn(&ToolCall) -> Result<String> + Send + Sync>;

/// The capability set a manifest carries.
#[derive(Clone, Default)]
pub struct ManifestHooks {
    /// Fired once when a fresh run begins, before any step.
    pub on_agent_start: Option<LifecycleHook>,
    /// Fired once when a suspended run resumes, with the resolved suspensions.
    pub on_agent_resume: Option<SuspensionsHook>,
    /// Fired before each step; may override per-step inputs.
    pub on_step_start: Option<StepStartHook>,
    /// Fired after each step with its record.
    pub on_step_finish: Option<StepFinishHook>,
    /// Fired after state is finalized as suspended.
    pub on_agent_suspend: Option<SuspensionsHook>,
    /// Fired after state is finalized as completed.
    pub on_agent_complete: Option<CompleteHook>,
    /// Fired after state is finalized as cancelled.
    pub on_agent_cancelled: Option<LifecycleHook>,
    /// Fired after state is finalized as failed.
    pub on_agent_error: Option<ErrorHook>,
    /// Executors for the manifest's declared tools, by tool name.
    pub tool_executors: HashMap<String, Arc<dyn AgentTool>>,
    /// Input mappers for the manifest's sub-agents, by sub-agent tool name.
    pub sub_agent_mappers: HashMap<String, SubAgentMapper>,
}

impl ManifestHooks {
    /// An empty capability set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the agent-start hook.
    #[must_use]
    pub fn on_agent_start<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_agent_start = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    /// Set the agent-resume hook.
    #[must_use]
    pub fn on_agent_resume<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(HookContext, Vec<Suspension>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_agent_resume = Some(Arc::new(move |ctx, resolved| Box::pin(f(ctx, resolved))));
        self
    }

    /// Set the step-start hook.
    #[must_use]
    pub fn on_step_start<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<StepStartOverrides>>> + Send + 'static,
    {
        self.on_step_start = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    /// Set the step-finish hook.
    #[must_use]
    pub fn on_step_finish<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(HookContext, StepRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_step_finish = Some(Arc::new(move |ctx, record| Box::pin(f(ctx, record))));
        self
    }

    /// Set the agent-suspend hook.
    #[must_use]
    pub fn on_agent_suspend<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(HookContext, Vec<Suspension>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_agent_suspend = Some(Arc::new(move |ctx, suspensions| {
            Box::pin(f(ctx, suspensions))
        }));
        self
    }

    /// Set the agent-complete hook.
    #[must_use]
    pub fn on_agent_complete<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(HookContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_agent_complete = Some(Arc::new(move |ctx, result| Box::pin(f(ctx, result))));
        self
    }

    /// Set the agent-cancelled hook.
    #[must_use]
    pub fn on_agent_cancelled<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_agent_cancelled = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    /// Set the agent-error hook.
    #[must_use]
    pub fn on_agent_error<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(HookContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_agent_error = Some(Arc::new(move |ctx, message| Box::pin(f(ctx, message))));
        self
    }

    /// Register the executor for a declared tool, keyed by its definition
    /// name.
    #[must_use]
    pub fn tool_executor(mut self, tool: Arc<dyn AgentTool>) -> Self {
        self.tool_executors.insert(tool.definition().name, tool);
        self
    }

    /// Register an input mapper for a sub-agent tool.
    #[must_use]
    pub fn sub_agent_mapper<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&ToolCall) -> Result<String> + Send + Sync + 'static,
    {
        self.sub_agent_mappers.insert(name.into(), Arc::new(f));
        self
    }
}

impl ManifestHooks {
    pub(crate) async fn fire_agent_start(&self, ctx: HookContext) -> Result<()> {
        fire(self.on_agent_start.as_ref().map(|h| h(ctx)), "on_agent_start").await
    }

    pub(crate) async fn fire_agent_resume(
        &self,
        ctx: HookContext,
        resolved: Vec<Suspension>,
    ) -> Result<()> {
        fire(
            self.on_agent_resume.as_ref().map(|h| h(ctx, resolved)),
            "on_agent_resume",
        )
        .await
    }

    pub(crate) async fn fire_step_start(
        &self,
        ctx: HookContext,
    ) -> Result<Option<StepStartOverrides>> {
        match &self.on_step_start {
            Some(hook) => hook(ctx)
                .await
                .map_err(|e| Error::hook("on_step_start", e.to_string())),
            None => Ok(None),
        }
    }

    pub(crate) async fn fire_step_finish(&self, ctx: HookContext, record: StepRecord) -> Result<()> {
        fire(
            self.on_step_finish.as_ref().map(|h| h(ctx, record)),
            "on_step_finish",
        )
        .await
    }

    pub(crate) async fn fire_agent_suspend(
        &self,
        ctx: HookContext,
        suspensions: Vec<Suspension>,
    ) -> Result<()> {
        fire(
            self.on_agent_suspend.as_ref().map(|h| h(ctx, suspensions)),
            "on_agent_suspend",
        )
        .await
    }

    pub(crate) async fn fire_agent_complete(&self, ctx: HookContext, result: Value) -> Result<()> {
        fire(
            self.on_agent_complete.as_ref().map(|h| h(ctx, result)),
            "on_agent_complete",
        )
        .await
    }

    pub(crate) async fn fire_agent_cancelled(&self, ctx: HookContext) -> Result<()> {
        fire(
            self.on_agent_cancelled.as_ref().map(|h| h(ctx)),
            "on_agent_cancelled",
        )
        .await
    }

    pub(crate) async fn fire_agent_error(&self, ctx: HookContext, message: String) -> Result<()> {
        fire(
            self.on_agent_error.as_ref().map(|h| h(ctx, message)),
            "on_agent_error",
        )
        .await
    }
}

async fn fire(fut: Option<BoxHookFuture<()>>, hook: &'static str) -> Result<()> {
    match fut {
        Some(fut) => fut.await.map_err(|e| Error::hook(hook, e.to_string())),
        None => Ok(()),
    }
}

impl fmt::Debug for ManifestHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManifestHooks")
            .field("on_agent_start", &self.on_agent_start.is_some())
            .field("on_agent_resume", &self.on_agent_resume.is_some())
            .field("on_step_start", &self.on_step_start.is_some())
            .field("on_step_finish", &self.on_step_finish.is_some())
            .field("on_agent_suspend", &self.on_agent_suspend.is_some())
            .field("on_agent_complete", &self.on_agent_complete.is_some())
            .field("on_agent_cancelled", &self.on_agent_cancelled.is_some())
            .field("on_agent_error", &self.on_agent_error.is_some())
            .field("tool_executors", &self.tool_executors.len())
            .field("sub_agent_mappers", &self.sub_agent_mappers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx() -> HookContext {
        HookContext {
            run_id: AgentRunId::from("run-1"),
            manifest_id: "m".into(),
            step_number: 0,
        }
    }

    #[tokio::test]
    async fn unset_hooks_are_noops() {
        let hooks = ManifestHooks::new();
        hooks.fire_agent_start(ctx()).await.unwrap();
        assert!(hooks.fire_step_start(ctx()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn hook_errors_are_attributed() {
        let hooks = ManifestHooks::new()
            .on_agent_start(|_| async { Err(Error::internal("nope")) });
        let err = hooks.fire_agent_start(ctx()).await.unwrap_err();
        assert_eq!(err.code(), "hook_error");
        assert!(err.to_string().contains("on_agent_start"));
    }

    #[tokio::test]
    async fn step_start_overrides_flow_back() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let hooks = ManifestHooks::new().on_step_start(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            async {
                Ok(Some(StepStartOverrides {
                    active_tools: Some(vec!["echo".into()]),
                    ..StepStartOverrides::default()
                }))
            }
        });

        let overrides = hooks.fire_step_start(ctx()).await.unwrap().unwrap();
        assert_eq!(
            overrides.active_tools.as_deref(),
            Some(["echo".to_string()].as_slice())
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
