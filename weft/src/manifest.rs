//! Declarative agent manifests.
//!
//! A manifest is the immutable spec of an agent: which model to call, which
//! tools and sub-agents it may use, when to stop, which tool calls need human
//! approval, and which events to surface. Manifests are shared-immutable
//! across runs; hook capabilities ride along in [`ManifestHooks`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::completion::ProviderConfig;
use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::hooks::ManifestHooks;
use crate::tool::ToolDefinition;

/// Default execution-time budget for a run, across resumes.
pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;

/// Default retry budget for output-tool validation.
pub const DEFAULT_OUTPUT_RETRIES: u32 = 3;

/// Identity of a manifest within a run: `id:version`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManifestKey {
    /// Manifest id.
    pub id: String,
    /// Manifest version.
    pub version: String,
}

impl ManifestKey {
    /// Create a key.
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ManifestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.version)
    }
}

/// A sub-agent exposed to the parent as a tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAgentRef {
    /// Tool name the parent's model sees.
    pub name: String,
    /// Tool description the parent's model sees.
    pub description: String,
    /// Manifest id of the child.
    pub manifest_id: String,
    /// Manifest version of the child.
    pub manifest_version: String,
}

impl SubAgentRef {
    /// Reference a sub-agent manifest under a tool name.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        manifest_id: impl Into<String>,
        manifest_version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            manifest_id: manifest_id.into(),
            manifest_version: manifest_version.into(),
        }
    }

    /// The child's manifest key.
    #[must_use]
    pub fn key(&self) -> ManifestKey {
        ManifestKey::new(&self.manifest_id, &self.manifest_version)
    }
}

/// A condition that completes the run after a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopCondition {
    /// Stop once this many steps have run.
    StepCount(u32),
    /// Stop once the named tool has been used in a step.
    ToolUsed(String),
}

/// What to do when a step produces only text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextOnlyPolicy {
    /// A text-only `stop` step completes the run.
    #[default]
    Stop,
    /// Keep looping; the model is called again.
    Continue,
}

/// Human-in-the-loop approval configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HumanInTheLoop {
    /// Tools whose calls always require approval.
    pub always_require_approval: Vec<String>,
    /// Whether tools not listed above require approval by default.
    pub default_requires_approval: bool,
}

/// Which configurable events a run surfaces. Lifecycle events always pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingConfig {
    /// The enabled configurable event kinds.
    pub events: HashSet<EventKind>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            events: [
                EventKind::ToolCall,
                EventKind::ToolResult,
                EventKind::TextDelta,
                EventKind::StepStart,
                EventKind::StepFinish,
            ]
            .into_iter()
            .collect(),
        }
    }
}

impl StreamingConfig {
    /// A configuration surfacing only the given kinds.
    #[must_use]
    pub fn only(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self {
            events: kinds.into_iter().filter(|k| !k.is_lifecycle()).collect(),
        }
    }

    /// Whether events of this kind should be emitted.
    #[must_use]
    pub fn allows(&self, kind: EventKind) -> bool {
        kind.is_lifecycle() || self.events.contains(&kind)
    }
}

/// Validator for output-tool arguments.
pub type OutputValidator = Arc<dyn Fn(&Value) -> std::result::Result<(), String> + Send + Sync>;

/// A structured-output tool the model must call to finish with typed output.
#[derive(Clone)]
pub struct OutputToolSpec {
    /// The tool definition shown to the model.
    pub definition: ToolDefinition,
    /// How many invalid attempts to tolerate before failing the run.
    pub max_retries: u32,
    /// Argument validator; `None` accepts anything.
    pub validator: Option<OutputValidator>,
}

impl OutputToolSpec {
    /// Create a spec with the default retry budget and no validator.
    #[must_use]
    pub fn new(definition: ToolDefinition) -> Self {
        Self {
            definition,
            max_retries: DEFAULT_OUTPUT_RETRIES,
            validator: None,
        }
    }

    /// Attach a validator.
    #[must_use]
    pub fn with_validator<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(f));
        self
    }

    /// Override the retry budget.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Run the validator against candidate arguments.
    pub(crate) fn validate(&self, args: &Value) -> std::result::Result<(), String> {
        match &self.validator {
            Some(validator) => validator(args),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for OutputToolSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputToolSpec")
            .field("name", &self.definition.name)
            .field("max_retries", &self.max_retries)
            .field("has_validator", &self.validator.is_some())
            .finish()
    }
}

/// Immutable declarative spec of an agent.
#[derive(Debug, Clone)]
pub struct AgentManifest {
    /// Manifest id; `id:version` is unique within a run.
    pub id: String,
    /// Manifest version.
    pub version: String,
    /// Provider and model configuration.
    pub provider: ProviderConfig,
    /// System instructions.
    pub instructions: String,
    /// Declared tools.
    pub tools: Vec<ToolDefinition>,
    /// Sub-agents exposed as tools.
    pub sub_agents: Vec<SubAgentRef>,
    /// Structured-output tool, if the agent produces typed output.
    pub output_tool: Option<OutputToolSpec>,
    /// Conditions that complete the run.
    pub stop_when: Vec<StopCondition>,
    /// Policy for text-only steps.
    pub on_text_only: TextOnlyPolicy,
    /// Execution-time budget across resumes, in milliseconds.
    pub timeout_ms: u64,
    /// Approval gating configuration.
    pub human_in_the_loop: HumanInTheLoop,
    /// Configurable event filtering.
    pub streaming: StreamingConfig,
    /// Hook capabilities.
    pub hooks: ManifestHooks,
}

impl AgentManifest {
    /// Start building a manifest.
    #[must_use]
    pub fn builder(id: impl Into<String>, version: impl Into<String>) -> ManifestBuilder {
        ManifestBuilder::new(id, version)
    }

    /// This manifest's key.
    #[must_use]
    pub fn key(&self) -> ManifestKey {
        ManifestKey::new(&self.id, &self.version)
    }

    /// Whether calls to the named tool must pass through approval.
    #[must_use]
    pub fn requires_approval(&self, tool_name: &str) -> bool {
        self.human_in_the_loop
            .always_require_approval
            .iter()
            .any(|t| t == tool_name)
            || self.human_in_the_loop.default_requires_approval
    }
}

/// Builder for [`AgentManifest`].
#[derive(Debug)]
pub struct ManifestBuilder {
    id: String,
    version: String,
    provider: ProviderConfig,
    instructions: String,
    tools: Vec<ToolDefinition>,
    sub_agents: Vec<SubAgentRef>,
    output_tool: Option<OutputToolSpec>,
    stop_when: Vec<StopCondition>,
    on_text_only: TextOnlyPolicy,
    timeout_ms: u64,
    human_in_the_loop: HumanInTheLoop,
    streaming: StreamingConfig,
    hooks: ManifestHooks,
}

impl ManifestBuilder {
    fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            provider: ProviderConfig::new("mock", "mock"),
            instructions: String::new(),
            tools: Vec::new(),
            sub_agents: Vec::new(),
            output_tool: None,
            stop_when: Vec::new(),
            on_text_only: TextOnlyPolicy::default(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            human_in_the_loop: HumanInTheLoop::default(),
            streaming: StreamingConfig::default(),
            hooks: ManifestHooks::new(),
        }
    }

    /// Set the provider configuration.
    #[must_use]
    pub fn provider(mut self, provider: ProviderConfig) -> Self {
        self.provider = provider;
        self
    }

    /// Set the system instructions.
    #[must_use]
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    /// Declare a tool.
    #[must_use]
    pub fn tool(mut self, definition: ToolDefinition) -> Self {
        self.tools.push(definition);
        self
    }

    /// Expose a sub-agent as a tool.
    #[must_use]
    pub fn sub_agent(mut self, sub_agent: SubAgentRef) -> Self {
        self.sub_agents.push(sub_agent);
        self
    }

    /// Set the structured-output tool.
    #[must_use]
    pub fn output_tool(mut self, spec: OutputToolSpec) -> Self {
        self.output_tool = Some(spec);
        self
    }

    /// Add a stop condition.
    #[must_use]
    pub fn stop_when(mut self, condition: StopCondition) -> Self {
        self.stop_when.push(condition);
        self
    }

    /// Set the text-only policy.
    #[must_use]
    pub const fn on_text_only(mut self, policy: TextOnlyPolicy) -> Self {
        self.on_text_only = policy;
        self
    }

    /// Set the execution-time budget.
    #[must_use]
    pub const fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Always require approval for the named tool.
    #[must_use]
    pub fn require_approval(mut self, tool_name: impl Into<String>) -> Self {
        self.human_in_the_loop
            .always_require_approval
            .push(tool_name.into());
        self
    }

    /// Require approval for every tool not explicitly listed.
    #[must_use]
    pub const fn default_requires_approval(mut self, value: bool) -> Self {
        self.human_in_the_loop.default_requires_approval = value;
        self
    }

    /// Set the configurable event filter.
    #[must_use]
    pub fn streaming(mut self, streaming: StreamingConfig) -> Self {
        self.streaming = streaming;
        self
    }

    /// Set the hook capabilities.
    #[must_use]
    pub fn hooks(mut self, hooks: ManifestHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> AgentManifest {
        AgentManifest {
            id: self.id,
            version: self.version,
            provider: self.provider,
            instructions: self.instructions,
            tools: self.tools,
            sub_agents: self.sub_agents,
            output_tool: self.output_tool,
            stop_when: self.stop_when,
            on_text_only: self.on_text_only,
            timeout_ms: self.timeout_ms,
            human_in_the_loop: self.human_in_the_loop,
            streaming: self.streaming,
            hooks: self.hooks,
        }
    }
}

/// All manifests participating in a run tree, keyed by `id:version`.
#[derive(Debug, Clone, Default)]
pub struct ManifestRegistry {
    manifests: HashMap<ManifestKey, Arc<AgentManifest>>,
}

impl ManifestRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a manifest.
    pub fn insert(&mut self, manifest: AgentManifest) {
        self.manifests.insert(manifest.key(), Arc::new(manifest));
    }

    /// Builder-style insertion.
    #[must_use]
    pub fn with(mut self, manifest: AgentManifest) -> Self {
        self.insert(manifest);
        self
    }

    /// Look up a manifest by id and version.
    #[must_use]
    pub fn get(&self, id: &str, version: &str) -> Option<Arc<AgentManifest>> {
        self.manifests
            .get(&ManifestKey::new(id, version))
            .map(Arc::clone)
    }

    /// Resolve a sub-agent reference.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the referenced manifest is absent.
    pub fn resolve(&self, sub_agent: &SubAgentRef) -> Result<Arc<AgentManifest>> {
        self.get(&sub_agent.manifest_id, &sub_agent.manifest_version)
            .ok_or_else(|| {
                Error::validation(format!(
                    "sub-agent '{}' references unknown manifest {}",
                    sub_agent.name,
                    sub_agent.key()
                ))
            })
    }

    /// Check that every sub-agent reference resolves and the sub-agent graph
    /// is acyclic.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the dangling reference or the
    /// manifest participating in a cycle.
    pub fn validate(&self) -> Result<()> {
        for manifest in self.manifests.values() {
            for sub_agent in &manifest.sub_agents {
                self.resolve(sub_agent)?;
            }
        }

        let mut visiting = HashSet::new();
        let mut done = HashSet::new();
        for key in self.manifests.keys() {
            self.check_cycles(key, &mut visiting, &mut done)?;
        }
        Ok(())
    }

    fn check_cycles(
        &self,
        key: &ManifestKey,
        visiting: &mut HashSet<ManifestKey>,
        done: &mut HashSet<ManifestKey>,
    ) -> Result<()> {
        if done.contains(key) {
            return Ok(());
        }
        if !visiting.insert(key.clone()) {
            return Err(Error::validation(format!(
                "sub-agent graph contains a cycle through {key}"
            )));
        }
        if let Some(manifest) = self.manifests.get(key) {
            for sub_agent in &manifest.sub_agents {
                self.check_cycles(&sub_agent.key(), visiting, done)?;
            }
        }
        visiting.remove(key);
        done.insert(key.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn leaf(id: &str) -> AgentManifest {
        AgentManifest::builder(id, "1").instructions("leaf").build()
    }

    #[test]
    fn approval_gating() {
        let manifest = AgentManifest::builder("m", "1")
            .require_approval("delete")
            .build();
        assert!(manifest.requires_approval("delete"));
        assert!(!manifest.requires_approval("echo"));

        let strict = AgentManifest::builder("m", "1")
            .default_requires_approval(true)
            .build();
        assert!(strict.requires_approval("anything"));
    }

    #[test]
    fn streaming_filter_never_blocks_lifecycle() {
        let config = StreamingConfig::only([EventKind::TextDelta]);
        assert!(config.allows(EventKind::TextDelta));
        assert!(!config.allows(EventKind::ToolCall));
        assert!(config.allows(EventKind::AgentDone));
        assert!(config.allows(EventKind::AgentSuspended));
    }

    #[test]
    fn registry_resolves_and_validates() {
        let registry = ManifestRegistry::new()
            .with(
                AgentManifest::builder("root", "1")
                    .sub_agent(SubAgentRef::new("helper", "helps", "child", "1"))
                    .build(),
            )
            .with(leaf("child"));
        registry.validate().unwrap();
        assert!(registry.get("child", "1").is_some());
        assert!(registry.get("child", "2").is_none());
    }

    #[test]
    fn registry_rejects_dangling_reference() {
        let registry = ManifestRegistry::new().with(
            AgentManifest::builder("root", "1")
                .sub_agent(SubAgentRef::new("helper", "helps", "ghost", "1"))
                .build(),
        );
        assert!(registry.validate().is_err());
    }

    #[test]
    fn registry_rejects_cycles() {
        let registry = ManifestRegistry::new()
            .with(
                AgentManifest::builder("a", "1")
                    .sub_agent(SubAgentRef::new("b", "to b", "b", "1"))
                    .build(),
            )
            .with(
                AgentManifest::builder("b", "1")
                    .sub_agent(SubAgentRef::new("a", "to a", "a", "1"))
                    .build(),
            );
        assert!(registry.validate().is_err());
    }

    #[test]
    fn output_tool_validation() {
        let spec = OutputToolSpec::new(ToolDefinition::new(
            "report",
            "final report",
            json!({"type": "object"}),
        ))
        .with_validator(|args| {
            args.get("title")
                .and_then(Value::as_str)
                .map(|_| ())
                .ok_or_else(|| "missing title".to_owned())
        });

        assert!(spec.validate(&json!({"title": "ok"})).is_ok());
        assert!(spec.validate(&json!({})).is_err());
    }
}
