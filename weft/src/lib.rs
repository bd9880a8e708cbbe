#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(tail_expr_drop_order)]
//! Weft is a durable, streaming execution core for LLM-driven agent
//! workflows.
//!
//! An agent is a declarative [`manifest`](crate::manifest::AgentManifest):
//! model, instructions, tools, sub-agents, stop conditions. The
//! [`Orchestrator`] runs it as a multi-step loop in which each step calls the
//! model, streams events, and executes the requested tools, possibly in
//! parallel and possibly recursing into sub-agents. Runs persist resumable
//! state snapshots, suspend durably for human approval, and coordinate with
//! other processes through a distributed run lock.
//!
//! # Example
//!
//! ```rust,ignore
//! let registry = ManifestRegistry::new().with(
//!     AgentManifest::builder("assistant", "1")
//!         .instructions("You are a helpful assistant.")
//!         .tool(echo_definition)
//!         .hooks(ManifestHooks::new().tool_executor(echo_tool))
//!         .build(),
//! );
//! let orchestrator = Orchestrator::new(services, Arc::new(registry));
//!
//! let run = orchestrator.run(RunContext::new(), AgentInput::request("assistant", "1", "say hi"));
//! let (events, result) = collect_run(run).await;
//! ```

// Core value types
pub mod context;
pub mod error;
pub mod event;
pub mod message;
pub mod stream;
pub mod usage;

// Configuration and capabilities
pub mod hooks;
pub mod manifest;

// Durable model
pub mod state;
pub mod suspension;

// Collaborators
pub mod completion;
pub mod store;
pub mod tool;

// The execution engine
pub mod agent;

pub mod prelude;

pub use agent::{
    AgentInput, AgentRunResult, ContinueResponse, Orchestrator, RunItem, RunStream, Services,
    collect_run,
};
pub use context::{AgentRunId, RunContext};
pub use error::{Error, Result};
