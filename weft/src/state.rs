//! Persisted run state.
//!
//! An [`AgentRunState`] is the resumable snapshot of one run. While an
//! executor holds the run lock it owns the state exclusively; otherwise the
//! state cache does. Snapshots are text-only: [`offload_binary_parts`] moves
//! raw bytes into the blob store before persisting and [`rehydrate_messages`]
//! re-mints signed URLs after loading.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::context::AgentRunId;
use crate::error::Result;
use crate::manifest::AgentManifest;
use crate::message::{BinarySource, ContentPart, Message, MessageContent};
use crate::store::{DownloadUrlRequest, StorageService, UploadRequest};
use crate::stream::FinishReason;
use crate::suspension::{Suspension, SuspensionStack};
use crate::tool::{ToolCall, ToolResultPart};
use crate::usage::Usage;

/// Version stamp of the persisted layout.
pub const SCHEMA_VERSION: u32 = 1;

/// How long re-minted download URLs stay valid.
pub const DOWNLOAD_URL_TTL: std::time::Duration = std::time::Duration::from_secs(15 * 60);

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// A live executor holds the run lock and is driving the loop.
    Running,
    /// The run finished with a result.
    Completed,
    /// The run is durably paused awaiting external input.
    Suspended,
    /// The run was cancelled.
    Cancelled,
    /// The run failed.
    Failed,
}

impl RunStatus {
    /// String representation of the status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Suspended => "suspended",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    /// Whether the run can no longer make progress without new input.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Lineage of a nested run: which parent frame invoked it, and through which
/// tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentContext {
    /// State id of the invoking run.
    pub state_id: AgentRunId,
    /// Manifest id of the invoking agent.
    pub manifest_id: String,
    /// The tool call on the parent that spawned this run.
    pub tool_call_id: String,
}

/// Durable record of one completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// 1-based step number.
    pub step_number: u32,
    /// Assistant text produced during the step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Tool calls the model requested.
    pub tool_calls: Vec<ToolCall>,
    /// Results of the calls that completed.
    pub tool_results: Vec<ToolResultPart>,
    /// Why the model stopped.
    pub finish_reason: FinishReason,
    /// Token usage for the step.
    pub usage: Usage,
}

/// The per-run mutable snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRunState {
    /// Identifier of the run; doubles as the state-cache key.
    pub run_id: AgentRunId,
    /// Manifest id of the root agent of the whole run tree.
    pub root_manifest_id: String,
    /// Manifest id of the agent this state belongs to.
    pub manifest_id: String,
    /// Manifest version of the agent this state belongs to.
    pub manifest_version: String,
    /// Lineage when this run is a nested sub-agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_context: Option<ParentContext>,
    /// Conversation so far.
    pub messages: Vec<Message>,
    /// Completed step records.
    pub steps: Vec<StepRecord>,
    /// Number of the most recently started step.
    pub current_step_number: u32,
    /// Suspensions owned by this run itself.
    pub suspensions: Vec<Suspension>,
    /// Stacks describing suspensions inside nested sub-agents.
    pub suspension_stacks: Vec<SuspensionStack>,
    /// Completed peer results of a partially suspended step, replayed on
    /// resume.
    pub pending_tool_results: Vec<ToolResultPart>,
    /// Lifecycle status.
    pub status: RunStatus,
    /// When the run first began executing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the state was first created.
    pub created_at: DateTime<Utc>,
    /// When the state was last persisted.
    pub updated_at: DateTime<Utc>,
    /// Execution time accumulated across resumes, excluding suspended time.
    pub elapsed_execution_ms: u64,
    /// State ids of sub-agent runs spawned by this run that remain live.
    pub child_state_ids: Vec<AgentRunId>,
    /// Version stamp of this layout.
    pub schema_version: u32,
    /// Caller-supplied context variables.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    /// Output-tool validation retries consumed so far.
    pub output_validation_retries: u32,
    /// Execution-time budget for the whole run, across resumes.
    pub timeout_ms: u64,
}

impl AgentRunState {
    /// Create a fresh state for a new run of `manifest`.
    #[must_use]
    pub fn new(
        run_id: AgentRunId,
        manifest: &AgentManifest,
        root_manifest_id: impl Into<String>,
        parent_context: Option<ParentContext>,
        messages: Vec<Message>,
        context: Option<Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            root_manifest_id: root_manifest_id.into(),
            manifest_id: manifest.id.clone(),
            manifest_version: manifest.version.clone(),
            parent_context,
            messages,
            steps: Vec::new(),
            current_step_number: 0,
            suspensions: Vec::new(),
            suspension_stacks: Vec::new(),
            pending_tool_results: Vec::new(),
            status: RunStatus::Running,
            started_at: None,
            created_at: now,
            updated_at: now,
            elapsed_execution_ms: 0,
            child_state_ids: Vec::new(),
            schema_version: SCHEMA_VERSION,
            context,
            output_validation_retries: 0,
            timeout_ms: manifest.timeout_ms,
        }
    }

    /// Mark the state as running, stamping `started_at` on first execution.
    pub fn mark_running(&mut self) {
        self.status = RunStatus::Running;
        let now = Utc::now();
        self.started_at.get_or_insert(now);
        self.updated_at = now;
    }

    /// Refresh the `updated_at` stamp.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Whether any message still carries raw bytes.
    #[must_use]
    pub fn has_raw_bytes(&self) -> bool {
        self.messages.iter().any(Message::has_raw_bytes)
    }

    /// Total usage across recorded steps.
    #[must_use]
    pub fn total_usage(&self) -> Usage {
        self.steps
            .iter()
            .fold(Usage::zero(), |acc, step| acc + step.usage)
    }
}

/// Replace raw bytes in `messages` with stored-file references.
///
/// Uploads go under a folder named after the run id so that blobs share the
/// lifetime of their run.
///
/// # Errors
///
/// Returns a storage error when an upload fails.
pub async fn offload_binary_parts(
    storage: &dyn StorageService,
    run_id: &AgentRunId,
    messages: &mut [Message],
) -> Result<()> {
    for message in messages.iter_mut() {
        let MessageContent::Parts(parts) = &mut message.content else {
            continue;
        };
        for part in parts.iter_mut() {
            let (media_type, filename, source) = match part {
                ContentPart::Image { media_type, source } => (media_type.clone(), None, source),
                ContentPart::File {
                    media_type,
                    filename,
                    source,
                } => (media_type.clone(), filename.clone(), source),
                _ => continue,
            };
            let BinarySource::Bytes { data } = source else {
                continue;
            };

            let file_id = Uuid::new_v4().simple().to_string();
            let filename = filename.unwrap_or_else(|| format!("{file_id}.bin"));
            let stored = storage
                .upload(UploadRequest {
                    folder: run_id.as_str().to_owned(),
                    id: file_id,
                    filename,
                    media_type,
                    data: data.clone(),
                })
                .await?;

            *source = BinarySource::Stored {
                url: stored.url,
                storage_file_id: stored.file_id,
                storage_filename: stored.filename,
            };
        }
    }
    Ok(())
}

/// Re-mint signed URLs on every stored-file reference in `messages`.
///
/// # Errors
///
/// Returns a storage error when a referenced blob is unknown.
pub async fn rehydrate_messages(
    storage: &dyn StorageService,
    run_id: &AgentRunId,
    messages: &mut [Message],
) -> Result<()> {
    for message in messages.iter_mut() {
        let MessageContent::Parts(parts) = &mut message.content else {
            continue;
        };
        for part in parts.iter_mut() {
            let source = match part {
                ContentPart::Image { source, .. } | ContentPart::File { source, .. } => source,
                _ => continue,
            };
            let BinarySource::Stored {
                url,
                storage_file_id,
                storage_filename,
            } = source
            else {
                continue;
            };

            *url = storage
                .download_url(DownloadUrlRequest {
                    file_id: storage_file_id.clone(),
                    folder: run_id.as_str().to_owned(),
                    filename: storage_filename.clone(),
                    expires_in: DOWNLOAD_URL_TTL,
                })
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::AgentManifest;
    use crate::store::InMemoryStorage;
    use bytes::Bytes;

    fn manifest() -> AgentManifest {
        AgentManifest::builder("echo-agent", "1")
            .instructions("echo things")
            .build()
    }

    fn binary_message() -> Message {
        Message {
            role: crate::message::Role::User,
            content: MessageContent::Parts(vec![ContentPart::Image {
                media_type: "image/png".into(),
                source: BinarySource::Bytes {
                    data: Bytes::from_static(b"\x89PNG-bytes"),
                },
            }]),
        }
    }

    #[test]
    fn fresh_state_defaults() {
        let state = AgentRunState::new(
            AgentRunId::from("run-1"),
            &manifest(),
            "echo-agent",
            None,
            vec![Message::user("hi")],
            None,
        );
        assert_eq!(state.status, RunStatus::Running);
        assert_eq!(state.schema_version, SCHEMA_VERSION);
        assert_eq!(state.current_step_number, 0);
        assert!(state.started_at.is_none());
        assert_eq!(state.elapsed_execution_ms, 0);
    }

    #[tokio::test]
    async fn offload_then_rehydrate_roundtrip() {
        let storage = InMemoryStorage::new();
        let run_id = AgentRunId::from("run-1");
        let mut messages = vec![binary_message()];

        offload_binary_parts(&storage, &run_id, &mut messages)
            .await
            .unwrap();
        assert!(!messages[0].has_raw_bytes());

        let MessageContent::Parts(parts) = &messages[0].content else {
            panic!("expected parts");
        };
        let ContentPart::Image {
            source: BinarySource::Stored { url, .. },
            ..
        } = &parts[0]
        else {
            panic!("expected stored image");
        };
        let first_url = url.clone();
        assert_eq!(
            storage.fetch(&first_url).await.unwrap(),
            Bytes::from_static(b"\x89PNG-bytes")
        );

        rehydrate_messages(&storage, &run_id, &mut messages)
            .await
            .unwrap();
        let MessageContent::Parts(parts) = &messages[0].content else {
            panic!("expected parts");
        };
        let ContentPart::Image {
            source: BinarySource::Stored { url, .. },
            ..
        } = &parts[0]
        else {
            panic!("expected stored image");
        };
        assert_ne!(*url, first_url);
        assert_eq!(
            storage.fetch(url).await.unwrap(),
            Bytes::from_static(b"\x89PNG-bytes")
        );
    }

    #[test]
    fn status_terminality() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Suspended.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
    }
}
