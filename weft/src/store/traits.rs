//! Contracts for the executor's durable collaborators.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::context::{AgentRunId, RunContext};
use crate::error::Result;
use crate::state::AgentRunState;

/// Default TTL for persisted run state.
pub const DEFAULT_STATE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default TTL bounding a run lock.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);

/// Key-value cache of persisted run state, keyed by opaque run id.
#[async_trait]
pub trait AgentStateCache: Send + Sync {
    /// Load a state snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend fails; a missing key is `Ok(None)`.
    async fn get(&self, ctx: &RunContext, id: &AgentRunId) -> Result<Option<AgentRunState>>;

    /// Persist a state snapshot. `ttl` defaults to [`DEFAULT_STATE_TTL`].
    ///
    /// # Errors
    ///
    /// Returns an error when the backend fails.
    async fn set(
        &self,
        ctx: &RunContext,
        id: &AgentRunId,
        state: &AgentRunState,
        ttl: Option<Duration>,
    ) -> Result<()>;

    /// Delete a state snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend fails.
    async fn del(&self, ctx: &RunContext, id: &AgentRunId) -> Result<()>;
}

/// A held run lock. Dropping the handle without releasing leaves the lock to
/// expire by TTL.
#[async_trait]
pub trait RunLockHandle: Send + Sync {
    /// Release the lock. Releasing twice is safe.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend fails; callers treat release as
    /// best-effort.
    async fn release(&self) -> Result<()>;
}

/// Distributed named lock guarding one run state per executor.
#[async_trait]
pub trait AgentRunLock: Send + Sync {
    /// Try to acquire the lock for a run.
    ///
    /// Returns `None` when another holder is alive, without blocking.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend fails.
    async fn acquire(
        &self,
        ctx: &RunContext,
        id: &AgentRunId,
    ) -> Result<Option<Box<dyn RunLockHandle>>>;
}

/// Cancellation-signal store; presence of a key means "cancel requested".
#[async_trait]
pub trait AgentCancellationCache: Send + Sync {
    /// Whether cancellation has been requested for the run.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend fails.
    async fn get(&self, ctx: &RunContext, id: &AgentRunId) -> Result<bool>;

    /// Request cancellation of the run.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend fails.
    async fn set(&self, ctx: &RunContext, id: &AgentRunId) -> Result<()>;

    /// Clear the cancellation signal.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend fails.
    async fn del(&self, ctx: &RunContext, id: &AgentRunId) -> Result<()>;
}

/// Payload for a blob upload.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Namespace for the file, usually the run id.
    pub folder: String,
    /// Caller-chosen file identifier.
    pub id: String,
    /// Filename recorded alongside the blob.
    pub filename: String,
    /// Media type of the payload.
    pub media_type: String,
    /// The payload itself.
    pub data: Bytes,
}

/// Result of a blob upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    /// Identifier of the stored file.
    pub file_id: String,
    /// Filename recorded at upload time.
    pub filename: String,
    /// Signed download URL valid for a limited time.
    pub url: String,
}

/// Parameters for re-minting a signed download URL.
#[derive(Debug, Clone)]
pub struct DownloadUrlRequest {
    /// Identifier of the stored file.
    pub file_id: String,
    /// Namespace the file was uploaded under.
    pub folder: String,
    /// Filename recorded at upload time.
    pub filename: String,
    /// How long the minted URL stays valid.
    pub expires_in: Duration,
}

/// Blob store for binary message content.
#[async_trait]
pub trait StorageService: Send + Sync {
    /// Upload a blob and return its stored-file reference.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend fails.
    async fn upload(&self, request: UploadRequest) -> Result<StoredFile>;

    /// Mint a fresh signed URL for a previously uploaded blob.
    ///
    /// # Errors
    ///
    /// Returns an error when the blob is unknown or the backend fails.
    async fn download_url(&self, request: DownloadUrlRequest) -> Result<String>;
}
