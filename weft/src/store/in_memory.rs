//! In-memory implementations of the durable-infrastructure contracts.
//!
//! These back the integration tests and single-process deployments. The state
//! cache stores serialized JSON documents rather than live values, so a
//! round-trip through it exercises the same text-only persistence boundary a
//! remote cache would.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use super::traits::{
    AgentCancellationCache, AgentRunLock, AgentStateCache, DEFAULT_LOCK_TTL, DEFAULT_STATE_TTL,
    DownloadUrlRequest, RunLockHandle, StorageService, StoredFile, UploadRequest,
};
use crate::context::{AgentRunId, RunContext};
use crate::error::{Error, Result};
use crate::state::AgentRunState;

/// In-memory state cache holding serialized JSON documents with TTL.
#[derive(Debug, Default)]
pub struct InMemoryStateCache {
    entries: Mutex<HashMap<AgentRunId, (String, Instant)>>,
}

impl InMemoryStateCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The raw persisted JSON document for a run, for inspection in tests.
    pub async fn raw_document(&self, id: &AgentRunId) -> Option<String> {
        self.entries
            .lock()
            .await
            .get(id)
            .map(|(doc, _)| doc.clone())
    }
}

#[async_trait]
impl AgentStateCache for InMemoryStateCache {
    async fn get(&self, _ctx: &RunContext, id: &AgentRunId) -> Result<Option<AgentRunState>> {
        let entries = self.entries.lock().await;
        match entries.get(id) {
            Some((_, expiry)) if *expiry <= Instant::now() => Ok(None),
            Some((doc, _)) => Ok(Some(serde_json::from_str(doc)?)),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        _ctx: &RunContext,
        id: &AgentRunId,
        state: &AgentRunState,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let doc = serde_json::to_string(state)?;
        let expiry = Instant::now() + ttl.unwrap_or(DEFAULT_STATE_TTL);
        self.entries.lock().await.insert(id.clone(), (doc, expiry));
        Ok(())
    }

    async fn del(&self, _ctx: &RunContext, id: &AgentRunId) -> Result<()> {
        self.entries.lock().await.remove(id);
        Ok(())
    }
}

type LockTable = Arc<Mutex<HashMap<AgentRunId, (u64, Instant)>>>;

/// In-memory run lock with TTL-bounded holds.
#[derive(Debug, Default)]
pub struct InMemoryRunLock {
    held: LockTable,
    tokens: AtomicU64,
    ttl: Option<Duration>,
}

impl InMemoryRunLock {
    /// Create a lock service with the default TTL.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a lock service with a custom TTL bound.
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            held: Arc::default(),
            tokens: AtomicU64::new(0),
            ttl: Some(ttl),
        }
    }
}

#[derive(Debug)]
struct InMemoryLockHandle {
    held: LockTable,
    id: AgentRunId,
    token: u64,
}

#[async_trait]
impl RunLockHandle for InMemoryLockHandle {
    async fn release(&self) -> Result<()> {
        let mut held = self.held.lock().await;
        if held.get(&self.id).is_some_and(|(token, _)| *token == self.token) {
            held.remove(&self.id);
        }
        Ok(())
    }
}

#[async_trait]
impl AgentRunLock for InMemoryRunLock {
    async fn acquire(
        &self,
        _ctx: &RunContext,
        id: &AgentRunId,
    ) -> Result<Option<Box<dyn RunLockHandle>>> {
        let mut held = self.held.lock().await;
        if held.get(id).is_some_and(|(_, expiry)| *expiry > Instant::now()) {
            return Ok(None);
        }
        let token = self.tokens.fetch_add(1, Ordering::Relaxed);
        let expiry = Instant::now() + self.ttl.unwrap_or(DEFAULT_LOCK_TTL);
        held.insert(id.clone(), (token, expiry));
        Ok(Some(Box::new(InMemoryLockHandle {
            held: Arc::clone(&self.held),
            id: id.clone(),
            token,
        })))
    }
}

/// In-memory cancellation-signal store.
#[derive(Debug, Default)]
pub struct InMemoryCancellationCache {
    requested: Mutex<HashSet<AgentRunId>>,
}

impl InMemoryCancellationCache {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentCancellationCache for InMemoryCancellationCache {
    async fn get(&self, _ctx: &RunContext, id: &AgentRunId) -> Result<bool> {
        Ok(self.requested.lock().await.contains(id))
    }

    async fn set(&self, _ctx: &RunContext, id: &AgentRunId) -> Result<()> {
        self.requested.lock().await.insert(id.clone());
        Ok(())
    }

    async fn del(&self, _ctx: &RunContext, id: &AgentRunId) -> Result<()> {
        self.requested.lock().await.remove(id);
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct StoredBlob {
    filename: String,
    data: Bytes,
}

/// In-memory blob store minting `memory://` signed URLs.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    files: Mutex<HashMap<(String, String), StoredBlob>>,
    signatures: AtomicU64,
}

impl InMemoryStorage {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn mint_url(&self, folder: &str, file_id: &str) -> String {
        let sig = self.signatures.fetch_add(1, Ordering::Relaxed);
        format!("memory://{folder}/{file_id}?sig={sig}")
    }

    /// Resolve a previously minted URL back to its bytes, for tests.
    pub async fn fetch(&self, url: &str) -> Option<Bytes> {
        let rest = url.strip_prefix("memory://")?;
        let (path, _) = rest.split_once('?')?;
        let (folder, file_id) = path.split_once('/')?;
        self.files
            .lock()
            .await
            .get(&(folder.to_owned(), file_id.to_owned()))
            .map(|blob| blob.data.clone())
    }
}

#[async_trait]
impl StorageService for InMemoryStorage {
    async fn upload(&self, request: UploadRequest) -> Result<StoredFile> {
        let url = self.mint_url(&request.folder, &request.id);
        self.files.lock().await.insert(
            (request.folder, request.id.clone()),
            StoredBlob {
                filename: request.filename.clone(),
                data: request.data,
            },
        );
        Ok(StoredFile {
            file_id: request.id,
            filename: request.filename,
            url,
        })
    }

    async fn download_url(&self, request: DownloadUrlRequest) -> Result<String> {
        let files = self.files.lock().await;
        let key = (request.folder.clone(), request.file_id.clone());
        let Some(blob) = files.get(&key) else {
            return Err(Error::storage(format!(
                "unknown file {}/{}",
                request.folder, request.file_id
            )));
        };
        debug_assert_eq!(blob.filename, request.filename);
        Ok(self.mint_url(&request.folder, &request.file_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_is_exclusive_and_double_release_is_safe() {
        let locks = InMemoryRunLock::new();
        let ctx = RunContext::new();
        let id = AgentRunId::from("run-1");

        let handle = locks.acquire(&ctx, &id).await.unwrap().unwrap();
        assert!(locks.acquire(&ctx, &id).await.unwrap().is_none());

        handle.release().await.unwrap();
        handle.release().await.unwrap();

        assert!(locks.acquire(&ctx, &id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_lock_can_be_reacquired() {
        let locks = InMemoryRunLock::with_ttl(Duration::from_millis(0));
        let ctx = RunContext::new();
        let id = AgentRunId::from("run-1");

        let _stale = locks.acquire(&ctx, &id).await.unwrap().unwrap();
        assert!(locks.acquire(&ctx, &id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cancellation_flag_roundtrip() {
        let cache = InMemoryCancellationCache::new();
        let ctx = RunContext::new();
        let id = AgentRunId::from("run-1");

        assert!(!cache.get(&ctx, &id).await.unwrap());
        cache.set(&ctx, &id).await.unwrap();
        assert!(cache.get(&ctx, &id).await.unwrap());
        cache.del(&ctx, &id).await.unwrap();
        assert!(!cache.get(&ctx, &id).await.unwrap());
    }

    #[tokio::test]
    async fn storage_mints_fresh_urls() {
        let storage = InMemoryStorage::new();
        let stored = storage
            .upload(UploadRequest {
                folder: "run-1".into(),
                id: "f1".into(),
                filename: "pic.png".into(),
                media_type: "image/png".into(),
                data: Bytes::from_static(b"\x89PNG"),
            })
            .await
            .unwrap();

        let reminted = storage
            .download_url(DownloadUrlRequest {
                file_id: "f1".into(),
                folder: "run-1".into(),
                filename: "pic.png".into(),
                expires_in: Duration::from_secs(60),
            })
            .await
            .unwrap();

        assert_ne!(stored.url, reminted);
        assert_eq!(
            storage.fetch(&reminted).await.unwrap(),
            Bytes::from_static(b"\x89PNG")
        );
    }
}
