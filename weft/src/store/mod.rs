//! Durable-infrastructure contracts and their in-memory implementations.
//!
//! The executor coordinates with four external services: a state cache with
//! TTL, a distributed named run lock, a cancellation-signal store, and a blob
//! store for binary message content. Production backends live behind these
//! traits; the in-memory variants back the tests and single-process use.

mod in_memory;
mod traits;

pub use in_memory::{
    InMemoryCancellationCache, InMemoryRunLock, InMemoryStateCache, InMemoryStorage,
};
pub use traits::{
    AgentCancellationCache, AgentRunLock, AgentStateCache, DEFAULT_LOCK_TTL, DEFAULT_STATE_TTL,
    DownloadUrlRequest, RunLockHandle, StorageService, StoredFile, UploadRequest,
};
