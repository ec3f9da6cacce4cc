//! Distributed build lock.
//!
//! Every state-mutating operation on a build runs while holding a
//! lease-based lock keyed by the build id. The lease expires on its own if
//! the holder crashes, so a dead process never wedges a build. Storage of
//! the lease is abstracted behind [`LockBackend`]; [`InMemoryLockBackend`]
//! serves single-process deployments and tests.
//!
//! # Example
//!
//! ```rust,ignore
//! let lock = BuildIdLock::new(Arc::new(InMemoryLockBackend::new()), LockConfig::default());
//! let token = lock.acquire("b-1").await?;
//! // ... mutate build b-1 ...
//! lock.release(&token).await?;
//! ```

mod build_lock;
mod memory;

pub use build_lock::{BuildIdLock, LockToken};
pub use memory::InMemoryLockBackend;

use async_trait::async_trait;
use std::time::Duration;

use crate::errors::LockError;

/// Storage for lock leases.
///
/// Implementations must make `try_acquire` atomic: two concurrent callers
/// for the same key can never both observe `true` while the lease is live.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Takes the lease if it is free, expired, or already held by `holder`.
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Drops the lease if `holder` owns it. Returns whether anything was released.
    async fn release(&self, key: &str, holder: &str) -> Result<bool, LockError>;

    /// Extends a live lease owned by `holder`. Returns false if the lease was lost.
    async fn renew(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Returns the current live holder of `key`, if any.
    async fn holder(&self, key: &str) -> Result<Option<String>, LockError>;
}
