//! Per-build lock with bounded acquisition.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::LockBackend;
use crate::config::LockConfig;
use crate::errors::LockError;
use crate::utils::generate_holder_id;

/// Proof of lock ownership, required to release or renew.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    /// The lock key.
    pub key: String,
    /// The locked build.
    pub build_id: String,
    /// Unique id of this acquisition.
    pub holder_id: String,
    /// Lease length granted.
    pub lease_ttl: Duration,
    /// How long acquisition waited.
    pub waited: Duration,
}

/// Serializes state mutations per build id.
#[derive(Clone)]
pub struct BuildIdLock {
    backend: Arc<dyn LockBackend>,
    config: LockConfig,
}

impl std::fmt::Debug for BuildIdLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildIdLock")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BuildIdLock {
    /// Creates a lock over `backend`.
    #[must_use]
    pub fn new(backend: Arc<dyn LockBackend>, config: LockConfig) -> Self {
        Self { backend, config }
    }

    /// Returns the lock key for a build.
    #[must_use]
    pub fn lock_key(build_id: &str) -> String {
        format!("process:build:lock:{build_id}")
    }

    /// Returns the configuration in use.
    #[must_use]
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Acquires the lock with the configured wait and lease.
    pub async fn acquire(&self, build_id: &str) -> Result<LockToken, LockError> {
        self.acquire_with(build_id, self.config.max_wait(), self.config.lease_ttl())
            .await
    }

    /// Acquires the lock, waiting at most `max_wait`.
    ///
    /// A zero `max_wait` makes exactly one attempt.
    pub async fn acquire_with(
        &self,
        build_id: &str,
        max_wait: Duration,
        lease_ttl: Duration,
    ) -> Result<LockToken, LockError> {
        let key = Self::lock_key(build_id);
        let holder_id = generate_holder_id();
        let started = Instant::now();
        let deadline = started + max_wait;
        let mut backoff = Duration::from_millis(self.config.retry_base_ms.max(1));
        let backoff_cap = Duration::from_millis(self.config.retry_max_ms.max(1));
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if self.backend.try_acquire(&key, &holder_id, lease_ttl).await? {
                let waited = started.elapsed();
                tracing::trace!(build_id, attempts, waited_ms = duration_ms(waited), "Build lock acquired");
                return Ok(LockToken {
                    key,
                    build_id: build_id.to_string(),
                    holder_id,
                    lease_ttl,
                    waited,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                let waited_ms = duration_ms(started.elapsed());
                tracing::debug!(build_id, attempts, waited_ms, "Build lock busy");
                return Err(LockError::Timeout { key, waited_ms });
            }

            let half = u64::try_from(backoff.as_millis() / 2).unwrap_or(0);
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=half));
            let delay = (backoff + jitter).min(deadline - now);
            tokio::time::sleep(delay).await;
            backoff = (backoff * 2).min(backoff_cap);
        }
    }

    /// Releases the lock. Releasing a lost lease is logged, not an error.
    pub async fn release(&self, token: &LockToken) -> Result<(), LockError> {
        if !self.backend.release(&token.key, &token.holder_id).await? {
            tracing::warn!(
                build_id = %token.build_id,
                holder = %token.holder_id,
                "Build lock lease was already gone on release"
            );
        }
        Ok(())
    }

    /// Extends the lease for a long-running operation.
    pub async fn renew(&self, token: &LockToken) -> Result<(), LockError> {
        if self
            .backend
            .renew(&token.key, &token.holder_id, token.lease_ttl)
            .await?
        {
            Ok(())
        } else {
            Err(LockError::NotHeld {
                key: token.key.clone(),
                holder: token.holder_id.clone(),
            })
        }
    }

    /// Returns true if someone currently holds the lock for `build_id`.
    pub async fn is_locked(&self, build_id: &str) -> Result<bool, LockError> {
        Ok(self.backend.holder(&Self::lock_key(build_id)).await?.is_some())
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
