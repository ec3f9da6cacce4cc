//! In-process lease table.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::LockBackend;
use crate::errors::LockError;

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    expires_at: Instant,
}

impl Lease {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Lock backend holding leases in a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryLockBackend {
    leases: DashMap<String, Lease>,
}

impl InMemoryLockBackend {
    /// Creates an empty lease table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live leases.
    #[must_use]
    pub fn live_count(&self) -> usize {
        let now = Instant::now();
        self.leases.iter().filter(|l| l.is_live(now)).count()
    }
}

#[async_trait]
impl LockBackend for InMemoryLockBackend {
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = Instant::now();
        let lease = Lease {
            holder: holder.to_string(),
            expires_at: now + ttl,
        };
        match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let current = entry.get();
                if current.is_live(now) && current.holder != holder {
                    return Ok(false);
                }
                if current.holder != holder {
                    tracing::debug!(key, previous = %current.holder, "Taking over expired lease");
                }
                entry.insert(lease);
                Ok(true)
            }
            Entry::Vacant(entry) => {
                entry.insert(lease);
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, holder: &str) -> Result<bool, LockError> {
        Ok(self
            .leases
            .remove_if(key, |_, lease| lease.holder == holder)
            .is_some())
    }

    async fn renew(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = Instant::now();
        match self.leases.get_mut(key) {
            Some(mut lease) if lease.holder == holder && lease.is_live(now) => {
                lease.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn holder(&self, key: &str) -> Result<Option<String>, LockError> {
        let now = Instant::now();
        Ok(self
            .leases
            .get(key)
            .filter(|lease| lease.is_live(now))
            .map(|lease| lease.holder.clone()))
    }
}
