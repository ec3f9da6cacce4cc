//! Mutex group registry with FIFO queueing.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{decorate, MutexGroup, MutexOwner};
use crate::config::MutexConfig;
use crate::core::MutexGroupSpec;
use crate::errors::MutexError;

/// Result of a non-blocking acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexAcquire {
    /// The container holds the group.
    Granted,
    /// The container waits in the queue at this 1-based position.
    Queued(usize),
    /// The group is disabled or unnamed; nothing to hold.
    NotRequired,
}

#[derive(Debug)]
struct Waiter {
    owner: MutexOwner,
    enqueued_at: Instant,
}

#[derive(Debug, Default)]
struct GroupState {
    holders: Vec<MutexOwner>,
    queue: VecDeque<Waiter>,
}

impl GroupState {
    fn queue_position(&self, owner: &MutexOwner) -> Option<usize> {
        self.queue.iter().position(|w| &w.owner == owner)
    }

    fn is_idle(&self) -> bool {
        self.holders.is_empty() && self.queue.is_empty()
    }
}

/// Process-wide registry of mutex groups, shared across builds.
///
/// Independent of the build lock: a group can span builds and projects.
#[derive(Debug)]
pub struct MutexGroupController {
    groups: Mutex<HashMap<String, GroupState>>,
    released: Notify,
    config: MutexConfig,
}

impl Default for MutexGroupController {
    fn default() -> Self {
        Self::new(MutexConfig::default())
    }
}

impl MutexGroupController {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(config: MutexConfig) -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            released: Notify::new(),
            config,
        }
    }

    /// Resolves a container's declared group using the configured default timeout.
    #[must_use]
    pub fn decorate(&self, spec: &MutexGroupSpec, variables: &HashMap<String, String>) -> MutexGroup {
        let default_timeout =
            Duration::from_secs(u64::from(self.config.default_timeout_minutes) * 60);
        decorate(spec, variables, default_timeout)
    }

    /// Attempts to take the group without waiting.
    ///
    /// Idempotent: a current holder gets `Granted` again, a queued container
    /// keeps its position. A queued container whose wait exceeded the group
    /// timeout is dequeued and gets [`MutexError::Timeout`].
    pub fn try_acquire(
        &self,
        owner: &MutexOwner,
        group: &MutexGroup,
    ) -> Result<MutexAcquire, MutexError> {
        if !group.is_active() {
            return Ok(MutexAcquire::NotRequired);
        }

        let now = Instant::now();
        let mut groups = self.groups.lock();
        let state = groups.entry(group.name.clone()).or_default();

        if state.holders.contains(owner) {
            return Ok(MutexAcquire::Granted);
        }

        // Waiters that gave up must not block the head of the queue.
        state
            .queue
            .retain(|w| &w.owner == owner || now.duration_since(w.enqueued_at) < group.timeout);

        let position = state.queue_position(owner);
        let has_slot = state.holders.len() < group.capacity.max(1);

        if has_slot && position.map_or(state.queue.is_empty(), |p| p == 0) {
            if position.is_some() {
                state.queue.pop_front();
            }
            state.holders.push(owner.clone());
            tracing::info!(
                group = %group.name,
                build_id = %owner.build_id,
                container_id = %owner.container_id,
                "Mutex group acquired"
            );
            return Ok(MutexAcquire::Granted);
        }

        if position.is_none() && !group.queue_enable {
            return Err(MutexError::Rejected {
                group: group.name.clone(),
                reason: "group is busy and queueing is disabled".to_string(),
            });
        }

        if group.timeout.is_zero() {
            if let Some(index) = position {
                state.queue.remove(index);
            }
            return Err(timeout_error(group, Duration::ZERO));
        }

        if let Some(index) = position {
            let waited = now.duration_since(state.queue[index].enqueued_at);
            if waited >= group.timeout {
                state.queue.remove(index);
                drop(groups);
                self.released.notify_waiters();
                return Err(timeout_error(group, waited));
            }
            return Ok(MutexAcquire::Queued(index + 1));
        }

        if state.queue.len() >= group.queue_size {
            return Err(MutexError::Rejected {
                group: group.name.clone(),
                reason: format!("queue is full ({} waiting)", state.queue.len()),
            });
        }

        state.queue.push_back(Waiter {
            owner: owner.clone(),
            enqueued_at: now,
        });
        let position = state.queue.len();
        tracing::info!(
            group = %group.name,
            build_id = %owner.build_id,
            container_id = %owner.container_id,
            position,
            "Mutex group busy, container queued"
        );
        Ok(MutexAcquire::Queued(position))
    }

    /// Waits until the group is granted or the group timeout elapses.
    ///
    /// On timeout the container is removed from the queue so it never
    /// blocks later waiters. A zero timeout fails without waiting.
    pub async fn acquire(&self, owner: &MutexOwner, group: &MutexGroup) -> Result<(), MutexError> {
        let started = Instant::now();
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));

        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            match self.try_acquire(owner, group)? {
                MutexAcquire::Granted | MutexAcquire::NotRequired => return Ok(()),
                MutexAcquire::Queued(_) => {}
            }

            let waited = started.elapsed();
            if waited >= group.timeout {
                self.dequeue(owner, group);
                return Err(timeout_error(group, waited));
            }

            let remaining = group.timeout - waited;
            let _ = tokio::time::timeout(poll.min(remaining), released).await;
        }
    }

    /// Releases the group for `owner` and drops it from the queue.
    ///
    /// Calling this for a container that never acquired is a no-op.
    /// Returns true if the container was a holder.
    pub fn release(&self, owner: &MutexOwner, group: &MutexGroup) -> bool {
        if !group.is_active() {
            return false;
        }
        let released = {
            let mut groups = self.groups.lock();
            let Some(state) = groups.get_mut(&group.name) else {
                return false;
            };
            let before = state.holders.len();
            state.holders.retain(|h| h != owner);
            state.queue.retain(|w| &w.owner != owner);
            let released = state.holders.len() < before;
            if state.is_idle() {
                groups.remove(&group.name);
            }
            released
        };

        if released {
            tracing::info!(
                group = %group.name,
                build_id = %owner.build_id,
                container_id = %owner.container_id,
                "Mutex group released"
            );
        }
        self.released.notify_waiters();
        released
    }

    /// Releases every hold and queue entry owned by `build_id`.
    ///
    /// Returns the number of holds released.
    pub fn release_all_for_build(&self, build_id: &str) -> usize {
        let released = {
            let mut groups = self.groups.lock();
            let mut released = 0;
            for state in groups.values_mut() {
                let before = state.holders.len();
                state.holders.retain(|h| h.build_id != build_id);
                state.queue.retain(|w| w.owner.build_id != build_id);
                released += before - state.holders.len();
            }
            groups.retain(|_, state| !state.is_idle());
            released
        };
        if released > 0 {
            tracing::warn!(build_id, released, "Released residual mutex holds");
        }
        self.released.notify_waiters();
        released
    }

    /// Current holders of a group.
    #[must_use]
    pub fn holders(&self, group_name: &str) -> Vec<MutexOwner> {
        self.groups
            .lock()
            .get(group_name)
            .map(|s| s.holders.clone())
            .unwrap_or_default()
    }

    /// Number of containers waiting for a group.
    #[must_use]
    pub fn queue_len(&self, group_name: &str) -> usize {
        self.groups.lock().get(group_name).map_or(0, |s| s.queue.len())
    }

    /// Returns true if any container of `build_id` holds any group.
    #[must_use]
    pub fn build_holds_any(&self, build_id: &str) -> bool {
        self.groups
            .lock()
            .values()
            .any(|s| s.holders.iter().any(|h| h.build_id == build_id))
    }

    fn dequeue(&self, owner: &MutexOwner, group: &MutexGroup) {
        let mut groups = self.groups.lock();
        if let Some(state) = groups.get_mut(&group.name) {
            state.queue.retain(|w| &w.owner != owner);
            if state.is_idle() {
                groups.remove(&group.name);
            }
        }
        drop(groups);
        self.released.notify_waiters();
    }
}

fn timeout_error(group: &MutexGroup, waited: Duration) -> MutexError {
    MutexError::Timeout {
        group: group.name.clone(),
        waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
    }
}
