//! Error types for the buildflow engine.
//!
//! Expected races (a stale event, an already finished build) are not
//! errors; they surface as a discarded [`crate::engine::Transition`]. The
//! types here cover lock contention, persistence, mutex and dispatch
//! failures, each of which the handlers classify as retryable or not.

use std::collections::HashMap;
use thiserror::Error;

/// The main error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Build lock failure.
    #[error("{0}")]
    Lock(#[from] LockError),

    /// State store failure.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// Mutex group failure.
    #[error("{0}")]
    Mutex(#[from] MutexError),

    /// Event dispatch failure.
    #[error("{0}")]
    Dispatch(#[from] DispatchError),

    /// A remote engine call made by a worker failed.
    #[error("Remote call {operation} failed: {message}")]
    Remote {
        /// The protocol operation.
        operation: String,
        /// The failure message.
        message: String,
        /// Whether the caller may retry.
        retryable: bool,
    },

    /// Measurement reporting failed.
    #[error("Measure error: {0}")]
    Measure(String),

    /// Invalid configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Returns true if redelivering the same event may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Lock(e) => matches!(e, LockError::Timeout { .. } | LockError::Backend(_)),
            Self::Store(e) => matches!(e, StoreError::Unavailable(_)),
            Self::Mutex(e) => matches!(e, MutexError::Queued { .. } | MutexError::Timeout { .. }),
            Self::Dispatch(_) => true,
            Self::Remote { retryable, .. } => *retryable,
            Self::Measure(_) | Self::Config(_) | Self::Serialization(_) | Self::Internal(_) => false,
        }
    }

    /// Creates a remote call error.
    #[must_use]
    pub fn remote(operation: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self::Remote {
            operation: operation.into(),
            message: message.into(),
            retryable,
        }
    }

    /// Converts to a dictionary representation for structured logs.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        let kind = match self {
            Self::Lock(_) => "lock",
            Self::Store(_) => "store",
            Self::Mutex(_) => "mutex",
            Self::Dispatch(_) => "dispatch",
            Self::Remote { .. } => "remote",
            Self::Measure(_) => "measure",
            Self::Config(_) => "config",
            Self::Serialization(_) => "serialization",
            Self::Internal(_) => "internal",
        };
        map.insert("type".to_string(), serde_json::json!(kind));
        map.insert("retryable".to_string(), serde_json::json!(self.is_retryable()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Errors from the distributed build lock.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// The lock could not be acquired within the allowed wait.
    #[error("Lock {key} not acquired within {waited_ms}ms")]
    Timeout {
        /// The lock key.
        key: String,
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// The token no longer owns the lock (lease expired or taken over).
    #[error("Lock {key} is not held by {holder}")]
    NotHeld {
        /// The lock key.
        key: String,
        /// The token's holder id.
        holder: String,
    },

    /// The lock backend failed.
    #[error("Lock backend error: {0}")]
    Backend(String),
}

/// Errors from the state store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// A referenced record does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Record type.
        entity: &'static str,
        /// Record key.
        id: String,
    },

    /// A write batch violated a store constraint and was rolled back.
    #[error("Write rejected: {0}")]
    Rejected(String),

    /// The store is temporarily unavailable.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }
}

/// Errors from the mutex group controller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MutexError {
    /// The container was queued behind the current holders.
    #[error("Mutex group {group} busy, queued at position {position}")]
    Queued {
        /// Resolved group name.
        group: String,
        /// 1-based position in the queue.
        position: usize,
    },

    /// The queued wait exceeded the group timeout.
    #[error("Mutex group {group} wait timed out after {waited_ms}ms")]
    Timeout {
        /// Resolved group name.
        group: String,
        /// How long the container waited.
        waited_ms: u64,
    },

    /// The group is busy and cannot queue the container.
    #[error("Mutex group {group} rejected container: {reason}")]
    Rejected {
        /// Resolved group name.
        group: String,
        /// Why the container was rejected.
        reason: String,
    },
}

/// Errors from the event dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The bus is closed.
    #[error("Dispatcher closed")]
    Closed,

    /// The bus refused the event.
    #[error("Dispatch of {kind} rejected: {reason}")]
    Rejected {
        /// Event kind.
        kind: String,
        /// Why it was rejected.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_timeout_is_retryable() {
        let err: EngineError = LockError::Timeout {
            key: "lock:build:b-1".to_string(),
            waited_ms: 100,
        }
        .into();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("lock:build:b-1"));
    }

    #[test]
    fn test_store_rejection_is_not_retryable() {
        let err: EngineError = StoreError::Rejected("constraint".to_string()).into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_mutex_errors() {
        let queued: EngineError = MutexError::Queued {
            group: "deploy".to_string(),
            position: 2,
        }
        .into();
        assert!(queued.is_retryable());

        let rejected: EngineError = MutexError::Rejected {
            group: "deploy".to_string(),
            reason: "queue disabled".to_string(),
        }
        .into();
        assert!(!rejected.is_retryable());
    }

    #[test]
    fn test_error_to_dict() {
        let err = EngineError::remote("claimTask", "503", true);
        let dict = err.to_dict();
        assert_eq!(dict.get("type").unwrap(), "remote");
        assert_eq!(dict.get("retryable").unwrap(), true);
    }

    #[test]
    fn test_not_found_display() {
        let err = StoreError::not_found("build", "b-9");
        assert_eq!(err.to_string(), "build not found: b-9");
    }
}
