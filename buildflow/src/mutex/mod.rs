//! Mutex groups: named, cross-build exclusion domains for containers.
//!
//! A container declaring a mutex group must hold it while running. The
//! group name may reference build variables (`${var}`), resolved by
//! [`decorate`] before the group is used. A disabled group, or one whose
//! name resolves blank, is a no-op everywhere.

mod controller;

pub use controller::{MutexAcquire, MutexGroupController};

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use crate::core::{Container, MutexGroupSpec};

/// A resolved mutex group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutexGroup {
    /// Group name after variable substitution.
    pub name: String,
    /// Whether the mutex is enforced.
    pub enable: bool,
    /// Maximum concurrent holders.
    pub capacity: usize,
    /// Whether containers may wait in a queue when the group is full.
    pub queue_enable: bool,
    /// Maximum queue length.
    pub queue_size: usize,
    /// How long a queued container may wait.
    pub timeout: Duration,
}

impl MutexGroup {
    /// Creates an enabled single-holder group without a queue.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enable: true,
            capacity: 1,
            queue_enable: false,
            queue_size: 0,
            timeout: Duration::ZERO,
        }
    }

    /// Enables queueing with the given length and wait timeout.
    #[must_use]
    pub fn with_queue(mut self, queue_size: usize, timeout: Duration) -> Self {
        self.queue_enable = true;
        self.queue_size = queue_size;
        self.timeout = timeout;
        self
    }

    /// Sets the maximum number of concurrent holders.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Returns true if acquiring or releasing this group does anything.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.enable && !self.name.trim().is_empty()
    }
}

/// Identifies the container holding or waiting for a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutexOwner {
    /// Owning project.
    pub project_id: String,
    /// Owning build.
    pub build_id: String,
    /// Owning stage.
    pub stage_id: String,
    /// The container.
    pub container_id: String,
}

impl MutexOwner {
    /// Creates an owner reference.
    #[must_use]
    pub fn new(
        project_id: impl Into<String>,
        build_id: impl Into<String>,
        stage_id: impl Into<String>,
        container_id: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            build_id: build_id.into(),
            stage_id: stage_id.into(),
            container_id: container_id.into(),
        }
    }

    /// Builds the owner reference for a container.
    #[must_use]
    pub fn of(project_id: &str, container: &Container) -> Self {
        Self::new(
            project_id,
            &container.build_id,
            &container.stage_id,
            &container.container_id,
        )
    }
}

static VARIABLE_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\$\{\{?\s*([A-Za-z0-9_.\-]+)\s*\}?\}").ok());

/// Replaces `${name}` and `${{ name }}` references with build variables.
///
/// Unknown references are left in place.
#[must_use]
pub fn decorate_name(raw: &str, variables: &HashMap<String, String>) -> String {
    let Some(pattern) = VARIABLE_PATTERN.as_ref() else {
        return raw.to_string();
    };
    pattern
        .replace_all(raw, |caps: &regex::Captures<'_>| {
            variables
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Resolves a declared mutex group against build variables.
///
/// `default_timeout` applies when the declaration sets none.
#[must_use]
pub fn decorate(
    spec: &MutexGroupSpec,
    variables: &HashMap<String, String>,
    default_timeout: Duration,
) -> MutexGroup {
    let name = spec
        .mutex_group_name
        .as_deref()
        .map(|raw| decorate_name(raw, variables).trim().to_string())
        .unwrap_or_default();
    let timeout = spec
        .timeout_minutes
        .map_or(default_timeout, |m| Duration::from_secs(u64::from(m) * 60));

    MutexGroup {
        name,
        enable: spec.enable,
        capacity: 1,
        queue_enable: spec.queue_enable,
        queue_size: usize::try_from(spec.queue).unwrap_or(usize::MAX),
        timeout,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn vars() -> HashMap<String, String> {
        [("env", "prod"), ("region", "eu-1")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_decorate_name_substitutes_variables() {
        assert_eq!(decorate_name("deploy-${env}-${region}", &vars()), "deploy-prod-eu-1");
        assert_eq!(decorate_name("deploy-${{ env }}", &vars()), "deploy-prod");
    }

    #[test]
    fn test_decorate_name_keeps_unknown_references() {
        assert_eq!(decorate_name("lock-${missing}", &vars()), "lock-${missing}");
        assert_eq!(decorate_name("plain", &vars()), "plain");
    }

    #[test]
    fn test_decorate_resolves_spec() {
        let spec = MutexGroupSpec {
            enable: true,
            mutex_group_name: Some(" db-${env} ".to_string()),
            queue_enable: true,
            queue: 3,
            timeout_minutes: Some(2),
        };
        let group = decorate(&spec, &vars(), Duration::from_secs(60));
        assert_eq!(
            group,
            MutexGroup::new("db-prod").with_queue(3, Duration::from_secs(120))
        );
        assert!(group.is_active());
    }

    #[test]
    fn test_decorate_applies_default_timeout() {
        let spec = MutexGroupSpec {
            enable: true,
            mutex_group_name: Some("m".to_string()),
            ..MutexGroupSpec::default()
        };
        let group = decorate(&spec, &vars(), Duration::from_secs(90));
        assert_eq!(group.timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_blank_or_disabled_group_is_inactive() {
        let blank = MutexGroupSpec {
            enable: true,
            mutex_group_name: Some("   ".to_string()),
            ..MutexGroupSpec::default()
        };
        assert!(!decorate(&blank, &vars(), Duration::ZERO).is_active());

        let disabled = MutexGroupSpec {
            enable: false,
            mutex_group_name: Some("m".to_string()),
            ..MutexGroupSpec::default()
        };
        assert!(!decorate(&disabled, &vars(), Duration::ZERO).is_active());
    }
}
