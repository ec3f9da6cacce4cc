//! Helpers reading a task's failure and timeout options.

use std::time::Duration;

use crate::core::Task;

/// Returns true when a failure of `task` lets the container continue.
///
/// A task that asks for a manual skip on failure blocks instead.
#[must_use]
pub fn is_continue_when_failed(task: &Task) -> bool {
    let options = &task.additional_options;
    options.continue_when_failed && options.manual_skip != Some(true)
}

/// The task's timeout in minutes, if it has one.
#[must_use]
pub fn timeout_minutes(task: &Task) -> Option<u64> {
    task.additional_options.timeout.filter(|m| *m > 0)
}

/// The task's timeout as a duration.
#[must_use]
pub fn timeout(task: &Task) -> Option<Duration> {
    timeout_minutes(task).map(|m| Duration::from_secs(m.saturating_mul(60)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Container, ContainerKind};

    fn task() -> Task {
        let container = Container::new("b-1", "s-1", "1", ContainerKind::Normal);
        Task::new(&container, "t-1", 1, "linuxScript")
    }

    #[test]
    fn test_continue_when_failed_respects_manual_skip() {
        let mut t = task();
        assert!(!is_continue_when_failed(&t));

        t.additional_options.continue_when_failed = true;
        assert!(is_continue_when_failed(&t));

        t.additional_options.manual_skip = Some(false);
        assert!(is_continue_when_failed(&t));

        t.additional_options.manual_skip = Some(true);
        assert!(!is_continue_when_failed(&t));
    }

    #[test]
    fn test_timeout_defaults_and_zero() {
        let mut t = task();
        assert_eq!(timeout_minutes(&t), Some(100));
        assert_eq!(timeout(&t), Some(Duration::from_secs(6_000)));

        t.additional_options.timeout = Some(0);
        assert_eq!(timeout_minutes(&t), None);

        t.additional_options.timeout = None;
        assert_eq!(timeout(&t), None);
    }
}
