//! State owned by a single task execution attempt.

use std::collections::HashMap;

use serde_json::Value;

use super::BuildVariables;
use crate::core::Task;
use crate::engine::TaskResult;

/// Environment and monitor data accumulated while one task runs.
///
/// Created per attempt and consumed by [`TaskAttempt::into_result`]; nothing
/// survives into the next task.
#[derive(Debug, Clone)]
pub struct TaskAttempt {
    task: Task,
    env: HashMap<String, String>,
    monitor_data: HashMap<String, Value>,
}

impl TaskAttempt {
    /// Starts an attempt with the build variables as base environment.
    ///
    /// A task with `enable_custom_env` overlays its custom entries; blank
    /// keys are ignored.
    #[must_use]
    pub fn new(task: Task, variables: &BuildVariables) -> Self {
        let mut env = variables.variables.clone();
        let options = &task.additional_options;
        if options.enable_custom_env {
            for (key, value) in &options.custom_env {
                if !key.trim().is_empty() {
                    env.insert(key.clone(), value.clone());
                }
            }
        }
        Self {
            task,
            env,
            monitor_data: HashMap::new(),
        }
    }

    /// The task being attempted.
    #[must_use]
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Adds or replaces one environment entry.
    pub fn add_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    /// Reads one environment entry.
    #[must_use]
    pub fn env(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    /// All environment entries.
    #[must_use]
    pub fn all_env(&self) -> &HashMap<String, String> {
        &self.env
    }

    /// Merges monitor data.
    pub fn add_monitor_data(&mut self, data: HashMap<String, Value>) {
        self.monitor_data.extend(data);
    }

    /// Collected monitor data.
    #[must_use]
    pub fn monitor_data(&self) -> &HashMap<String, Value> {
        &self.monitor_data
    }

    /// Ends the attempt, producing the result to report.
    #[must_use]
    pub fn into_result(self, outcome: Result<(), String>) -> TaskResult {
        let mut result = match outcome {
            Ok(()) => TaskResult::success(self.task.task_id),
            Err(message) => TaskResult::failure(self.task.task_id, message),
        };
        result.monitor_data = self.monitor_data;
        result
    }
}
