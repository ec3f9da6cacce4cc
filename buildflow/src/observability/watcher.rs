//! Phase timing for event handlers.

use std::fmt;
use std::time::{Duration, Instant};

/// Records how long each phase of a handler took.
///
/// Starting a phase stops the previous one.
#[derive(Debug)]
pub struct Watcher {
    id: String,
    started: Instant,
    current: Option<(String, Instant)>,
    phases: Vec<(String, Duration)>,
}

impl Watcher {
    /// Starts a watcher with no running phase.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            started: Instant::now(),
            current: None,
            phases: Vec::new(),
        }
    }

    /// Starts timing `phase`.
    pub fn start(&mut self, phase: impl Into<String>) {
        self.stop();
        self.current = Some((phase.into(), Instant::now()));
    }

    /// Stops the running phase, if any.
    pub fn stop(&mut self) {
        if let Some((name, at)) = self.current.take() {
            self.phases.push((name, at.elapsed()));
        }
    }

    /// Total time since the watcher was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Completed phases in order.
    #[must_use]
    pub fn phases(&self) -> &[(String, Duration)] {
        &self.phases
    }

    /// Stops the running phase and logs the summary; warns if slower than `slow`.
    pub fn finish(mut self, slow: Duration) {
        self.stop();
        if self.elapsed() >= slow {
            tracing::warn!(watcher = %self, "Slow handler");
        } else {
            tracing::debug!(watcher = %self, "Handler timing");
        }
    }
}

impl fmt::Display for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)?;
        for (name, took) in &self.phases {
            write!(f, "|{name}={}ms", took.as_millis())?;
        }
        write!(f, "|total={}ms", self.elapsed().as_millis())
    }
}
