//! Assertions over engine state and dispatched events.

use crate::core::{ActionType, BuildStatus, PipelineEvent};
use crate::engine::Transition;
use crate::mutex::MutexGroupController;

/// Asserts that an operation changed state.
pub fn assert_applied<T: std::fmt::Debug>(transition: &Transition<T>) {
    assert!(
        transition.is_applied(),
        "Expected applied transition, got {transition:?}"
    );
}

/// Asserts that an operation was discarded.
pub fn assert_discarded<T: std::fmt::Debug>(transition: &Transition<T>) {
    assert!(
        !transition.is_applied(),
        "Expected discarded transition, got {transition:?}"
    );
}

/// Returns the `(stage_id, action)` pairs of dispatched stage events.
#[must_use]
pub fn stage_events(events: &[PipelineEvent]) -> Vec<(String, ActionType)> {
    events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::Stage(stage) => Some((stage.stage_id.clone(), stage.action_type)),
            _ => None,
        })
        .collect()
}

/// Returns the statuses of dispatched build-finish events.
#[must_use]
pub fn finish_events(events: &[PipelineEvent]) -> Vec<BuildStatus> {
    events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::BuildFinish(finish) => Some(finish.status),
            _ => None,
        })
        .collect()
}

/// Asserts that a stage event with `action` was dispatched to `stage_id`.
pub fn assert_stage_event(events: &[PipelineEvent], stage_id: &str, action: ActionType) {
    let found = stage_events(events);
    assert!(
        found.iter().any(|(id, a)| id == stage_id && *a == action),
        "Expected StageEvent({stage_id}, {action}), dispatched: {found:?}"
    );
}

/// Asserts that no stage event with `action` was dispatched to `stage_id`.
pub fn assert_no_stage_event(events: &[PipelineEvent], stage_id: &str, action: ActionType) {
    let found = stage_events(events);
    assert!(
        !found.iter().any(|(id, a)| id == stage_id && *a == action),
        "Unexpected StageEvent({stage_id}, {action}), dispatched: {found:?}"
    );
}

/// Asserts that `build_id` holds no mutex group.
pub fn assert_no_mutex_held(controller: &MutexGroupController, build_id: &str) {
    assert!(
        !controller.build_holds_any(build_id),
        "Build {build_id} still holds a mutex group"
    );
}
