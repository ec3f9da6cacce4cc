//! Testing utilities for the buildflow engine.
//!
//! This module provides:
//! - A fixture builder for build trees
//! - An engine harness over in-memory collaborators
//! - Assertions over transitions and dispatched events

mod assertions;
mod fixtures;
mod harness;

pub use assertions::{
    assert_applied, assert_discarded, assert_no_mutex_held, assert_no_stage_event,
    assert_stage_event, finish_events, stage_events,
};
pub use fixtures::{BuildFixture, FIXTURE_PIPELINE, FIXTURE_PROJECT};
pub use harness::EngineHarness;
