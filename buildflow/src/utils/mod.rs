//! Id generation.

use uuid::Uuid;

/// Generates a compact trace id for event correlation.
#[must_use]
pub fn generate_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Generates a time-ordered holder id for lock leases.
#[must_use]
pub fn generate_holder_id() -> String {
    Uuid::now_v7().to_string()
}
