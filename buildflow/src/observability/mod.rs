//! Observability: logging setup and handler timing.

mod logging;
mod watcher;

pub use logging::init_logging;
pub use watcher::Watcher;
