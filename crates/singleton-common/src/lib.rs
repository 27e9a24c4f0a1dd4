//! Shared plumbing for processes that run singleton tasks.

pub mod identity;
pub mod logging;

pub use identity::hostname;
pub use logging::init_logging;
