//! Sightline Common Library
//!
//! Shared error taxonomy, types, configuration and log files for the
//! Sightline harness.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use config::HarnessConfig;
pub use error::{Error, ErrorClass, Result};
pub use logging::{RunLogs, TestLog};
pub use types::*;

/// Sightline version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
