//! Strata Core - shared error taxonomy and configuration.
//!
//! Used by the image library and the `strata` binary.

pub mod config;
pub mod error;
pub mod media_type;

// Re-export commonly used types
pub use config::{BuildConfig, RegistryConfig, StrataConfig, UploadMode};
pub use error::{Result, StrataError};

/// Strata version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
