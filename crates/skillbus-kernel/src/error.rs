//! Kernel error types.
//!
//! All kernel subsystems surface errors through [`KernelError`], which is the
//! single error type returned by every fallible public API in this crate.
//! Bus delivery and configuration misses are deliberately *not* errors: the
//! bus drops undeliverable messages and lookups fall back to defaults.

use std::path::PathBuf;

/// Unified error type for the skillbus kernel.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    // -- Message errors -----------------------------------------------------
    /// A serialized message could not be decoded.
    #[error("invalid message: {reason}")]
    InvalidMessage { reason: String },

    // -- Configuration errors -----------------------------------------------
    /// A configuration file exists but could not be read.
    #[error("failed to read config `{path}`: {reason}")]
    ConfigRead { path: PathBuf, reason: String },

    /// A configuration source could not be parsed.
    #[error("failed to parse config `{source_name}`: {reason}")]
    ConfigParse { source_name: String, reason: String },

    /// A configuration layer was not a mapping at its root.
    #[error("config layer `{name}` must be a table/object at the root")]
    ConfigNotAMapping { name: String },

    // -- Serialization ------------------------------------------------------
    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;
