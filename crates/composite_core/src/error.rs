//! Core error types

use thiserror::Error;

/// Errors raised while loading or validating settings
#[derive(Error, Debug)]
pub enum CoreError {
    /// Settings file could not be read
    #[error("Failed to read settings from {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Settings text is not valid TOML for [`crate::BakeSettings`]
    #[error("Invalid settings: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value parsed but is outside its allowed range
    #[error("Invalid setting {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
