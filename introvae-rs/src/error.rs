//! Error types for introvae-rs.
//!
//! Every failure in this crate is fatal to a training run: configuration
//! errors surface at startup, data errors when the shards are first read,
//! and checkpoint errors when a restore is attempted. Nothing is retried.
//!
//! # Example
//!
//! ```rust
//! use introvae_rs::{IntroVaeConfig, IntroVaeError};
//!
//! match IntroVaeConfig::from_preset("no-such-preset") {
//!     Ok(_) => unreachable!(),
//!     Err(IntroVaeError::Config(msg)) => assert!(msg.contains("no-such-preset")),
//!     Err(e) => panic!("unexpected error: {e}"),
//! }
//! ```

use thiserror::Error;

/// Result type alias for introvae-rs operations.
pub type Result<T> = std::result::Result<T, IntroVaeError>;

/// Errors that can occur in introvae-rs.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum IntroVaeError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Malformed or missing dataset shards.
    #[error("data error: {0}")]
    Data(String),

    /// Network construction error.
    #[error("model error: {0}")]
    Model(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// Checkpoint error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// JSON serialization error.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Image encoding error.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl IntroVaeError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a data error.
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Create a checkpoint error.
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a training error.
    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }
}

impl From<indicatif::style::TemplateError> for IntroVaeError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        IntroVaeError::Template(err.to_string())
    }
}
