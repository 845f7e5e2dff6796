//! Error types for the plant disease training pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the training pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// A dataset root, split directory or checkpoint artifact is missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Bad ratios or configuration values. Never clamped.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A single image could not be decoded
    #[error("Corrupt sample {}: {reason}", path.display())]
    CorruptSample { path: PathBuf, reason: String },

    /// A checkpoint artifact could not be fully deserialized
    #[error("Corrupt artifact {}: {reason}", path.display())]
    CorruptArtifact { path: PathBuf, reason: String },

    /// Numeric divergence or another unrecoverable failure inside a step
    #[error("Training failed: {0}")]
    TrainingFailed(String),

    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Model error
    #[error("Model error: {0}")]
    Model(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Stable name of the error kind, reported by the drivers.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NotFound",
            Error::InvalidArgument(_) => "InvalidArgument",
            Error::CorruptSample { .. } => "CorruptSample",
            Error::CorruptArtifact { .. } => "CorruptArtifact",
            Error::TrainingFailed(_) => "TrainingFailed",
            Error::Io(_) => "Io",
            Error::Model(_) => "Model",
            Error::Config(_) => "Config",
            Error::Serialization(_) => "Serialization",
        }
    }

    pub fn corrupt_sample(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::CorruptSample {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn corrupt_artifact(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::CorruptArtifact {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Specialized Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;
