//! Error types for the localization engine.
//!
//! Only structural failures surface as errors: a bad configuration or a bad
//! frame source aborts the run. Per-candidate fit failures are
//! [`FitRejection`](crate::fit::FitRejection)s and never abort anything.

use thiserror::Error;

/// Failure reported by a [`FrameSource`](crate::frame::FrameSource).
#[derive(Debug, Error)]
pub enum FrameSourceError {
    #[error("Frame index {index} out of range (frame count {count})")]
    OutOfRange { index: usize, count: usize },

    #[error("Failed to decode frame {index}: {reason}")]
    Decode { index: usize, reason: String },
}

/// Invalid or unreadable configuration. Raised before any frame is read.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Failed to parse configuration: {0}")]
    Yaml(#[from] serde_yml::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Bad input data. Fatal for the run.
#[derive(Debug, Error)]
pub enum InputError {
    #[error(transparent)]
    Source(#[from] FrameSourceError),

    #[error("Malformed frame {index}: {reason}")]
    MalformedFrame { index: usize, reason: String },
}

/// Top-level error of a localization run.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Input(#[from] InputError),
}

impl From<FrameSourceError> for Error {
    fn from(err: FrameSourceError) -> Self {
        Error::Input(InputError::Source(err))
    }
}
