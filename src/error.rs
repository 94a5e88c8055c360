use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DspError {
    #[error("Invalid filter specification: `{parameter}` {reason}")]
    InvalidFilterSpec { parameter: String, reason: String },

    #[error("Sampling rate mismatch ({context}): expected {expected} Hz, got {actual} Hz")]
    SamplingRateMismatch {
        expected: f64,
        actual: f64,
        context: String,
    },

    #[error("Insufficient samples: {required} required, {available} available")]
    InsufficientSamples { required: usize, available: usize },

    #[error("Event at sample {sample} lies outside the recording ({n_samples} samples)")]
    MissingEvent { sample: usize, n_samples: usize },

    #[error("Invalid parameter: `{name}` {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Sample source error: {0}")]
    Source(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl DspError {
    pub fn filter_spec(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        DspError::InvalidFilterSpec {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    pub fn parameter(name: impl Into<String>, reason: impl Into<String>) -> Self {
        DspError::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Configuration-level errors abort the requested operation; the rest
    /// may be recovered per event.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            DspError::InsufficientSamples { .. } | DspError::MissingEvent { .. }
        )
    }
}

impl From<serde_json::Error> for DspError {
    fn from(err: serde_json::Error) -> Self {
        DspError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DspError>;
