use std::time::Duration;

use thiserror::Error;

/// Reasons a raw payload could not be turned into a half record.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("payload is empty")]
    Empty,
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("payload has no usable \"id\" field")]
    MissingCorrelationKey,
}

/// A single failed attempt against the analytics sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("transient sink failure: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("permanent sink failure: {message}")]
    Permanent { message: String },
}

impl SinkError {
    pub fn transient(message: impl Into<String>) -> Self {
        SinkError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        SinkError::Permanent {
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Transient { .. })
    }

    /// The delay the sink asked us to wait before trying again, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SinkError::Transient { retry_after, .. } => *retry_after,
            SinkError::Permanent { .. } => None,
        }
    }
}

/// Terminal outcome of a delivery that never reached the sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("delivery rejected after {attempts} attempt(s): {source}")]
    Permanent { attempts: u32, source: SinkError },
    #[error("retries exhausted after {attempts} attempt(s): {source}")]
    Exhausted { attempts: u32, source: SinkError },
}

impl DeliveryError {
    pub fn attempts(&self) -> u32 {
        match self {
            DeliveryError::Permanent { attempts, .. }
            | DeliveryError::Exhausted { attempts, .. } => *attempts,
        }
    }
}
