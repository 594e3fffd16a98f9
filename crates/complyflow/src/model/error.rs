use std::time::Duration;

use thiserror::Error;

use crate::error::FailureClass;

/// Failure of a single request to the model endpoint.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Throttled by model service")]
    Throttled { retry_after: Option<Duration> },

    #[error("Model request timed out")]
    Timeout,

    #[error("Model service unavailable (HTTP {status})")]
    Unavailable { status: u16 },

    #[error("Model service rejected the request (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Failed to reach model service: {0}")]
    Connection(String),

    #[error("Unreadable model service response: {0}")]
    Decode(String),
}

impl TransportError {
    /// Whether the same request may succeed if sent again. An unreadable
    /// reply is not a delivery failure; the invoker re-prompts for it.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Rejected { .. } | TransportError::Decode(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvokeError {
    #[error("Model call failed after {attempts} attempts: {last}")]
    TransientExhausted { attempts: u32, last: TransportError },

    #[error("Model response does not match schema '{schema}': {detail}")]
    InvalidResponse { schema: String, detail: String },

    #[error("Model request is not retryable: {0}")]
    NonRetryable(TransportError),

    #[error("Model circuit breaker open, retry in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },

    #[error("Unknown response schema '{0}'")]
    UnknownSchema(String),
}

impl InvokeError {
    /// A stage that sees its model call exhaust retries gives up on the
    /// document; only an open breaker is worth retrying at stage level.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            InvokeError::CircuitOpen { .. } => FailureClass::Transient,
            InvokeError::TransientExhausted { .. }
            | InvokeError::InvalidResponse { .. }
            | InvokeError::NonRetryable(_)
            | InvokeError::UnknownSchema(_) => FailureClass::Permanent,
        }
    }

    /// Short label used in logs and events.
    pub fn kind(&self) -> &'static str {
        match self {
            InvokeError::TransientExhausted {
                last: TransportError::Throttled { .. },
                ..
            } => "throttled",
            InvokeError::TransientExhausted { .. } => "transient-exhausted",
            InvokeError::InvalidResponse { .. } => "invalid-response",
            InvokeError::NonRetryable(_) => "non-retryable",
            InvokeError::CircuitOpen { .. } => "circuit-open",
            InvokeError::UnknownSchema(_) => "unknown-schema",
        }
    }
}
