use thiserror::Error;

use crate::cancel::Interrupted;
use crate::notification::retry::RetryError;
use crate::rate_limit::RateLimitError;

/// Anything that stops an approval round short of an operator verdict.
/// Every variant resolves to a reject.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("transport error: {0}")]
    Transport(#[source] RetryError),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error(transparent)]
    Interrupted(#[from] Interrupted),

    #[error("internal fault: {0}")]
    Panicked(String),
}

impl From<RetryError> for GateError {
    /// An interruption while a transport call was in flight is reported as
    /// the interruption itself, not as a transport fault.
    fn from(e: RetryError) -> Self {
        match e {
            RetryError::Interrupted { source, .. } => GateError::Interrupted(source),
            other => GateError::Transport(other),
        }
    }
}

impl GateError {
    /// Short reason shown to the operator.
    pub fn reason(&self) -> String {
        self.to_string()
    }
}
