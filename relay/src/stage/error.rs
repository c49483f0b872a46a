//! Stage error types

use std::error::Error as StdError;
use std::time::Duration;

use thiserror::Error;

use crate::sink::SinkError;

/// Errors that can end a stage run
#[derive(Debug, Error)]
pub enum StageError {
    #[error("{stage} credential is not configured (set {env})")]
    MissingCredential { stage: String, env: String },

    #[error("API error {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Connection error: {}", error_chain(.0))]
    Connectivity(#[source] reqwest::Error),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Sink(#[from] SinkError),
}

impl StageError {
    /// Classify a transport failure from the HTTP client
    pub fn from_transport(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            StageError::Timeout(timeout)
        } else {
            StageError::Connectivity(err)
        }
    }

    /// True when the client went away; such failures are not reported to it
    pub fn is_disconnect(&self) -> bool {
        matches!(self, StageError::Sink(SinkError::Disconnected))
    }
}

// reqwest hides the interesting cause (DNS, refused, TLS) in the source chain.
fn error_chain(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
