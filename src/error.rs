//! Common error types for the dispatcher

use reqwest::{StatusCode, Url};
use std::time::Duration;
use thiserror::Error;

/// Failure reported by a transport for a single call
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server at {url} returned {status}: {body}")]
    Status {
        status: StatusCode,
        url: Url,
        body: String,
    },

    #[error("Connection failed to {0}")]
    Connect(String),

    #[error("No data received within {0:?}")]
    ReadTimeout(Duration),

    #[error("Failed to decode response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Transport failure: {0}")]
    Other(String),
}

impl TransportError {
    /// The request never reached the server, so any method may be retried
    pub fn is_connect_failure(&self) -> bool {
        match self {
            TransportError::Connect(_) => true,
            TransportError::Http(e) => e.is_connect(),
            _ => false,
        }
    }

    /// The server or the network failed in a way another attempt might not
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Connect(_) | TransportError::ReadTimeout(_) | TransportError::Other(_) => true,
            TransportError::Http(e) => e.is_connect() || e.is_timeout() || e.is_request() || e.is_body(),
            TransportError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            TransportError::Decode(_) => false,
        }
    }
}

/// Dispatcher-wide error type
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("No server available for: {0}")]
    NoServerAvailable(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: TransportError,
    },

    #[error("Stream bridge violation: {0}")]
    BridgeViolation(String),

    #[error("Dispatch cancelled")]
    Cancelled,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl From<reqwest::Error> for DispatchError {
    fn from(err: reqwest::Error) -> Self {
        DispatchError::Transport(TransportError::Http(err))
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, DispatchError>;
