//! Error kinds delivered to completion callbacks.

use thiserror::Error;

/// Why a transfer ended without (or before) delivering every byte.
///
/// Cloned once per registered listener, so every variant carries owned data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP error: status {status}")]
    Http { status: u16 },

    #[error("network error: {0}")]
    Network(String),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("unexpected content type: expected {expected}, got {actual}")]
    UnexpectedContentType { expected: String, actual: String },

    #[error("coordinator is shut down")]
    Shutdown,
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => FetchError::Http {
                status: status.as_u16(),
            },
            None => FetchError::Network(e.to_string()),
        }
    }
}
