//! Error types for parley-session

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using parley-session Error
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification used by the UI to decide how to react
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Outgoing request was malformed; nothing was sent
    Validation,
    /// Network or backend failure
    Transport,
    /// The backend broke the event protocol
    Protocol,
    /// The user stopped the request
    Cancelled,
    /// A single attachment failed
    Upload,
}

/// Errors that can occur during a send/receive cycle
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the backend client layer
    #[error(transparent)]
    Api(#[from] parley_api::Error),

    /// An update referenced an unknown part, or a part was misused
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The backend reported a failure inside the stream
    #[error("Generation failed: {0}")]
    Backend(String),

    /// A file could not be validated or uploaded
    #[error("Upload failed: {0}")]
    Upload(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Api(e) if e.is_protocol() => ErrorKind::Protocol,
            Error::Api(parley_api::Error::InvalidRequest(_)) => ErrorKind::Validation,
            Error::Api(_) | Error::Backend(_) => ErrorKind::Transport,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Upload(_) => ErrorKind::Upload,
        }
    }

    /// Whether offering the user a retry makes sense
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Api(e) => e.is_retryable(),
            Error::Backend(_) => true,
            _ => false,
        }
    }

    /// Short text suitable for a toast
    pub fn user_message(&self) -> String {
        match self.kind() {
            ErrorKind::Validation => format!("Your message could not be sent. {}", self),
            ErrorKind::Transport if self.is_retryable() => {
                "Something went wrong, please try again.".to_string()
            }
            _ => self.to_string(),
        }
    }
}
