use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Network unreachable, timeout, server-side failure or a malformed response.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The backend understood the request and refused it.
    #[error("Rejected by backend ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Service error: {0}")]
    Service(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Remote failures never take the process down; the caller may retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Rejected { .. })
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
