use thiserror::Error;

/// Message shown when the backend rejects the credentials.
pub const AUTH_FAILED_MESSAGE: &str = "Authentication failed: the API key was rejected";

/// Terminal failure of a single completion request.
///
/// Cancellation is not an error: a cancelled stream resolves as a successful
/// (possibly empty) [`crate::domain::models::StreamOutcome`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CompletionError {
    #[error("{}", AUTH_FAILED_MESSAGE)]
    AuthFailed,

    #[error("{message}")]
    Http { status: u16, message: String },

    /// Error event reported inside an otherwise healthy stream.
    #[error("{0}")]
    Provider(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl CompletionError {
    pub fn is_auth(&self) -> bool {
        matches!(self, CompletionError::AuthFailed)
    }
}

impl From<reqwest::Error> for CompletionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            CompletionError::InvalidRequest(err.to_string())
        } else {
            CompletionError::Network(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, CompletionError>;
