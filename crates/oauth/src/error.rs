//! Error types for OAuth token operations

/// Errors from OAuth token operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    /// The token endpoint refused the grant (revoked or invalid refresh
    /// token, bad authorization code). Retrying with the same input is futile.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
}

impl Error {
    pub fn is_rejection(&self) -> bool {
        matches!(self, Error::InvalidCredentials(_))
    }
}

/// Result alias for OAuth operations.
pub type Result<T> = std::result::Result<T, Error>;
