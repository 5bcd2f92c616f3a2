//! Error types for credential storage

use crate::cipher::CipherError;

/// Errors from credential store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    /// A token replacement targeted a credential that is not OAuth.
    #[error("credential kind mismatch: {0}")]
    KindMismatch(String),

    #[error("duplicate credential name: {0}")]
    DuplicateName(String),

    /// Secret fields do not fit the credential kind.
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    #[error(transparent)]
    Crypto(#[from] CipherError),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("credential document parse error: {0}")]
    Parse(String),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
