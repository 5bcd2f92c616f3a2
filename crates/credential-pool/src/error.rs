//! Error types for credential selection and refresh

/// Why a token refresh did not produce a usable access token.
///
/// Cloneable because one refresh outcome is shared by every caller attached
/// to the flight, and cached as the reason of a cooldown.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    /// A recent refresh failed; no upstream call is attempted until the
    /// cooldown elapses.
    #[error("refresh cooling down after recent failure: {reason}")]
    CoolingDown { reason: String },

    /// The token endpoint refused the refresh token.
    #[error("refresh token rejected: {0}")]
    Rejected(String),

    #[error("token endpoint request failed: {0}")]
    Network(String),

    #[error("credential store error: {0}")]
    Store(String),

    #[error("credential is not an oauth credential")]
    NotOAuth,

    #[error("no refresh token stored for credential")]
    MissingRefreshToken,

    #[error("refresh task aborted: {0}")]
    Aborted(String),
}

impl RefreshError {
    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            RefreshError::CoolingDown { .. } => "cooling_down",
            RefreshError::Rejected(_) => "rejected",
            RefreshError::Network(_) => "network",
            RefreshError::Store(_) => "store",
            RefreshError::NotOAuth => "not_oauth",
            RefreshError::MissingRefreshToken => "missing_refresh_token",
            RefreshError::Aborted(_) => "aborted",
        }
    }
}

/// Authentication failures. Always client-visible, never retried here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("routing entity not found: {0}")]
    RoutingEntityNotFound(String),

    #[error("no credentials configured for routing entity {0}")]
    NoCredentialsConfigured(String),

    #[error("credential {credential} is not linked to routing entity {routing_entity}")]
    AccountNotLinked {
        credential: String,
        routing_entity: String,
    },

    #[error("no valid credentials for routing entity {0}")]
    NoValidCredentials(String),

    #[error("credential store error: {0}")]
    Store(#[from] credential_store::Error),
}

impl Error {
    /// Stable error-kind discriminator for client responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Store(_) => "api_error",
            _ => "authentication_error",
        }
    }

    /// HTTP status for client responses.
    pub fn status(&self) -> u16 {
        match self {
            Error::RoutingEntityNotFound(_) => 401,
            Error::AccountNotLinked { .. } => 403,
            Error::NoCredentialsConfigured(_) | Error::NoValidCredentials(_) => 503,
            Error::Store(_) => 500,
        }
    }
}

/// Result alias for selection.
pub type Result<T> = std::result::Result<T, Error>;
