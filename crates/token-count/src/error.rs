//! Error types for token counting

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid count_tokens request: {0}")]
    InvalidRequest(String),

    /// The tokenizer task panicked or was cancelled.
    #[error("tokenizer failed: {0}")]
    Tokenizer(String),
}

pub type Result<T> = std::result::Result<T, Error>;
