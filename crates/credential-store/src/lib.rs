//! Encrypted credential and routing-entity storage

mod cipher;
mod error;
mod model;
mod store;

pub use cipher::{CipherError, MIN_MASTER_KEY_LEN, SecretCipher};
pub use error::{Error, Result};
pub use model::{Credential, CredentialSummary, NewCredential, RoutingEntity, TokenUpdate};
pub use store::{
    CredentialLock, CredentialStore, generate_client_token, hash_client_token,
};
