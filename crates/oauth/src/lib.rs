//! OAuth client library
//!
//! Provides PKCE generation and the two token-endpoint calls the gateway
//! needs: authorization-code exchange and refresh-token grant. Storage of
//! the resulting tokens belongs to the credential store.
//!
//! Credential flow:
//! 1. Admin calls `pkce::generate_verifier()` + `pkce::compute_challenge()`
//! 2. User authorizes via `pkce::build_authorization_url()`
//! 3. Gateway calls `OAuthClient::exchange_code()` with the pasted code
//! 4. The credential store persists the tokens encrypted
//! 5. The refresh coordinator calls `OAuthClient::refresh()` when a token is due

pub mod client;
pub mod config;
pub mod error;
pub mod pkce;

pub use client::{OAuthClient, TokenResponse};
pub use config::OAuthConfig;
pub use error::{Error, Result};
pub use pkce::{build_authorization_url, compute_challenge, generate_state, generate_verifier};
