//! Common types for the LLM credential gateway

mod clock;
mod error;
mod flight;
mod kind;
mod secret;

pub use clock::now_millis;
pub use error::{Error, Result};
pub use flight::{FlightAborted, Role, SingleFlight};
pub use kind::{CredentialKind, ProviderKind};
pub use secret::Secret;
