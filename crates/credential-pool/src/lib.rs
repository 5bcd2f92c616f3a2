//! Credential selection and OAuth refresh coordination
//!
//! Two cooperating pieces sit between an authenticated client and the
//! upstream gateways:
//!
//! - `RefreshCoordinator` keeps OAuth access tokens valid. At most one
//!   renewal runs per credential; concurrent callers attach to it, and a
//!   failure puts the credential into a short cooldown so a revoked token
//!   can't cause a refresh storm.
//! - `AccountSelector` resolves a routing entity to its credentials, ranks
//!   them deterministically per routing key, and returns the first one that
//!   yields a usable token, with the headers that authenticate with it.
//!
//! Both are explicitly constructed and shared by `Arc`; nothing here is a
//! process-global.

pub mod error;
pub mod refresh;
pub mod selector;

pub use error::{Error, RefreshError, Result};
pub use refresh::{
    ExchangeFuture, RefreshCoordinator, RefreshSettings, RefreshStats, SweepOutcome,
    TokenExchanger,
};
pub use selector::{AccountSelector, rank_candidates};
