//! Session management.
//!
//! Holds the one current `ACIXSTORE` token, runs logins single-flight, and
//! refreshes the token when a caller reports it as rejected. Token validity is
//! never predicted: it is inferred from Academic System responses only.

mod events;
mod in_flight;
mod manager;
mod tracker;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::{GatewayError, LoginError};
use crate::login::LoginReport;

pub use events::SessionEvent;
pub use manager::SessionManager;
pub use tracker::{FailureInfo, LoginFailureTracker};

#[cfg(test)]
pub(crate) use manager::testing;

/// An opaque Academic System session token.
///
/// Replaced wholesale on refresh, never mutated. `generation` strictly
/// increases across replacements.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub value: String,
    pub obtained_at: DateTime<Utc>,
    pub source_identifier: String,
    pub generation: u64,
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionToken")
            .field("generation", &self.generation)
            .field("source_identifier", &self.source_identifier)
            .field("obtained_at", &self.obtained_at)
            .finish_non_exhaustive()
    }
}

/// Something that can produce a fresh session token.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, cancel: &CancellationToken) -> Result<LoginReport, LoginError>;
}

/// What an action did with the token it was handed.
#[derive(Debug)]
pub enum TokenUse<T> {
    Done(T),
    /// The Academic System rejected the token.
    Rejected,
    Failed(GatewayError),
}
