//! Membership error types.

use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum MembershipError {
    /// The store's connected signal did not arrive within the caller's
    /// deadline. The underlying connection attempt is not cancelled, only
    /// the wait.
    #[error("timed out waiting for the store's connected signal")]
    ConnectTimeout,

    #[error("store session lost")]
    SessionLost,

    #[error("failed to create node {path}")]
    NodeCreate {
        path: String,
        #[source]
        source: StoreError,
    },

    /// Another process holds the member node for this server id.
    #[error("node {path} is held by another process (pid {claimant:?})")]
    NodeConflict { path: String, claimant: Option<u32> },

    #[error("failed to read member {child}")]
    Read {
        child: String,
        #[source]
        source: StoreError,
    },

    /// The fan-in barrier did not accumulate every read in time; the round
    /// published nothing.
    #[error("discovery round did not complete within {timeout:?}")]
    DiscoveryTimeout { timeout: Duration },

    /// The registry directory reported no children at all. Distinguished
    /// from "all records temporarily unreachable".
    #[error("registry {path} has no members")]
    EmptyRegistry { path: String },

    /// The application-level reconnect budget ran out. Fatal for this
    /// process's cluster participation.
    #[error("reconnect budget of {attempts} attempts exhausted")]
    ReconnectExhausted { attempts: u32 },

    #[error("member record encoding failed")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}
