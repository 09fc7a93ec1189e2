//! Cluster membership over a hierarchical coordination store.
//!
//! Each process opens an authenticated session against the store, publishes
//! itself under a registry directory (a persistent root for the coordinator
//! role, one ephemeral child per worker), and keeps a full member table in
//! the hosting application up to date by re-reading the directory on every
//! child-list change. Session loss is absorbed by a bounded reconnection
//! loop with linear backoff; exhaustion of that budget is escalated to the
//! host as a fatal error.
//!
//! The store itself and the hosting application are capabilities: see
//! [`store::StoreClient`] / [`store::StoreConnector`] and
//! [`registry::ServerRegistry`]. [`store::memory`] ships an in-process
//! store for local development and tests.

pub mod auth;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod membership;
pub mod registrar;
pub mod registry;
pub mod session;
pub mod store;

pub use config::MembershipConfig;
pub use error::MembershipError;
pub use membership::Membership;
pub use registry::{MemberTable, NodeRole, ServerRecord, ServerRegistry};
