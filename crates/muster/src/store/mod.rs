//! Coordination-store capability.
//!
//! The membership layer does not speak any wire protocol itself; it consumes
//! a hierarchical store of named nodes through the [`StoreClient`] trait and
//! obtains fresh clients through a [`StoreConnector`]. A real deployment
//! implements these over its coordination service; [`memory`] provides an
//! in-process implementation for local development and tests.
//!
//! Watch semantics are subscribe-once: [`StoreClient::children_and_watch`]
//! arms exactly one notification for the *next* child-list change, and the
//! caller must re-subscribe after every fire.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Persistence kind for a created node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives the creating session.
    Persistent,
    /// Removed automatically when the creating session ends.
    Ephemeral,
}

impl CreateMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Persistent => "persistent",
            Self::Ephemeral => "ephemeral",
        }
    }
}

/// Session-level signals emitted by a store client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The store acknowledged the session.
    Connected,
    /// The session was lost; ephemeral nodes it owned are gone.
    Disconnected,
}

/// Permission granted by an access-control entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Read,
    All,
}

/// Access-control entry applied to a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclEntry {
    pub scheme: String,
    pub id: String,
    pub perms: Permission,
}

/// Version wildcard: apply a versioned operation unconditionally.
pub const ANY_VERSION: i32 = -1;

/// Stream of session events. One stream per constructed client; a reconnect
/// always builds a fresh client and therefore a fresh stream.
pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

/// Single-shot notification for the next child-list change under a path.
///
/// An `Err` on await means the session that armed the watch is gone and the
/// notification can never arrive.
pub type ChildWatch = oneshot::Receiver<()>;

/// A connected client plus the event stream carrying its session signals.
pub struct StoreSession {
    pub client: Arc<dyn StoreClient>,
    pub events: SessionEvents,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("node already exists: {path}")]
    NodeExists { path: String },

    #[error("node does not exist: {path}")]
    NoNode { path: String },

    #[error("store connection lost")]
    ConnectionLoss,

    #[error("could not reach any store host")]
    Unavailable,

    #[error("malformed path: {path}")]
    BadPath { path: String },
}

/// One session's view of the coordination store.
///
/// All operations are non-blocking from the caller's perspective and may be
/// issued concurrently from multiple tasks.
#[async_trait]
pub trait StoreClient: Send + Sync {
    async fn exists(&self, path: &str) -> Result<bool, StoreError>;

    /// Create `path` with `payload`. Fails with [`StoreError::NodeExists`]
    /// if the node is present and [`StoreError::NoNode`] if its parent is
    /// missing.
    async fn create(
        &self,
        path: &str,
        payload: Bytes,
        mode: CreateMode,
    ) -> Result<(), StoreError>;

    async fn get_data(&self, path: &str) -> Result<Bytes, StoreError>;

    async fn get_children(&self, path: &str) -> Result<Vec<String>, StoreError>;

    /// Read the child list of `path` and arm exactly one single-shot watch
    /// for its next change. Re-subscription is the caller's responsibility
    /// and must happen with (or before) the follow-up read so that a change
    /// landing in between still produces a notification.
    async fn children_and_watch(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, ChildWatch), StoreError>;

    async fn add_auth(&self, scheme: &str, credential: Bytes) -> Result<(), StoreError>;

    /// Set the access-control list of `path`. [`ANY_VERSION`] overwrites
    /// unconditionally.
    async fn set_acl(
        &self,
        path: &str,
        acl: Vec<AclEntry>,
        version: i32,
    ) -> Result<(), StoreError>;

    /// Release the session. Idempotent; a deliberate close does not emit
    /// [`SessionEvent::Disconnected`].
    async fn close(&self);
}

/// Factory for store sessions. Every connect attempt constructs a fresh
/// client with its own event stream; clients are replaced, never reused,
/// across reconnects.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> Result<StoreSession, StoreError>;
}

/// Parent of a node path, or `None` for a top-level node.
pub(crate) fn parent_of(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) | None => None,
        Some(idx) => Some(&path[..idx]),
    }
}
