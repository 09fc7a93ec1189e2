//! Hosting-application capability and the member data model.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A member's published record. Serialized as UTF-8 JSON with camelCase
/// keys; application-defined fields survive round trips via `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub id: String,
    pub server_type: String,
    pub host: String,
    pub port: u16,
    /// Host process identifier, injected at registration time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ServerRecord {
    pub fn new(
        id: impl Into<String>,
        server_type: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            server_type: server_type.into(),
            host: host.into(),
            port,
            pid: None,
            extra: HashMap::new(),
        }
    }
}

/// Complete membership snapshot, keyed by server id. Only ever replaced
/// wholesale, never patched.
pub type MemberTable = HashMap<String, ServerRecord>;

/// Server type that takes the coordinator role.
pub const COORDINATOR_TYPE: &str = "master";

/// Role under which a process registers itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Owns the persistent registry root.
    Coordinator,
    /// Publishes an ephemeral member node.
    Worker,
}

impl NodeRole {
    pub fn from_server_type(server_type: &str) -> Self {
        if server_type == COORDINATOR_TYPE {
            Self::Coordinator
        } else {
            Self::Worker
        }
    }
}

/// What the hosting application provides to the membership layer: this
/// process's identity and record, statically configured peers, and the
/// member table that discovery replaces atomically.
pub trait ServerRegistry: Send + Sync {
    fn server_id(&self) -> String;

    fn server_type(&self) -> String;

    /// This process's record as it should be published.
    fn current_server(&self) -> ServerRecord;

    /// A peer known from static configuration rather than the store, if any.
    fn server_from_config(&self, id: &str) -> Option<ServerRecord>;

    /// Swap in a freshly discovered member table. Implementations must
    /// replace the whole table in one step; discovery never issues partial
    /// updates.
    fn replace_servers(&self, servers: MemberTable);
}
