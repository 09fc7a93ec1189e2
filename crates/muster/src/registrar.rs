//! Idempotent self-registration in the registry directory.

use std::sync::Arc;

use bytes::Bytes;

use crate::config::MembershipConfig;
use crate::error::MembershipError;
use crate::events;
use crate::registry::{NodeRole, ServerRecord, ServerRegistry};
use crate::store::{CreateMode, StoreClient, StoreError, parent_of};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CreateOutcome {
    Created,
    AlreadyExists,
}

pub struct Registrar {
    client: Arc<dyn StoreClient>,
    registry: Arc<dyn ServerRegistry>,
    config: MembershipConfig,
}

impl Registrar {
    pub fn new(
        client: Arc<dyn StoreClient>,
        registry: Arc<dyn ServerRegistry>,
        config: MembershipConfig,
    ) -> Self {
        Self {
            client,
            registry,
            config,
        }
    }

    /// Publish this process in the registry. A no-op when the node is
    /// already present and ours.
    pub async fn register(&self, role: NodeRole) -> Result<(), MembershipError> {
        match role {
            NodeRole::Coordinator => self.register_root().await,
            NodeRole::Worker => self.register_member().await,
        }
    }

    /// Create the persistent registry root (and any missing ancestors) with
    /// an empty payload.
    async fn register_root(&self) -> Result<(), MembershipError> {
        let path = self.config.base_path.clone();
        let mut ancestors = Vec::new();
        let mut cursor = path.as_str();
        while let Some(parent) = parent_of(cursor) {
            ancestors.push(parent);
            cursor = parent;
        }
        for ancestor in ancestors.into_iter().rev() {
            self.create_if_absent(ancestor, Bytes::new(), CreateMode::Persistent)
                .await
                .map_err(|source| MembershipError::NodeCreate {
                    path: ancestor.to_string(),
                    source,
                })?;
        }

        self.create_if_absent(&path, Bytes::new(), CreateMode::Persistent)
            .await
            .map_err(|source| MembershipError::NodeCreate {
                path: path.clone(),
                source,
            })?;

        events::node_registered(
            &self.registry.server_id(),
            &path,
            CreateMode::Persistent.as_str(),
        );
        Ok(())
    }

    /// Create this process's ephemeral member node, payload = the current
    /// server record with the host process id injected.
    async fn register_member(&self) -> Result<(), MembershipError> {
        let mut record = self.registry.current_server();
        record.pid = Some(std::process::id());

        let payload = Bytes::from(serde_json::to_vec(&record)?);
        let path = self.config.node_path(&record.id);

        let outcome = self
            .create_if_absent(&path, payload, CreateMode::Ephemeral)
            .await
            .map_err(|source| MembershipError::NodeCreate {
                path: path.clone(),
                source,
            })?;

        if outcome == CreateOutcome::AlreadyExists {
            self.verify_claimant(&path, &record).await?;
        }

        events::node_registered(
            &self.registry.server_id(),
            &path,
            CreateMode::Ephemeral.as_str(),
        );
        Ok(())
    }

    /// Existence-then-create. The check is best-effort rather than a
    /// distributed lock, so a concurrent creator can still win between the
    /// two calls; a `NodeExists` from the create is therefore folded into
    /// `AlreadyExists` instead of surfacing as an error.
    async fn create_if_absent(
        &self,
        path: &str,
        payload: Bytes,
        mode: CreateMode,
    ) -> Result<CreateOutcome, StoreError> {
        if self.client.exists(path).await? {
            return Ok(CreateOutcome::AlreadyExists);
        }
        match self.client.create(path, payload, mode).await {
            Ok(()) => Ok(CreateOutcome::Created),
            Err(StoreError::NodeExists { .. }) => Ok(CreateOutcome::AlreadyExists),
            Err(err) => Err(err),
        }
    }

    /// An existing member node is benign only if it carries our own record;
    /// a different claimant of the same server id is a hard conflict.
    async fn verify_claimant(
        &self,
        path: &str,
        record: &ServerRecord,
    ) -> Result<(), MembershipError> {
        let payload = self
            .client
            .get_data(path)
            .await
            .map_err(|source| MembershipError::Read {
                child: record.id.clone(),
                source,
            })?;
        let existing: ServerRecord = serde_json::from_slice(&payload)?;

        if existing == *record {
            return Ok(());
        }
        Err(MembershipError::NodeConflict {
            path: path.to_string(),
            claimant: existing.pid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::registry::MemberTable;
    use crate::store::StoreConnector;
    use crate::store::memory::MemoryStore;

    struct TestApp {
        record: ServerRecord,
    }

    impl ServerRegistry for TestApp {
        fn server_id(&self) -> String {
            self.record.id.clone()
        }

        fn server_type(&self) -> String {
            self.record.server_type.clone()
        }

        fn current_server(&self) -> ServerRecord {
            self.record.clone()
        }

        fn server_from_config(&self, _id: &str) -> Option<ServerRecord> {
            None
        }

        fn replace_servers(&self, _servers: MemberTable) {}
    }

    async fn registrar_for(
        store: &MemoryStore,
        record: ServerRecord,
    ) -> (Registrar, Arc<dyn StoreClient>) {
        let session = store.connector(&record.id).connect().await.unwrap();
        let client = session.client.clone();
        let registrar = Registrar::new(
            session.client,
            Arc::new(TestApp { record }),
            MembershipConfig::default(),
        );
        (registrar, client)
    }

    #[tokio::test]
    async fn coordinator_creates_persistent_root_idempotently() {
        let store = MemoryStore::new();
        let record = ServerRecord::new("master-1", "master", "10.0.0.1", 3005);
        let (registrar, _client) = registrar_for(&store, record).await;

        registrar.register(NodeRole::Coordinator).await.unwrap();
        assert!(store.has_node("/muster/servers").await);

        // Second call with the root present is still a success.
        registrar.register(NodeRole::Coordinator).await.unwrap();
        assert!(store.has_node("/muster/servers").await);
    }

    #[tokio::test]
    async fn worker_registration_is_idempotent() {
        let store = MemoryStore::new();
        let coordinator = ServerRecord::new("master-1", "master", "10.0.0.1", 3005);
        let (root_registrar, _c) = registrar_for(&store, coordinator).await;
        root_registrar.register(NodeRole::Coordinator).await.unwrap();

        let record = ServerRecord::new("area-1", "area", "10.0.0.2", 3150);
        let (registrar, _client) = registrar_for(&store, record).await;

        registrar.register(NodeRole::Worker).await.unwrap();
        registrar.register(NodeRole::Worker).await.unwrap();

        let payload = store.data_of("/muster/servers/area-1").await.unwrap();
        let published: ServerRecord = serde_json::from_slice(&payload).unwrap();
        assert_eq!(published.id, "area-1");
        assert_eq!(published.pid, Some(std::process::id()));
    }

    #[tokio::test]
    async fn foreign_claimant_is_a_conflict() {
        let store = MemoryStore::new();
        let coordinator = ServerRecord::new("master-1", "master", "10.0.0.1", 3005);
        let (root_registrar, client) = registrar_for(&store, coordinator).await;
        root_registrar.register(NodeRole::Coordinator).await.unwrap();

        // Another process already claims the id with a different pid.
        let mut foreign = ServerRecord::new("area-1", "area", "10.9.9.9", 4000);
        foreign.pid = Some(1);
        client
            .create(
                "/muster/servers/area-1",
                Bytes::from(serde_json::to_vec(&foreign).unwrap()),
                CreateMode::Ephemeral,
            )
            .await
            .unwrap();

        let record = ServerRecord::new("area-1", "area", "10.0.0.2", 3150);
        let (registrar, _client) = registrar_for(&store, record).await;

        let err = registrar.register(NodeRole::Worker).await.unwrap_err();
        assert!(matches!(
            err,
            MembershipError::NodeConflict {
                claimant: Some(1),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn worker_without_root_surfaces_create_failure() {
        let store = MemoryStore::new();
        let record = ServerRecord::new("area-1", "area", "10.0.0.2", 3150);
        let (registrar, _client) = registrar_for(&store, record).await;

        let err = registrar.register(NodeRole::Worker).await.unwrap_err();
        assert!(matches!(err, MembershipError::NodeCreate { .. }));
    }
}
