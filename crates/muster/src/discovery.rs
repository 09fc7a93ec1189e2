//! Watch-driven discovery of the member set.
//!
//! The engine runs a continuous re-arm loop: every round reads the
//! registry's child list (arming exactly one single-shot watch for the next
//! change as part of the read), fans out concurrent reads for members not
//! known from static configuration, and replaces the hosting application's
//! member table only when every read of the round succeeded. A failed or
//! timed-out round publishes nothing; the table is never patched with a
//! partial batch.

use std::sync::Arc;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::MembershipConfig;
use crate::error::MembershipError;
use crate::events;
use crate::registry::{MemberTable, ServerRecord, ServerRegistry};
use crate::store::{StoreClient, StoreError};

pub struct DiscoveryEngine {
    client: Arc<dyn StoreClient>,
    registry: Arc<dyn ServerRegistry>,
    config: MembershipConfig,
}

impl DiscoveryEngine {
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

    /// Spawn the re-arming watch loop. The task runs until `cancel` fires
    /// or the watch can no longer be re-armed (session loss); the
    /// reconnection path arms a fresh engine afterwards.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    async fn run(self, cancel: CancellationToken) {
        loop {
            // Re-subscription happens with the read itself, so a change
            // landing between rounds still produces a notification.
            let (children, watch) = tokio::select! {
                _ = cancel.cancelled() => return,
                listed = self.client.children_and_watch(&self.config.base_path) => {
                    match listed {
                        Ok(listed) => listed,
                        Err(err) => {
                            warn!(
                                path = %self.config.base_path,
                                error = %err,
                                "child listing failed, watch not re-armed"
                            );
                            return;
                        }
                    }
                }
            };

            if let Err(err) = self.round(children).await {
                events::discovery_round_failed(&self.registry.server_id(), &err);
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                fired = watch => {
                    if fired.is_err() {
                        // Sender dropped without firing: the session that
                        // armed the watch is gone.
                        debug!("child watch lost");
                        return;
                    }
                }
            }
        }
    }

    /// One discovery round over a delivered child list: fan out the reads,
    /// wait on the fan-in barrier, publish all-or-nothing.
    async fn round(&self, children: Vec<String>) -> Result<(), MembershipError> {
        if children.is_empty() {
            return Err(MembershipError::EmptyRegistry {
                path: self.config.base_path.clone(),
            });
        }

        let mut table = MemberTable::new();
        let mut names = Vec::new();
        let mut reads: Vec<JoinHandle<Result<ServerRecord, MembershipError>>> = Vec::new();

        for child in children {
            // Statically configured peers come from the hosting application,
            // not from the store.
            if let Some(record) = self.registry.server_from_config(&child) {
                table.insert(record.id.clone(), record);
                continue;
            }

            let client = Arc::clone(&self.client);
            let path = self.config.node_path(&child);
            names.push(child.clone());
            reads.push(tokio::spawn(async move {
                let payload =
                    client
                        .get_data(&path)
                        .await
                        .map_err(|source| MembershipError::Read {
                            child,
                            source,
                        })?;
                let record: ServerRecord = serde_json::from_slice(&payload)?;
                Ok(record)
            }));
        }

        // Fan-in barrier with an accumulation timeout. The reads are
        // independent tasks, so hitting the timeout abandons only the
        // aggregation; in-flight reads complete on their own and are
        // discarded.
        let results = match timeout(self.config.discovery_timeout, join_all(reads)).await {
            Ok(results) => results,
            Err(_) => {
                return Err(MembershipError::DiscoveryTimeout {
                    timeout: self.config.discovery_timeout,
                });
            }
        };

        let server_id = self.registry.server_id();
        let mut first_err = None;
        for (child, joined) in names.into_iter().zip(results) {
            match joined {
                Ok(Ok(record)) => {
                    table.insert(record.id.clone(), record);
                }
                Ok(Err(err)) => {
                    // One failed read fails the whole round, but the rest
                    // were still drained above so nothing partial leaks out.
                    events::member_read_failed(&server_id, &child, &err);
                    first_err.get_or_insert(err);
                }
                Err(join_err) => {
                    events::member_read_failed(&server_id, &child, &join_err);
                    first_err.get_or_insert(MembershipError::Read {
                        child,
                        source: StoreError::ConnectionLoss,
                    });
                }
            }
        }
        if let Some(err) = first_err {
            return Err(err);
        }

        events::member_table_replaced(&server_id, table.len());
        self.registry.replace_servers(table);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::time::sleep;

    use crate::store::CreateMode;
    use crate::store::StoreConnector;
    use crate::store::memory::MemoryStore;

    #[derive(Default)]
    struct TestApp {
        config_peers: HashMap<String, ServerRecord>,
        published: Mutex<Vec<MemberTable>>,
    }

    impl TestApp {
        fn publishes(&self) -> usize {
            self.published.lock().unwrap().len()
        }

        fn latest(&self) -> Option<MemberTable> {
            self.published.lock().unwrap().last().cloned()
        }
    }

    impl ServerRegistry for TestApp {
        fn server_id(&self) -> String {
            "observer".to_string()
        }

        fn server_type(&self) -> String {
            "area".to_string()
        }

        fn current_server(&self) -> ServerRecord {
            ServerRecord::new("observer", "area", "10.0.0.9", 3150)
        }

        fn server_from_config(&self, id: &str) -> Option<ServerRecord> {
            self.config_peers.get(id).cloned()
        }

        fn replace_servers(&self, servers: MemberTable) {
            self.published.lock().unwrap().push(servers);
        }
    }

    async fn seeded_store() -> (MemoryStore, Arc<dyn StoreClient>) {
        let store = MemoryStore::new();
        let session = store.connector("seed").connect().await.unwrap();
        session
            .client
            .create("/muster", Bytes::new(), CreateMode::Persistent)
            .await
            .unwrap();
        session
            .client
            .create("/muster/servers", Bytes::new(), CreateMode::Persistent)
            .await
            .unwrap();
        let client = session.client.clone();
        (store, client)
    }

    async fn publish_member(client: &Arc<dyn StoreClient>, record: &ServerRecord) {
        client
            .create(
                &format!("/muster/servers/{}", record.id),
                Bytes::from(serde_json::to_vec(record).unwrap()),
                CreateMode::Ephemeral,
            )
            .await
            .unwrap();
    }

    fn engine(client: Arc<dyn StoreClient>, app: Arc<TestApp>) -> DiscoveryEngine {
        DiscoveryEngine::new(client, app, MembershipConfig::default())
    }

    #[tokio::test]
    async fn round_publishes_exactly_the_delivered_children() {
        let (_store, client) = seeded_store().await;
        let mut a = ServerRecord::new("a", "area", "10.0.0.1", 3150);
        a.pid = Some(11);
        let mut b = ServerRecord::new("b", "area", "10.0.0.2", 3150);
        b.pid = Some(12);
        publish_member(&client, &a).await;
        publish_member(&client, &b).await;

        let app = Arc::new(TestApp::default());
        let engine = engine(client, Arc::clone(&app));

        engine
            .round(vec!["a".to_string(), "b".to_string()])
            .await
            .unwrap();

        let table = app.latest().unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table["a"], a);
        assert_eq!(table["b"], b);
    }

    #[tokio::test]
    async fn statically_configured_peers_are_not_read_from_the_store() {
        let (store, client) = seeded_store().await;
        let known = ServerRecord::new("known", "area", "10.0.0.3", 3150);
        // No node for "known" exists in the store, and even its path is
        // poisoned; the record must come from configuration.
        store.fail_reads_of("/muster/servers/known").await;

        let app = Arc::new(TestApp {
            config_peers: HashMap::from([("known".to_string(), known.clone())]),
            ..TestApp::default()
        });
        let engine = engine(client, Arc::clone(&app));

        engine.round(vec!["known".to_string()]).await.unwrap();

        let table = app.latest().unwrap();
        assert_eq!(table["known"], known);
    }

    #[tokio::test]
    async fn empty_child_list_abandons_the_round() {
        let (_store, client) = seeded_store().await;
        let app = Arc::new(TestApp::default());
        let engine = engine(client, Arc::clone(&app));

        let err = engine.round(Vec::new()).await.unwrap_err();
        assert!(matches!(err, MembershipError::EmptyRegistry { .. }));
        assert_eq!(app.publishes(), 0);
    }

    #[tokio::test]
    async fn one_failed_read_fails_the_round_without_partial_publish() {
        let (store, client) = seeded_store().await;
        let a = ServerRecord::new("a", "area", "10.0.0.1", 3150);
        let b = ServerRecord::new("b", "area", "10.0.0.2", 3150);
        publish_member(&client, &a).await;
        publish_member(&client, &b).await;
        store.fail_reads_of("/muster/servers/b").await;

        let app = Arc::new(TestApp::default());
        let engine = engine(client, Arc::clone(&app));

        let err = engine
            .round(vec!["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, MembershipError::Read { ref child, .. } if child == "b"));
        assert_eq!(app.publishes(), 0);
    }

    #[tokio::test]
    async fn timed_out_barrier_publishes_nothing() {
        let (store, client) = seeded_store().await;
        let a = ServerRecord::new("a", "area", "10.0.0.1", 3150);
        let b = ServerRecord::new("b", "area", "10.0.0.2", 3150);
        publish_member(&client, &a).await;
        publish_member(&client, &b).await;
        store
            .delay_reads_of("/muster/servers/b", Duration::from_secs(30))
            .await;

        let app = Arc::new(TestApp::default());
        let engine = DiscoveryEngine::new(
            client,
            app.clone(),
            MembershipConfig {
                discovery_timeout: Duration::from_millis(50),
                ..MembershipConfig::default()
            },
        );

        let err = engine
            .round(vec!["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, MembershipError::DiscoveryTimeout { .. }));
        assert_eq!(app.publishes(), 0);
    }

    #[tokio::test]
    async fn watch_loop_re_arms_after_every_change() {
        let (_store, client) = seeded_store().await;
        let app = Arc::new(TestApp::default());
        let cancel = CancellationToken::new();

        let engine = engine(Arc::clone(&client), Arc::clone(&app));
        let task = engine.spawn(cancel.clone());

        let a = ServerRecord::new("a", "area", "10.0.0.1", 3150);
        publish_member(&client, &a).await;
        wait_for(|| app.latest().is_some_and(|t| t.len() == 1)).await;

        // A second change must fire the re-armed watch.
        let b = ServerRecord::new("b", "area", "10.0.0.2", 3150);
        publish_member(&client, &b).await;
        wait_for(|| app.latest().is_some_and(|t| t.len() == 2)).await;

        cancel.cancel();
        task.await.unwrap();
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }
}
