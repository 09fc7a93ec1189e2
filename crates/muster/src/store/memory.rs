//! In-memory coordination store for local development and tests.
//!
//! A [`MemoryStore`] is a handle to a shared ensemble; clones see the same
//! node tree, so one test can host several "processes" by handing each its
//! own named connector. Sessions own their ephemeral nodes, child watches
//! are single-shot, and a handful of fault-injection hooks cover the
//! failure paths the membership layer has to survive.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, mpsc, oneshot};
use uuid::Uuid;

use super::{
    AclEntry, ChildWatch, CreateMode, SessionEvent, StoreClient, StoreConnector, StoreError,
    StoreSession, parent_of,
};

struct NodeEntry {
    data: Bytes,
    /// Session id for ephemeral nodes; `None` marks a persistent node.
    owner: Option<String>,
}

/// A live session. Death, deliberate or not, removes the entry (dropping
/// the event sender and ending the session's stream).
struct SessionEntry {
    connector: String,
    events: mpsc::UnboundedSender<SessionEvent>,
}

#[derive(Default)]
struct EnsembleState {
    nodes: HashMap<String, NodeEntry>,
    child_watches: HashMap<String, Vec<oneshot::Sender<()>>>,
    sessions: HashMap<String, SessionEntry>,
    /// Remaining connect attempts to fail, per connector name.
    connect_failures: HashMap<String, u32>,
    /// Paths whose reads fail with `ConnectionLoss`.
    failing_reads: HashSet<String>,
    /// Paths whose reads complete only after a delay.
    read_delays: HashMap<String, Duration>,
    acl_sets: Vec<(String, Vec<AclEntry>)>,
    auth_entries: Vec<(String, Bytes)>,
}

/// Handle to a shared in-memory ensemble.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<EnsembleState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector whose sessions are attributed to `name`. Fault-injection
    /// and [`MemoryStore::disconnect`] key on that attribution.
    pub fn connector(&self, name: &str) -> MemoryConnector {
        MemoryConnector {
            store: self.clone(),
            name: name.to_string(),
            connect_delay: None,
        }
    }

    pub async fn has_node(&self, path: &str) -> bool {
        self.state.lock().await.nodes.contains_key(path)
    }

    pub async fn data_of(&self, path: &str) -> Option<Bytes> {
        self.state
            .lock()
            .await
            .nodes
            .get(path)
            .map(|node| node.data.clone())
    }

    /// Armed child watches under `path` that are still capable of firing.
    pub async fn watch_count(&self, path: &str) -> usize {
        self.state
            .lock()
            .await
            .child_watches
            .get(path)
            .map(|watches| watches.iter().filter(|w| !w.is_closed()).count())
            .unwrap_or(0)
    }

    /// Fail the next `n` connect attempts made through connector `name`.
    pub async fn fail_connects(&self, name: &str, n: u32) {
        self.state
            .lock()
            .await
            .connect_failures
            .insert(name.to_string(), n);
    }

    /// Reads of `path` fail with `ConnectionLoss` until cleared.
    pub async fn fail_reads_of(&self, path: &str) {
        self.state
            .lock()
            .await
            .failing_reads
            .insert(path.to_string());
    }

    pub async fn clear_read_failures(&self) {
        self.state.lock().await.failing_reads.clear();
    }

    /// Reads of `path` complete only after `delay`.
    pub async fn delay_reads_of(&self, path: &str, delay: Duration) {
        self.state
            .lock()
            .await
            .read_delays
            .insert(path.to_string(), delay);
    }

    /// ACL applications recorded for `path`.
    pub async fn acl_sets_for(&self, path: &str) -> usize {
        self.state
            .lock()
            .await
            .acl_sets
            .iter()
            .filter(|(p, _)| p == path)
            .count()
    }

    /// Credentials supplied across all sessions.
    pub async fn auth_entries(&self) -> usize {
        self.state.lock().await.auth_entries.len()
    }

    /// Kill every live session attributed to connector `name`: their
    /// ephemeral nodes vanish, watchers of the affected parents fire, and
    /// each session receives [`SessionEvent::Disconnected`].
    pub async fn disconnect(&self, name: &str) {
        let mut state = self.state.lock().await;
        let doomed: Vec<String> = state
            .sessions
            .iter()
            .filter(|(_, s)| s.connector == name)
            .map(|(id, _)| id.clone())
            .collect();

        for session_id in doomed {
            if let Some(session) = state.sessions.remove(&session_id) {
                let _ = session.events.send(SessionEvent::Disconnected);
            }
            expire_ephemerals(&mut state, &session_id);
        }
    }
}

/// Remove every ephemeral node owned by `session_id`, firing the watches of
/// each affected parent.
fn expire_ephemerals(state: &mut EnsembleState, session_id: &str) {
    let expired: Vec<String> = state
        .nodes
        .iter()
        .filter(|(_, node)| node.owner.as_deref() == Some(session_id))
        .map(|(path, _)| path.clone())
        .collect();

    for path in expired {
        state.nodes.remove(&path);
        if let Some(parent) = parent_of(&path) {
            fire_child_watches(state, parent);
        }
    }
}

fn fire_child_watches(state: &mut EnsembleState, parent: &str) {
    if let Some(watches) = state.child_watches.remove(parent) {
        for watch in watches {
            let _ = watch.send(());
        }
    }
}

fn validate_path(path: &str) -> Result<(), StoreError> {
    let malformed = !path.starts_with('/')
        || path.len() < 2
        || path.ends_with('/')
        || path.contains("//");
    if malformed {
        return Err(StoreError::BadPath {
            path: path.to_string(),
        });
    }
    Ok(())
}

/// Factory for sessions against one [`MemoryStore`].
pub struct MemoryConnector {
    store: MemoryStore,
    name: String,
    connect_delay: Option<Duration>,
}

impl MemoryConnector {
    /// Delay delivery of the connected signal; the session itself is
    /// returned immediately, as a real client would keep trying in the
    /// background.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn connect(&self) -> Result<StoreSession, StoreError> {
        let mut state = self.store.state.lock().await;
        if let Some(remaining) = state.connect_failures.get_mut(&self.name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::Unavailable);
            }
        }

        let session_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        state.sessions.insert(
            session_id.clone(),
            SessionEntry {
                connector: self.name.clone(),
                events: tx.clone(),
            },
        );
        drop(state);

        match self.connect_delay {
            Some(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(SessionEvent::Connected);
                });
            }
            None => {
                let _ = tx.send(SessionEvent::Connected);
            }
        }

        Ok(StoreSession {
            client: Arc::new(MemoryClient {
                store: self.store.clone(),
                session_id,
            }),
            events: rx,
        })
    }
}

struct MemoryClient {
    store: MemoryStore,
    session_id: String,
}

impl MemoryClient {
    fn ensure_alive(&self, state: &EnsembleState) -> Result<(), StoreError> {
        if state.sessions.contains_key(&self.session_id) {
            Ok(())
        } else {
            Err(StoreError::ConnectionLoss)
        }
    }

    /// Honor a configured read delay without holding the ensemble lock.
    async fn apply_read_delay(&self, path: &str) {
        let delay = self
            .store
            .state
            .lock()
            .await
            .read_delays
            .get(path)
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn children_of(state: &EnsembleState, path: &str) -> Vec<String> {
        let prefix = format!("{path}/");
        let mut children: Vec<String> = state
            .nodes
            .keys()
            .filter_map(|p| p.strip_prefix(prefix.as_str()))
            .filter(|rest| !rest.contains('/'))
            .map(String::from)
            .collect();
        children.sort();
        children
    }
}

#[async_trait]
impl StoreClient for MemoryClient {
    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        let state = self.store.state.lock().await;
        self.ensure_alive(&state)?;
        Ok(state.nodes.contains_key(path))
    }

    async fn create(
        &self,
        path: &str,
        payload: Bytes,
        mode: CreateMode,
    ) -> Result<(), StoreError> {
        validate_path(path)?;
        let mut state = self.store.state.lock().await;
        self.ensure_alive(&state)?;

        if state.nodes.contains_key(path) {
            return Err(StoreError::NodeExists {
                path: path.to_string(),
            });
        }
        if let Some(parent) = parent_of(path) {
            if !state.nodes.contains_key(parent) {
                return Err(StoreError::NoNode {
                    path: parent.to_string(),
                });
            }
        }

        let owner = match mode {
            CreateMode::Ephemeral => Some(self.session_id.clone()),
            CreateMode::Persistent => None,
        };
        state.nodes.insert(path.to_string(), NodeEntry { data: payload, owner });
        if let Some(parent) = parent_of(path) {
            fire_child_watches(&mut state, parent);
        }
        Ok(())
    }

    async fn get_data(&self, path: &str) -> Result<Bytes, StoreError> {
        self.apply_read_delay(path).await;
        let state = self.store.state.lock().await;
        self.ensure_alive(&state)?;
        if state.failing_reads.contains(path) {
            return Err(StoreError::ConnectionLoss);
        }
        state
            .nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| StoreError::NoNode {
                path: path.to_string(),
            })
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let state = self.store.state.lock().await;
        self.ensure_alive(&state)?;
        if !state.nodes.contains_key(path) {
            return Err(StoreError::NoNode {
                path: path.to_string(),
            });
        }
        Ok(Self::children_of(&state, path))
    }

    async fn children_and_watch(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, ChildWatch), StoreError> {
        let mut state = self.store.state.lock().await;
        self.ensure_alive(&state)?;
        if !state.nodes.contains_key(path) {
            return Err(StoreError::NoNode {
                path: path.to_string(),
            });
        }
        let children = Self::children_of(&state, path);
        let (tx, rx) = oneshot::channel();
        state
            .child_watches
            .entry(path.to_string())
            .or_default()
            .push(tx);
        Ok((children, rx))
    }

    async fn add_auth(&self, scheme: &str, credential: Bytes) -> Result<(), StoreError> {
        let mut state = self.store.state.lock().await;
        self.ensure_alive(&state)?;
        state.auth_entries.push((scheme.to_string(), credential));
        Ok(())
    }

    async fn set_acl(
        &self,
        path: &str,
        acl: Vec<AclEntry>,
        _version: i32,
    ) -> Result<(), StoreError> {
        let mut state = self.store.state.lock().await;
        self.ensure_alive(&state)?;
        if !state.nodes.contains_key(path) {
            return Err(StoreError::NoNode {
                path: path.to_string(),
            });
        }
        state.acl_sets.push((path.to_string(), acl));
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.store.state.lock().await;
        // A deliberate close releases ephemerals but is not a disconnect.
        if state.sessions.remove(&self.session_id).is_some() {
            expire_ephemerals(&mut state, &self.session_id);
        }
    }
}
