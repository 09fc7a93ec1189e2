//! The membership component.
//!
//! Owns the session, keeps this process registered, and keeps discovery
//! armed across reconnects. The startup sequence is connect → register →
//! arm discovery; after that `run` sits in a select loop over the session's
//! event stream and the shutdown token. A disconnect tears discovery down
//! and enters the bounded reconnection loop; running that loop inline is
//! what guarantees a second disconnect can never start a concurrent one.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MembershipConfig;
use crate::discovery::DiscoveryEngine;
use crate::error::MembershipError;
use crate::events;
use crate::registrar::Registrar;
use crate::registry::{NodeRole, ServerRegistry};
use crate::session::SessionManager;
use crate::store::{SessionEvent, SessionEvents, StoreClient, StoreConnector};

pub struct Membership {
    session: SessionManager,
    registry: Arc<dyn ServerRegistry>,
    config: MembershipConfig,
    discovery_cancel: Option<CancellationToken>,
    discovery_task: Option<JoinHandle<()>>,
}

impl Membership {
    pub fn new(
        connector: Arc<dyn StoreConnector>,
        registry: Arc<dyn ServerRegistry>,
        config: MembershipConfig,
    ) -> Self {
        Self {
            session: SessionManager::new(connector, config.clone()),
            registry,
            config,
            discovery_cancel: None,
            discovery_task: None,
        }
    }

    /// Run the membership protocol until `shutdown` is cancelled or the
    /// reconnect budget is exhausted. The `Err` on exhaustion is the fatal
    /// escalation: the process is no longer a cluster participant and the
    /// hosting application has to react.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), MembershipError> {
        let mut session_events = self.start_session().await?;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.stop().await;
                    return Ok(());
                }
                event = session_events.recv() => match event {
                    Some(SessionEvent::Disconnected) | None => {
                        // A dying event stream without a signal is
                        // indistinguishable from a disconnect.
                        events::session_disconnected(&self.registry.server_id());
                        self.disarm_discovery();
                        session_events = self.reconnect().await?;
                    }
                    Some(SessionEvent::Connected) => {
                        debug!("ignoring connected signal outside a connect call");
                    }
                },
            }
        }
    }

    /// Connect, register, and arm a fresh discovery engine — the startup
    /// sequence, also replayed after every successful reconnect.
    async fn start_session(&mut self) -> Result<SessionEvents, MembershipError> {
        let session_events = self.session.connect(self.config.connect_deadline).await?;
        events::session_connected(&self.registry.server_id());

        let client = self
            .session
            .client()
            .ok_or(MembershipError::SessionLost)?;

        let role = NodeRole::from_server_type(&self.registry.server_type());
        Registrar::new(
            Arc::clone(&client),
            Arc::clone(&self.registry),
            self.config.clone(),
        )
        .register(role)
        .await?;

        self.arm_discovery(client);
        Ok(session_events)
    }

    /// Application-level reconnection loop: bounded attempts with linear
    /// backoff. Runs to success or exhaustion without external
    /// cancellation.
    async fn reconnect(&mut self) -> Result<SessionEvents, MembershipError> {
        let budget = self.config.reconnect_attempts;

        for attempt in 1..=budget {
            events::reconnect_attempt(&self.registry.server_id(), attempt, budget);
            match self.start_session().await {
                Ok(session_events) => return Ok(session_events),
                Err(err) => {
                    warn!(attempt, budget, error = %err, "reconnect attempt failed");
                    if attempt < budget {
                        sleep(self.config.reconnect_backoff_unit * attempt).await;
                    }
                }
            }
        }

        self.session.close().await;
        events::reconnect_exhausted(&self.registry.server_id(), budget);
        Err(MembershipError::ReconnectExhausted { attempts: budget })
    }

    fn arm_discovery(&mut self, client: Arc<dyn StoreClient>) {
        self.disarm_discovery();
        let cancel = CancellationToken::new();
        let engine = DiscoveryEngine::new(
            client,
            Arc::clone(&self.registry),
            self.config.clone(),
        );
        self.discovery_task = Some(engine.spawn(cancel.clone()));
        self.discovery_cancel = Some(cancel);
    }

    /// Tear down the discovery task. In-flight reads of the current round
    /// are separate tasks and are not aborted; they finish against the old
    /// session and are discarded.
    fn disarm_discovery(&mut self) {
        if let Some(cancel) = self.discovery_cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.discovery_task.take() {
            task.abort();
        }
    }

    /// Graceful stop: tear down discovery and release the session.
    async fn stop(&mut self) {
        self.disarm_discovery();
        self.session.close().await;
        info!(server_id = %self.registry.server_id(), "membership stopped");
    }
}
