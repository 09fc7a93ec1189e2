//! Session lifecycle against the coordination store.
//!
//! Owns connecting, authenticating, and ACL setup. Every connect builds a
//! fresh client through the connector; the event stream of the new client
//! is handed back to the caller, which is how disconnect detection reaches
//! the reconnection logic.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::auth::{DIGEST_SCHEME, DigestCredential};
use crate::config::MembershipConfig;
use crate::error::MembershipError;
use crate::events;
use crate::store::{
    ANY_VERSION, AclEntry, SessionEvent, SessionEvents, StoreClient, StoreConnector, StoreSession,
};

pub struct SessionManager {
    connector: Arc<dyn StoreConnector>,
    config: MembershipConfig,
    credential: DigestCredential,
    /// Derived once; credentials are immutable for the manager's lifetime.
    acl: Vec<AclEntry>,
    client: Option<Arc<dyn StoreClient>>,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn StoreConnector>, config: MembershipConfig) -> Self {
        let credential = DigestCredential::new(&config.username, &config.password);
        let acl = credential.acl();
        Self {
            connector,
            config,
            credential,
            acl,
            client: None,
        }
    }

    /// Establish a fresh session, returning the event stream that will
    /// later carry the session's disconnect signal.
    ///
    /// Store-level retry happens here: up to `retries` attempts spaced by
    /// `spin_delay`, each waiting for the connected acknowledgment under
    /// `deadline`. A deadline expiry is returned immediately — the caller's
    /// wait is over even though the underlying attempt keeps going.
    pub async fn connect(&mut self, deadline: Duration) -> Result<SessionEvents, MembershipError> {
        let attempts = self.config.retries.max(1);
        let mut last_err = MembershipError::SessionLost;

        for attempt in 1..=attempts {
            match self.try_connect(deadline).await {
                Ok(events) => return Ok(events),
                Err(err @ MembershipError::ConnectTimeout) => return Err(err),
                Err(err) => {
                    warn!(
                        attempt,
                        attempts,
                        error = %err,
                        "store connect attempt failed"
                    );
                    last_err = err;
                    if attempt < attempts {
                        sleep(self.config.spin_delay).await;
                    }
                }
            }
        }
        Err(last_err)
    }

    async fn try_connect(&mut self, deadline: Duration) -> Result<SessionEvents, MembershipError> {
        let StoreSession { client, mut events } = self.connector.connect().await?;

        let acknowledged = timeout(deadline, async {
            while let Some(event) = events.recv().await {
                if event == SessionEvent::Connected {
                    return true;
                }
            }
            false
        })
        .await;

        match acknowledged {
            Err(_) => return Err(MembershipError::ConnectTimeout),
            Ok(false) => return Err(MembershipError::SessionLost),
            Ok(true) => {}
        }

        client
            .add_auth(DIGEST_SCHEME, self.credential.auth_payload())
            .await?;

        if self.config.enforce_acl {
            // Unconditional overwrite, applied once per successful
            // connection. Reported on failure but never fatal.
            match client
                .set_acl(&self.config.base_path, self.acl.clone(), ANY_VERSION)
                .await
            {
                Ok(()) => debug!(path = %self.config.base_path, "ACL applied to registry root"),
                Err(err) => events::acl_set_failed(&self.config.base_path, &err),
            }
        }

        self.client = Some(client);
        Ok(events)
    }

    /// Client of the current session, if one is established.
    pub fn client(&self) -> Option<Arc<dyn StoreClient>> {
        self.client.clone()
    }

    /// Release the session. Safe to call with no session open, and safe to
    /// call twice.
    pub async fn close(&mut self) {
        if let Some(client) = self.client.take() {
            client.close().await;
        }
    }
}
