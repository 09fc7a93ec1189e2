//! Membership configuration with environment variable overrides.

use std::time::Duration;

/// Configuration for the membership layer. Immutable after construction;
/// every field has a documented default.
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    /// Coordination-store host list (env: STORE_HOSTS, comma-separated).
    pub hosts: Vec<String>,

    /// Registry root path under which members publish (env: REGISTRY_PATH).
    pub base_path: String,

    /// Credential username (env: STORE_USERNAME).
    pub username: String,

    /// Credential password (env: STORE_PASSWORD).
    pub password: String,

    /// Store session timeout.
    pub session_timeout: Duration,

    /// Store-level connect attempts within one `connect()` call. Distinct
    /// from the application-level reconnect budget.
    pub retries: u32,

    /// Fixed delay between store-level connect attempts.
    pub spin_delay: Duration,

    /// Application-level reconnect attempt budget (env: RECONNECT_ATTEMPTS).
    pub reconnect_attempts: u32,

    /// Linear backoff unit for the reconnection loop; attempt `n` sleeps
    /// `n * unit` after a failure.
    pub reconnect_backoff_unit: Duration,

    /// Apply the digest ACL to the registry root after each successful
    /// connection.
    pub enforce_acl: bool,

    /// How long one `connect()` call waits for the store's connected
    /// signal before giving up.
    pub connect_deadline: Duration,

    /// Accumulation timeout for one discovery round's fan-in barrier.
    pub discovery_timeout: Duration,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["127.0.0.1:2181".to_string()],
            base_path: "/muster/servers".to_string(),
            username: "muster".to_string(),
            password: "muster".to_string(),
            session_timeout: Duration::from_secs(15),
            retries: 3,
            spin_delay: Duration::from_secs(1),
            reconnect_attempts: 3,
            reconnect_backoff_unit: Duration::from_secs(5),
            enforce_acl: false,
            connect_deadline: Duration::from_secs(15),
            discovery_timeout: Duration::from_secs(60),
        }
    }
}

impl MembershipConfig {
    /// Create configuration from environment variables with defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(hosts) = std::env::var("STORE_HOSTS") {
            config.hosts = hosts.split(',').map(String::from).collect();
        }

        if let Ok(path) = std::env::var("REGISTRY_PATH") {
            config.base_path = path;
        }

        if let Ok(username) = std::env::var("STORE_USERNAME") {
            config.username = username;
        }

        if let Ok(password) = std::env::var("STORE_PASSWORD") {
            config.password = password;
        }

        if let Ok(attempts) = std::env::var("RECONNECT_ATTEMPTS") {
            if let Ok(parsed) = attempts.parse::<u32>() {
                config.reconnect_attempts = parsed;
            }
        }

        config
    }

    /// Path of the member node for `server_id`.
    pub fn node_path(&self, server_id: &str) -> String {
        format!("{}/{}", self.base_path, server_id)
    }
}
