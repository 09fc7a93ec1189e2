//! Structured membership events.
//!
//! One function per event with consistent field naming, so operators can
//! filter on `event_type` regardless of which component emitted the log.

use std::fmt::Display;

use tracing::{error, info, warn};

/// Emit a session connected event.
pub fn session_connected(server_id: &str) {
    info!(
        event_type = "session_connected",
        server_id = %server_id,
        "Store session established"
    );
}

/// Emit a session disconnected event.
pub fn session_disconnected(server_id: &str) {
    warn!(
        event_type = "session_disconnected",
        server_id = %server_id,
        "Store session lost"
    );
}

/// Emit an ACL set failure event. Non-fatal: the session continues.
pub fn acl_set_failed(path: &str, error: &dyn Display) {
    warn!(
        event_type = "acl_set_failed",
        path = %path,
        error = %error,
        "Failed to set ACL on registry root"
    );
}

/// Emit a node registered event.
pub fn node_registered(server_id: &str, path: &str, mode: &str) {
    info!(
        event_type = "node_registered",
        server_id = %server_id,
        path = %path,
        mode = %mode,
        "Membership node registered"
    );
}

/// Emit a member table replaced event.
pub fn member_table_replaced(server_id: &str, member_count: usize) {
    info!(
        event_type = "member_table_replaced",
        server_id = %server_id,
        member_count = member_count,
        "Member table replaced"
    );
}

/// Emit a single member read failure event.
pub fn member_read_failed(server_id: &str, child: &str, error: &dyn Display) {
    error!(
        event_type = "member_read_failed",
        server_id = %server_id,
        child = %child,
        error = %error,
        "Member record read failed"
    );
}

/// Emit a discovery round failed event. The round published nothing.
pub fn discovery_round_failed(server_id: &str, error: &dyn Display) {
    error!(
        event_type = "discovery_round_failed",
        server_id = %server_id,
        error = %error,
        "Discovery round abandoned without table replacement"
    );
}

/// Emit a reconnect attempt event.
pub fn reconnect_attempt(server_id: &str, attempt: u32, budget: u32) {
    info!(
        event_type = "reconnect_attempt",
        server_id = %server_id,
        attempt = attempt,
        budget = budget,
        "Attempting to restore store session"
    );
}

/// Emit the fatal reconnect exhausted event. The process is no longer a
/// cluster participant; the hosting application must react.
pub fn reconnect_exhausted(server_id: &str, attempts: u32) {
    error!(
        event_type = "reconnect_exhausted",
        server_id = %server_id,
        attempts = attempts,
        "Reconnect budget exhausted, membership is down"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_functions_dont_panic() {
        session_connected("area-1");
        session_disconnected("area-1");
        acl_set_failed("/muster/servers", &"no node");
        node_registered("area-1", "/muster/servers/area-1", "ephemeral");
        member_table_replaced("area-1", 3);
        member_read_failed("area-1", "area-2", &"connection loss");
        discovery_round_failed("area-1", &"timed out");
        reconnect_attempt("area-1", 1, 3);
        reconnect_exhausted("area-1", 3);
    }
}
