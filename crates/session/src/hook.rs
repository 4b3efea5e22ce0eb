//! Forced-logout notification

use tracing::debug;

/// Notified once when a refresh failure ends the session.
///
/// Called after the credential has been cleared and every waiting caller has
/// been rejected. Fire-and-forget: implementations must not block.
pub trait SessionHook: Send + Sync {
    fn session_expired(&self, reason: &str);
}

/// Hook that only logs.
pub struct NoopSessionHook;

impl SessionHook for NoopSessionHook {
    fn session_expired(&self, reason: &str) {
        debug!(reason, "session expired");
    }
}
