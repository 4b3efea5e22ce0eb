//! Cached profile of the signed-in admin

use std::sync::{PoisonError, RwLock};

use platform_auth::AdminProfile;
use session::SessionHook;
use tracing::info;

/// Profile returned by the last login. Dropped on logout and when a refresh
/// failure ends the session.
#[derive(Default)]
pub struct ProfileCache {
    profile: RwLock<Option<AdminProfile>>,
}

impl ProfileCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<AdminProfile> {
        self.profile
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set(&self, profile: Option<AdminProfile>) {
        *self.profile.write().unwrap_or_else(PoisonError::into_inner) = profile;
    }

    pub fn clear(&self) {
        self.set(None);
    }
}

impl SessionHook for ProfileCache {
    fn session_expired(&self, reason: &str) {
        let email = self.get().map(|p| p.email);
        self.clear();
        info!(email = ?email, reason, "session ended by refresh failure, sign in again");
    }
}
