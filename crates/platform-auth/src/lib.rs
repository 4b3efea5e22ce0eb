//! Platform admin authentication library
//!
//! Provides the credential model, token stores, and the login/refresh calls
//! against the platform API. This crate knows nothing about request replay;
//! the `session` crate coordinates refreshes on top of the traits defined
//! here.
//!
//! Credential flow:
//! 1. Gateway validates the login form via `LoginRequest::validate()`
//! 2. `PlatformAuthClient::login()` exchanges email/password for tokens
//! 3. Credential stored via `TokenStore::set()`
//! 4. On an expired access token the coordinator calls `RefreshClient::refresh()`
//! 5. Refreshed tokens replace the stored credential; failure clears it

pub mod constants;
pub mod credentials;
pub mod error;
pub mod secret;
pub mod token;
pub mod types;

pub use constants::*;
pub use credentials::{Credential, FileTokenStore, MemoryTokenStore, TokenStore};
pub use error::{Error, Result};
pub use secret::Secret;
pub use token::{LoginSession, PlatformAuthClient, RefreshClient, RefreshedToken};
pub use types::{AdminProfile, AdminRole, AdminStatus, LoginRequest};
