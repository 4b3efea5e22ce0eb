//! Session layer for authenticated platform API calls
//!
//! Wraps a `Transport` with bearer-token injection and a single-flight
//! credential refresh. When the platform API answers 401, exactly one caller
//! refreshes the access token while every other caller that hits a 401 in the
//! meantime waits in a FIFO queue; all of them then replay their request once
//! with the new token.
//!
//! Request lifecycle:
//! 1. `RefreshCoordinator::request()` attaches `Authorization: Bearer <access>`
//! 2. 2xx → returned as-is; non-401 failures → `Error::Rejected`
//! 3. 401 from the protected API → join (or lead) the in-flight refresh
//! 4. Refresh succeeds → replay once with the new token, never refresh again
//! 5. Refresh fails or times out → credential cleared, `SessionHook` fired,
//!    every waiting caller gets `Error::SessionExpired`

pub mod coordinator;
pub mod error;
pub mod hook;
pub mod policy;

pub use coordinator::{CoordinatorConfig, RefreshCoordinator};
pub use error::{Error, Result};
pub use hook::{NoopSessionHook, SessionHook};
pub use policy::EndpointPolicy;
