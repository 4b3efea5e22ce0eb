//! Platform API auth constants
//!
//! Endpoint paths are relative to the configured API base URL. The login and
//! refresh endpoints are unauthenticated by definition and must never be
//! routed back into the refresh flow.

/// Email/password login endpoint
pub const LOGIN_PATH: &str = "/v1/platform/auth/login";

/// Access token refresh endpoint
pub const REFRESH_PATH: &str = "/v1/platform/auth/refresh";

/// API base used when neither config nor environment supplies one
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";

/// Message surfaced when a login rejection carries no structured message
pub const LOGIN_FAILED_MESSAGE: &str = "Login failed";
