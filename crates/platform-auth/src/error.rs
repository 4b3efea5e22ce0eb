//! Error types for platform authentication operations

/// Errors from login, refresh and credential storage.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("{0}")]
    LoginFailed(String),

    #[error("{0}")]
    Validation(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("token refresh failed: {0}")]
    TokenRefresh(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
