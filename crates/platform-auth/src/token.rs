//! Login and token refresh against the platform API
//!
//! Handles the two unauthenticated auth endpoint interactions:
//! 1. Email/password login (session start)
//! 2. Access token refresh (called by the session coordinator on a 401)
//!
//! The platform API wraps payloads in a `{"data": ...}` envelope on some
//! deployments and returns them bare on others; both are accepted.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::constants::{LOGIN_FAILED_MESSAGE, LOGIN_PATH, REFRESH_PATH};
use crate::credentials::Credential;
use crate::error::{Error, Result};
use crate::secret::Secret;
use crate::types::{AdminProfile, LoginRequest};

/// Payload either wrapped in `data` or bare.
#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope<T> {
    Wrapped { data: T },
    Bare(T),
}

impl<T> Envelope<T> {
    fn into_inner(self) -> T {
        match self {
            Envelope::Wrapped { data } => data,
            Envelope::Bare(inner) => inner,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default, alias = "manager")]
    admin: Option<AdminProfile>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Result of a successful login.
#[derive(Debug, Clone)]
pub struct LoginSession {
    pub credential: Credential,
    /// Account behind the session (`admin` or `manager` in the payload)
    pub profile: Option<AdminProfile>,
}

/// Result of a successful refresh.
///
/// `refresh_token` is set only when the server rotated it; otherwise the
/// caller keeps the refresh token it already holds.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: Secret,
    pub refresh_token: Option<Secret>,
}

/// Exchanges a refresh token for a new access token.
///
/// Any failure means the session cannot be recovered; implementations must
/// not retry internally.
pub trait RefreshClient: Send + Sync {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<RefreshedToken>> + Send + 'a>>;
}

/// HTTP client for the platform auth endpoints.
#[derive(Debug, Clone)]
pub struct PlatformAuthClient {
    client: reqwest::Client,
    base_url: String,
}

impl PlatformAuthClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn login_url(&self) -> String {
        format!("{}{LOGIN_PATH}", self.base_url)
    }

    pub fn refresh_url(&self) -> String {
        format!("{}{REFRESH_PATH}", self.base_url)
    }

    /// Validate the form and exchange email/password for a session.
    ///
    /// Rejections surface the server's message when it sends one, otherwise
    /// a generic "Login failed".
    pub async fn login(&self, request: &LoginRequest) -> Result<LoginSession> {
        request.validate()?;

        let response = self
            .client
            .post(self.login_url())
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Http(format!("login request failed: {e}")))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Http(format!("reading login response: {e}")))?;

        if !status.is_success() {
            let message = transport::structured_message(&body)
                .unwrap_or_else(|| LOGIN_FAILED_MESSAGE.to_string());
            warn!(status = status.as_u16(), email = %request.email, "login rejected");
            return Err(Error::LoginFailed(message));
        }

        let payload = serde_json::from_slice::<Envelope<LoginResponse>>(&body)
            .map_err(|e| Error::LoginFailed(format!("invalid login response: {e}")))?
            .into_inner();

        info!(email = %request.email, "login succeeded");
        Ok(LoginSession {
            credential: Credential::new(payload.access_token, payload.refresh_token),
            profile: payload.admin,
        })
    }

    async fn refresh_access_token(&self, refresh_token: &str) -> Result<RefreshedToken> {
        let response = self
            .client
            .post(self.refresh_url())
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));

            // Body stays in the log; callers only see the status
            warn!(
                status = status.as_u16(),
                body = %body,
                "refresh endpoint rejected request"
            );

            // 401/403 means the refresh token is revoked or expired
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(Error::InvalidCredentials(format!(
                    "refresh token rejected ({status})"
                )));
            }

            return Err(Error::TokenRefresh(format!("refresh endpoint returned {status}")));
        }

        let payload = response
            .json::<Envelope<RefreshResponse>>()
            .await
            .map_err(|e| Error::TokenRefresh(format!("invalid refresh response: {e}")))?
            .into_inner();

        debug!(rotated = payload.refresh_token.is_some(), "access token refreshed");
        Ok(RefreshedToken {
            access_token: Secret::new(payload.access_token),
            refresh_token: payload.refresh_token.map(Secret::new),
        })
    }
}

impl RefreshClient for PlatformAuthClient {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<RefreshedToken>> + Send + 'a>> {
        Box::pin(self.refresh_access_token(refresh_token))
    }
}
