//! Session endpoints
//!
//! - GET  /session         whether a credential is held, plus the cached profile
//! - POST /session/login   email/password login against the platform API
//! - POST /session/logout  forget the credential and profile
//!
//! Login calls `PlatformAuthClient` directly and never enters the refresh
//! flow. The resulting credential, and its removal on logout, go through the
//! coordinator so an in-flight refresh cannot overwrite them.

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use platform_auth::{Error as AuthError, LoginRequest};
use tracing::{info, warn};

use crate::metrics;
use crate::proxy::error_response;
use crate::{AppState, new_request_id};

/// GET /session
pub async fn session_status(State(state): State<AppState>) -> impl IntoResponse {
    let authenticated = state.coordinator.token_store().get().await.is_some();
    let admin = if authenticated { state.profile.get() } else { None };

    Json(serde_json::json!({
        "authenticated": authenticated,
        "admin": admin,
    }))
}

/// POST /session/login
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Response {
    let request_id = new_request_id();
    let Json(form) = match payload {
        Ok(form) => form,
        Err(rejection) => {
            return error_response(
                StatusCode::UNPROCESSABLE_ENTITY,
                "validation_error",
                &rejection.body_text(),
                &request_id,
            );
        }
    };

    let login = match state.auth.login(&form).await {
        Ok(login) => login,
        Err(e) => {
            let (status, error_type, outcome) = match &e {
                AuthError::Validation(_) => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "validation_error", "invalid")
                }
                AuthError::LoginFailed(_) => (StatusCode::UNAUTHORIZED, "login_failed", "rejected"),
                _ => (StatusCode::BAD_GATEWAY, "upstream_error", "error"),
            };
            metrics::record_login(outcome);
            return error_response(status, error_type, &e.to_string(), &request_id);
        }
    };

    if let Err(e) = state.coordinator.sign_in(login.credential).await {
        warn!(error = %e, "failed to persist session credential");
    }
    state.profile.set(login.profile.clone());
    metrics::record_login("success");
    info!(email = %form.email, "admin signed in");

    Json(serde_json::json!({ "admin": login.profile })).into_response()
}

/// POST /session/logout
pub async fn logout(State(state): State<AppState>) -> Response {
    if let Err(e) = state.coordinator.sign_out().await {
        warn!(error = %e, "failed to clear session credential");
    }
    state.profile.clear();
    info!("admin signed out");
    StatusCode::NO_CONTENT.into_response()
}
