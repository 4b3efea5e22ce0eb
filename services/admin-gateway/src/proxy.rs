//! Forwarding to the platform API
//!
//! Receives inbound requests, strips hop-by-hop headers and any caller
//! supplied `Authorization`, and sends them through the refresh coordinator,
//! which attaches the session's bearer token. Successful responses are
//! returned verbatim; failures become JSON error responses.

use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use session::{Error as SessionError, RefreshCoordinator};
use std::time::Instant;
use tracing::{debug, error, instrument, warn};
use transport::{ApiRequest, TransportError};

use crate::metrics;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Largest request body accepted for forwarding.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// JSON error response: {"error":{"type":"...","message":"...","request_id":"req_..."}}
pub fn error_response(
    status: StatusCode,
    error_type: &str,
    message: &str,
    request_id: &str,
) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Status and error type for a failed session request.
pub fn classify_error(err: &SessionError) -> (StatusCode, &'static str) {
    match err {
        SessionError::SessionExpired(_) => (StatusCode::UNAUTHORIZED, "session_expired"),
        SessionError::Rejected { status, .. } => (*status, "api_error"),
        SessionError::Transport(TransportError::Timeout(_)) => {
            (StatusCode::GATEWAY_TIMEOUT, "upstream_timeout")
        }
        SessionError::Transport(TransportError::Network(_)) => {
            (StatusCode::BAD_GATEWAY, "upstream_error")
        }
        SessionError::Transport(TransportError::Encode(_)) => {
            (StatusCode::BAD_REQUEST, "invalid_request")
        }
        SessionError::TooManyPending(_) => (StatusCode::SERVICE_UNAVAILABLE, "overloaded"),
        SessionError::RefreshAbandoned => (StatusCode::SERVICE_UNAVAILABLE, "refresh_abandoned"),
    }
}

/// Forward an inbound request to `{api_base}{path}?{query}`.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn forward(
    coordinator: &RefreshCoordinator,
    api_base: &str,
    request: axum::http::Request<axum::body::Body>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    let method = request.method().clone();

    let url = match request.uri().path_and_query() {
        Some(pq) => format!("{api_base}{pq}"),
        None => api_base.to_string(),
    };
    let headers = forwarded_headers(request.headers());

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "failed to read request body");
            metrics::record_request(400, method.as_str(), started.elapsed().as_secs_f64());
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("invalid request body: {e}"),
                &request_id,
            );
        }
    };

    let mut api_request = ApiRequest::new(method.clone(), url);
    api_request.headers = headers;
    if !body.is_empty() {
        api_request.body = Some(body);
    }

    let response = match coordinator.request(api_request).await {
        Ok(api_response) => {
            debug!(status = api_response.status.as_u16(), "forwarded");
            let mut response = Response::builder().status(api_response.status);
            for (name, value) in &api_response.headers {
                if !is_hop_by_hop(name.as_str()) && name != header::CONTENT_LENGTH {
                    response = response.header(name, value);
                }
            }
            response
                .body(axum::body::Body::from(api_response.body))
                .unwrap_or_else(|e| {
                    error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "gateway_error",
                        &format!("response build error: {e}"),
                        &request_id,
                    )
                })
        }
        Err(e) => {
            let (status, error_type) = classify_error(&e);
            if status.is_server_error() {
                error!(error = %e, error_type, "platform API request failed");
            } else {
                warn!(error = %e, error_type, "platform API request rejected");
            }
            metrics::record_upstream_error(error_type);
            error_response(status, error_type, &e.to_string(), &request_id)
        }
    };

    metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Inbound headers minus hop-by-hop, `host`, `content-length` and
/// `authorization`. The coordinator owns the bearer token.
fn forwarded_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        if is_hop_by_hop(name.as_str())
            || name == header::HOST
            || name == header::CONTENT_LENGTH
            || name == header::AUTHORIZATION
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
