//! Failure classification for platform API responses
//!
//! Distinguishes the one status that drives the credential refresh flow
//! (401 Unauthorized) from every other rejection. Rejections carry a message
//! pulled from the structured error body so callers can surface it as-is.

use reqwest::StatusCode;

/// JSON pointers probed, in order, for a human-readable error message.
const MESSAGE_POINTERS: &[&str] = &["/message", "/error/message", "/error", "/data/message"];

/// How a non-2xx response should be treated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// The presented access token is missing, invalid or expired.
    Unauthenticated,
    /// Any other rejection, with the message to surface.
    Rejected { message: String },
}

/// Classify a non-2xx response by status and body.
pub fn classify_failure(status: StatusCode, body: &[u8]) -> FailureKind {
    if status == StatusCode::UNAUTHORIZED {
        return FailureKind::Unauthenticated;
    }
    FailureKind::Rejected {
        message: error_message(status, body),
    }
}

/// Extract the message from a structured error body.
///
/// Falls back to a generic message naming the status when the body is not
/// JSON or carries no string message.
pub fn error_message(status: StatusCode, body: &[u8]) -> String {
    structured_message(body)
        .unwrap_or_else(|| format!("Request failed with status {}", status.as_u16()))
}

/// The first non-blank string message found in a JSON error body.
pub fn structured_message(body: &[u8]) -> Option<String> {
    let value = serde_json::from_slice::<serde_json::Value>(body).ok()?;
    MESSAGE_POINTERS.iter().find_map(|pointer| {
        value
            .pointer(pointer)
            .and_then(|m| m.as_str())
            .filter(|m| !m.trim().is_empty())
            .map(str::to_string)
    })
}
