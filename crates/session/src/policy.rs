//! Which requests get a bearer token and which 401s trigger a refresh
//!
//! Only the protected platform API participates in the refresh flow. The
//! login and refresh endpoints are excluded outright: a 401 from them is an
//! answer about the credentials themselves, and refreshing in response would
//! recurse.

use platform_auth::{LOGIN_PATH, REFRESH_PATH};

/// URL rules for the refresh coordinator.
#[derive(Debug, Clone)]
pub struct EndpointPolicy {
    api_base: String,
    excluded_paths: Vec<String>,
}

impl EndpointPolicy {
    /// Policy for the API at `api_base`, excluding the login and refresh endpoints.
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            excluded_paths: vec![LOGIN_PATH.to_string(), REFRESH_PATH.to_string()],
        }
    }

    /// Exclude another unauthenticated endpoint (e.g. password reset).
    pub fn with_excluded_path(mut self, path: impl Into<String>) -> Self {
        self.excluded_paths.push(path.into());
        self
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// Login/refresh (or other excluded) endpoint.
    pub fn is_auth_endpoint(&self, url: &str) -> bool {
        self.excluded_paths.iter().any(|p| url.contains(p.as_str()))
    }

    /// Whether `url` targets the configured API origin and base path.
    pub fn is_api_url(&self, url: &str) -> bool {
        match url.strip_prefix(self.api_base.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'),
            None => false,
        }
    }

    /// Whether the stored access token is attached to a request for `url`.
    pub fn attaches_credential(&self, url: &str) -> bool {
        !self.is_auth_endpoint(url)
    }

    /// Whether a 401 from `url` enters the refresh flow.
    pub fn is_refreshable(&self, url: &str) -> bool {
        self.is_api_url(url) && !self.is_auth_endpoint(url)
    }
}
