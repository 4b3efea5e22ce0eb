//! reqwest-backed transport
//!
//! Sends `ApiRequest`s through a shared `reqwest::Client` with a per-request
//! timeout and buffers the response body. Upstream error statuses are
//! returned as ordinary responses; only timeouts and connection failures
//! become `TransportError`s.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, warn};

use crate::{ApiRequest, ApiResponse, Result, Transport, TransportError};

/// Production transport over `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn dispatch(&self, request: ApiRequest) -> Result<ApiResponse> {
        let method = request.method.clone();
        let url = request.url.clone();

        let mut builder = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers)
            .timeout(self.timeout);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                warn!(%method, %url, timeout_secs = self.timeout.as_secs(), "request timed out");
                TransportError::Timeout(format!("{method} {url} after {}s", self.timeout.as_secs()))
            } else {
                warn!(%method, %url, error = %e, "request failed");
                TransportError::Network(format!("{method} {url}: {e}"))
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(format!("reading body of {method} {url}"))
            } else {
                TransportError::Network(format!("reading body of {method} {url}: {e}"))
            }
        })?;

        debug!(%method, %url, status = status.as_u16(), "response received");
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}

impl Transport for ReqwestTransport {
    fn send(
        &self,
        request: ApiRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ApiResponse>> + Send + '_>> {
        Box::pin(self.dispatch(request))
    }
}
