//! Admin Session Gateway
//!
//! Local HTTP service that holds the platform admin session:
//! 1. Signs in against the platform API and keeps the credential
//! 2. Forwards every other request to the platform API with the bearer token
//! 3. Refreshes an expired access token once, however many requests hit 401
//! 4. Ends the session when the refresh fails

mod config;
mod error;
mod metrics;
mod profile;
mod proxy;
mod session_routes;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use platform_auth::{FileTokenStore, MemoryTokenStore, PlatformAuthClient, TokenStore};
use session::{CoordinatorConfig, EndpointPolicy, RefreshCoordinator};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::ReqwestTransport;

use crate::config::Config;
use crate::profile::ProfileCache;

/// How long in-flight requests may drain after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub(crate) struct AppState {
    coordinator: Arc<RefreshCoordinator>,
    auth: Arc<PlatformAuthClient>,
    profile: Arc<ProfileCache>,
    api_base: Arc<str>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Wire the HTTP client, auth client and coordinator for `config`.
fn build_state(
    config: &Config,
    token_store: Arc<dyn TokenStore>,
    prometheus: PrometheusHandle,
) -> Result<AppState> {
    let timeout = Duration::from_secs(config.api.timeout_secs);
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("failed to build HTTP client")?;

    let auth = Arc::new(PlatformAuthClient::new(
        client.clone(),
        config.api.base_url.clone(),
    ));
    let profile = Arc::new(ProfileCache::new());

    let coordinator = RefreshCoordinator::new(
        Arc::new(ReqwestTransport::new(client, timeout)),
        auth.clone(),
        token_store,
        EndpointPolicy::new(config.api.base_url.clone()),
    )
    .with_hook(profile.clone())
    .with_config(CoordinatorConfig {
        refresh_timeout: Duration::from_secs(config.auth.refresh_timeout_secs),
        max_pending: config.auth.max_pending,
    });

    Ok(AppState {
        coordinator: Arc::new(coordinator),
        auth,
        profile,
        api_base: Arc::from(config.api.base_url.as_str()),
        prometheus,
        started_at: Instant::now(),
    })
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/session", get(session_routes::session_status))
        .route("/session/login", post(session_routes::login))
        .route("/session/logout", post(session_routes::logout))
        .fallback(proxy_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting admin-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    let explicit = cli_config_path.is_some() || std::env::var_os("CONFIG_PATH").is_some();

    let config = if explicit || config_path.exists() {
        info!(path = %config_path.display(), "loading configuration");
        Config::load(&config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?
    } else {
        info!("no config file, using defaults and environment");
        Config::from_env().context("invalid configuration")?
    };

    info!(
        listen_addr = %config.gateway.listen_addr,
        api_base_url = %config.api.base_url,
        persistent_session = config.auth.credentials_path.is_some(),
        refresh_timeout_secs = config.auth.refresh_timeout_secs,
        max_pending = config.auth.max_pending,
        "configuration loaded"
    );

    let token_store: Arc<dyn TokenStore> = match &config.auth.credentials_path {
        Some(path) => Arc::new(
            FileTokenStore::load(path.clone())
                .await
                .with_context(|| format!("failed to load session from {}", path.display()))?,
        ),
        None => Arc::new(MemoryTokenStore::new()),
    };

    let app_state = build_state(&config, token_store, prometheus_handle)?;
    let app = build_router(app_state, config.gateway.max_connections);

    let listen_addr = config.gateway.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: process liveness plus session and refresh state.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let authenticated = state.coordinator.token_store().get().await.is_some();
    let body = serde_json::json!({
        "status": "healthy",
        "authenticated": authenticated,
        "refreshing": state.coordinator.is_refreshing(),
        "pending_requests": state.coordinator.pending_requests(),
        "api_base_url": &*state.api_base,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    });

    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint. Returns metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Catch-all handler that forwards everything else to the platform API.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    proxy::forward(
        &state.coordinator,
        &state.api_base,
        request,
        new_request_id(),
    )
    .await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::body::Body;
    use axum::http::{HeaderMap, Request, StatusCode};
    use platform_auth::{AdminProfile, AdminStatus, Credential};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    /// Create a PrometheusHandle for tests without installing a global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        recorder.handle()
    }

    fn test_state(api_base: &str, store: Arc<dyn TokenStore>) -> AppState {
        let mut config = Config::default();
        config.api.base_url = api_base.to_string();
        config.api.timeout_secs = 5;
        build_state(&config, store, test_prometheus_handle()).unwrap()
    }

    fn signed_in(access: &str, refresh: &str) -> Arc<dyn TokenStore> {
        Arc::new(MemoryTokenStore::with_credential(Credential::new(
            access, refresh,
        )))
    }

    /// Mock platform API.
    ///
    /// Login accepts password `hunter2` and issues at_1/rt_good. Refresh
    /// exchanges rt_good for at_2. `/v1/users/me` only accepts at_2.
    /// `/v1/plans` echoes what it received.
    async fn start_platform_api() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let refreshes = Arc::new(AtomicUsize::new(0));

        let counter = refreshes.clone();
        let app = Router::new()
            .route(
                "/v1/platform/auth/login",
                post(|Json(body): Json<serde_json::Value>| async move {
                    if body["password"] == "hunter2" {
                        (
                            StatusCode::OK,
                            Json(serde_json::json!({ "data": {
                                "accessToken": "at_1",
                                "refreshToken": "rt_good",
                                "admin": {
                                    "id": "adm_1",
                                    "name": "Ada",
                                    "email": body["email"],
                                    "roles": ["super_admin"],
                                    "status": "active",
                                    "createdAt": "2026-01-01T00:00:00Z"
                                }
                            }})),
                        )
                    } else {
                        (
                            StatusCode::UNAUTHORIZED,
                            Json(serde_json::json!({ "message": "Invalid email or password" })),
                        )
                    }
                }),
            )
            .route(
                "/v1/platform/auth/refresh",
                post(move |Json(body): Json<serde_json::Value>| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        if body["refreshToken"] == "rt_good" {
                            (
                                StatusCode::OK,
                                Json(serde_json::json!({ "data": { "accessToken": "at_2" } })),
                            )
                        } else {
                            (
                                StatusCode::UNAUTHORIZED,
                                Json(serde_json::json!({ "message": "Refresh token expired" })),
                            )
                        }
                    }
                }),
            )
            .route(
                "/v1/users/me",
                get(|headers: HeaderMap| async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("");
                    if auth == "Bearer at_2" {
                        (StatusCode::OK, Json(serde_json::json!({ "id": "adm_1" })))
                    } else {
                        (
                            StatusCode::UNAUTHORIZED,
                            Json(serde_json::json!({ "message": "Token expired" })),
                        )
                    }
                }),
            )
            .route(
                "/v1/plans",
                post(|headers: HeaderMap, body: String| async move {
                    Json(serde_json::json!({
                        "authorization": headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok()),
                        "body": body,
                    }))
                }),
            );

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{addr}"), refreshes)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn login_request(email: &str, password: &str) -> Request<Body> {
        Request::builder()
            .uri("/session/login")
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({ "email": email, "password": password }).to_string(),
            ))
            .unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_returns_json() {
        let state = test_state("http://unused", Arc::new(MemoryTokenStore::new()));
        let app = build_router(state, 1000);

        let response = app.oneshot(get_request("/health")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["authenticated"], false);
        assert_eq!(json["refreshing"], false);
        assert_eq!(json["pending_requests"], 0);
        assert!(json["uptime_seconds"].is_u64());
    }

    #[tokio::test]
    async fn login_stores_session_and_profile() {
        let (api, _) = start_platform_api().await;
        let state = test_state(&api, Arc::new(MemoryTokenStore::new()));
        let app = build_router(state.clone(), 1000);

        let response = app
            .clone()
            .oneshot(login_request("ada@example.com", "hunter2"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["admin"]["email"], "ada@example.com");

        assert_eq!(
            state.coordinator.token_store().get().await,
            Some(Credential::new("at_1", "rt_good"))
        );

        let json = body_json(app.oneshot(get_request("/session")).await.unwrap()).await;
        assert_eq!(json["authenticated"], true);
        assert_eq!(json["admin"]["roles"][0], "super_admin");
    }

    #[tokio::test]
    async fn login_validation_returns_422_without_calling_api() {
        let state = test_state("http://127.0.0.1:1", Arc::new(MemoryTokenStore::new()));
        let app = build_router(state, 1000);

        let response = app
            .oneshot(login_request("not-an-email", "hunter2"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "validation_error");
        assert_eq!(json["error"]["message"], "Invalid email address");
    }

    #[tokio::test]
    async fn rejected_login_surfaces_api_message() {
        let (api, refreshes) = start_platform_api().await;
        let state = test_state(&api, Arc::new(MemoryTokenStore::new()));
        let app = build_router(state, 1000);

        let response = app
            .oneshot(login_request("ada@example.com", "wrong"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "login_failed");
        assert_eq!(json["error"]["message"], "Invalid email or password");
        assert_eq!(refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_and_request_replayed() {
        let (api, refreshes) = start_platform_api().await;
        let state = test_state(&api, signed_in("at_1", "rt_good"));
        let app = build_router(state.clone(), 1000);

        let response = app.oneshot(get_request("/v1/users/me")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["id"], "adm_1");
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(
            state.coordinator.token_store().get().await,
            Some(Credential::new("at_2", "rt_good"))
        );
    }

    #[tokio::test]
    async fn concurrent_expired_requests_share_one_refresh() {
        let (api, refreshes) = start_platform_api().await;
        let state = test_state(&api, signed_in("at_1", "rt_good"));
        let app = build_router(state, 1000);

        let (a, b, c) = tokio::join!(
            app.clone().oneshot(get_request("/v1/users/me")),
            app.clone().oneshot(get_request("/v1/users/me")),
            app.clone().oneshot(get_request("/v1/users/me")),
        );

        for response in [a.unwrap(), b.unwrap(), c.unwrap()] {
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_refresh_ends_session() {
        let (api, refreshes) = start_platform_api().await;
        let state = test_state(&api, signed_in("at_1", "rt_revoked"));
        state.profile.set(Some(AdminProfile {
            id: "adm_1".into(),
            name: "Ada".into(),
            email: "ada@example.com".into(),
            roles: vec![],
            status: AdminStatus::Active,
            last_login_at: None,
            created_at: "2026-01-01T00:00:00Z".into(),
            updated_at: None,
        }));
        let app = build_router(state.clone(), 1000);

        let response = app
            .clone()
            .oneshot(get_request("/v1/users/me"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "session_expired");
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
        assert!(state.coordinator.token_store().get().await.is_none());
        assert!(state.profile.get().is_none());

        let json = body_json(app.oneshot(get_request("/session")).await.unwrap()).await;
        assert_eq!(json["authenticated"], false);
        assert!(json["admin"].is_null());
    }

    #[tokio::test]
    async fn proxy_replaces_caller_authorization_and_forwards_body() {
        let (api, _) = start_platform_api().await;
        let state = test_state(&api, signed_in("at_2", "rt_good"));
        let app = build_router(state, 1000);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/plans")
                    .method("POST")
                    .header("content-type", "application/json")
                    .header("authorization", "Bearer forged")
                    .header("connection", "keep-alive")
                    .body(Body::from(r#"{"name":"Starter"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["authorization"], "Bearer at_2");
        assert_eq!(json["body"], r#"{"name":"Starter"}"#);
    }

    #[tokio::test]
    async fn dead_upstream_returns_502_with_request_id() {
        let state = test_state("http://127.0.0.1:1", signed_in("at_1", "rt_good"));
        let app = build_router(state, 1000);

        let response = app.oneshot(get_request("/v1/users/me")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "upstream_error");
        assert!(json["error"]["message"].is_string());
        let request_id = json["error"]["request_id"].as_str().unwrap();
        assert!(
            request_id.starts_with("req_"),
            "request_id must start with 'req_' prefix, got: {request_id}"
        );
    }

    #[tokio::test]
    async fn logout_clears_session() {
        let state = test_state("http://unused", signed_in("at_1", "rt_good"));
        let app = build_router(state.clone(), 1000);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/session/logout")
                    .method("POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(state.coordinator.token_store().get().await.is_none());
        let json = body_json(app.oneshot(get_request("/session")).await.unwrap()).await;
        assert_eq!(json["authenticated"], false);
    }

    #[tokio::test]
    async fn logout_during_refresh_stays_signed_out() {
        let (api, refreshes) = start_platform_api().await;
        let state = test_state(&api, signed_in("at_1", "rt_good"));
        let app = build_router(state.clone(), 1000);

        let pending = tokio::spawn(app.clone().oneshot(get_request("/v1/users/me")));
        while refreshes.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/session/logout")
                    .method("POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = pending.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "session_expired");
        assert!(state.coordinator.token_store().get().await.is_none());
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_format() {
        let state = test_state("http://unused", Arc::new(MemoryTokenStore::new()));
        let app = build_router(state, 1000);

        let response = app.oneshot(get_request("/metrics")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.contains("text/plain"));
    }
}
