//! Single-flight credential refresh with FIFO replay
//!
//! The first caller whose request comes back 401 becomes the refresh leader.
//! Callers that hit a 401 while the leader is refreshing are parked on a
//! oneshot channel in arrival order. When the refresh settles the leader
//! drains the queue front to back, handing every waiter either the new access
//! token or the reason the session ended.
//!
//! A replayed request never re-enters the refresh flow: `replay()` turns any
//! non-2xx answer, including a second 401, into `Error::Rejected`.
//!
//! Login and logout go through `sign_in()`/`sign_out()`. They share a lock
//! with the write at the end of a refresh, and that write only lands if the
//! store still holds the credential the refresh started from.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use platform_auth::{Credential, RefreshClient, RefreshedToken, Secret, TokenStore};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use transport::{
    ApiRequest, ApiResponse, HeaderValue, StatusCode, Transport, TransportError, error_message,
    header,
};

use crate::error::{Error, Result};
use crate::hook::{NoopSessionHook, SessionHook};
use crate::policy::EndpointPolicy;

/// Default upper bound on a single refresh call.
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

/// Default cap on callers parked behind one refresh.
pub const DEFAULT_MAX_PENDING: usize = 1024;

const NOT_SIGNED_IN: &str = "not signed in";
const REFRESH_FAILED: &str = "credential refresh failed";

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// A refresh still running after this long is treated as failed
    pub refresh_timeout: Duration,
    /// Callers beyond this many waiters fail fast with `TooManyPending`
    pub max_pending: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

/// What a parked caller receives when the refresh settles.
#[derive(Clone)]
enum Release {
    Token(Secret),
    Expired(String),
    Abandoned,
}

impl Release {
    fn outcome(&self) -> Result<Secret> {
        match self {
            Release::Token(token) => Ok(token.clone()),
            Release::Expired(reason) => Err(Error::SessionExpired(reason.clone())),
            Release::Abandoned => Err(Error::RefreshAbandoned),
        }
    }
}

/// Store contents compared with the credential a refresh started from.
enum Stored {
    Unchanged,
    Replaced(Secret),
    SignedOut,
}

enum RefreshState {
    Idle,
    Refreshing {
        waiters: VecDeque<oneshot::Sender<Release>>,
    },
}

/// Sends authenticated requests and recovers from expired access tokens.
pub struct RefreshCoordinator {
    transport: Arc<dyn Transport>,
    refresh_client: Arc<dyn RefreshClient>,
    token_store: Arc<dyn TokenStore>,
    hook: Arc<dyn SessionHook>,
    policy: EndpointPolicy,
    config: CoordinatorConfig,
    state: Mutex<RefreshState>,
    /// Held around every credential write
    store_lock: tokio::sync::Mutex<()>,
}

impl RefreshCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        refresh_client: Arc<dyn RefreshClient>,
        token_store: Arc<dyn TokenStore>,
        policy: EndpointPolicy,
    ) -> Self {
        Self {
            transport,
            refresh_client,
            token_store,
            hook: Arc::new(NoopSessionHook),
            policy,
            config: CoordinatorConfig::default(),
            state: Mutex::new(RefreshState::Idle),
            store_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Install the hook fired when a refresh failure ends the session.
    pub fn with_hook(mut self, hook: Arc<dyn SessionHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn token_store(&self) -> &Arc<dyn TokenStore> {
        &self.token_store
    }

    pub fn policy(&self) -> &EndpointPolicy {
        &self.policy
    }

    /// Store the credential from a completed login.
    ///
    /// An in-flight refresh that started from an older credential will not
    /// overwrite it.
    pub async fn sign_in(&self, credential: Credential) -> platform_auth::Result<()> {
        let _store = self.store_lock.lock().await;
        self.token_store.set(credential).await
    }

    /// Forget the credential. An in-flight refresh will not restore it.
    pub async fn sign_out(&self) -> platform_auth::Result<()> {
        let _store = self.store_lock.lock().await;
        self.token_store.clear().await
    }

    /// Number of callers currently parked behind an in-flight refresh.
    pub fn pending_requests(&self) -> usize {
        match &*self.lock_state() {
            RefreshState::Idle => 0,
            RefreshState::Refreshing { waiters } => {
                waiters.iter().filter(|tx| !tx.is_closed()).count()
            }
        }
    }

    /// Whether a refresh is in flight.
    pub fn is_refreshing(&self) -> bool {
        matches!(&*self.lock_state(), RefreshState::Refreshing { .. })
    }

    /// Send `request` with the current access token.
    ///
    /// On a 401 from the protected API the request is replayed once after
    /// the credential has been refreshed. Any other non-2xx response is
    /// returned as `Error::Rejected` with the API's message.
    pub async fn request(&self, request: ApiRequest) -> Result<ApiResponse> {
        let sent_with = if self.policy.attaches_credential(&request.url) {
            self.token_store.get().await.map(|c| c.access_token)
        } else {
            None
        };

        let first = match &sent_with {
            Some(token) => with_bearer(request.clone(), token)?,
            None => request.clone(),
        };
        let response = self.transport.send(first).await?;

        if response.is_success() {
            return Ok(response);
        }
        if response.status != StatusCode::UNAUTHORIZED || !self.policy.is_refreshable(&request.url)
        {
            return Err(rejected(&response));
        }

        debug!(
            method = %request.method,
            path = %request.path(),
            "access token rejected, waiting for refresh"
        );
        let token = self.fresh_token(sent_with.as_ref()).await?;
        self.replay(request, &token).await
    }

    /// Join the in-flight refresh, or lead one if none is running.
    async fn fresh_token(&self, sent_with: Option<&Secret>) -> Result<Secret> {
        let receiver = {
            let mut state = self.lock_state();
            match &mut *state {
                idle @ RefreshState::Idle => {
                    *idle = RefreshState::Refreshing {
                        waiters: VecDeque::new(),
                    };
                    None
                }
                RefreshState::Refreshing { waiters } => {
                    // Cancelled callers give up their slot
                    waiters.retain(|tx| !tx.is_closed());
                    if waiters.len() >= self.config.max_pending {
                        warn!(
                            max_pending = self.config.max_pending,
                            "refresh queue full, rejecting request"
                        );
                        return Err(Error::TooManyPending(self.config.max_pending));
                    }
                    let (tx, rx) = oneshot::channel();
                    waiters.push_back(tx);
                    metrics::gauge!("session_pending_requests").set(waiters.len() as f64);
                    Some(rx)
                }
            }
        };

        let Some(receiver) = receiver else {
            return self.lead_refresh(sent_with).await;
        };

        match receiver.await {
            Ok(release) => release.outcome(),
            Err(_) => Err(Error::RefreshAbandoned),
        }
    }

    /// Run the refresh and release every parked caller with its outcome.
    ///
    /// Only ever called by the caller that moved the state to `Refreshing`.
    async fn lead_refresh(&self, sent_with: Option<&Secret>) -> Result<Secret> {
        let guard = ReleaseGuard {
            state: &self.state,
            released: false,
        };

        let Some(credential) = self.token_store.get().await else {
            debug!("no stored credential, nothing to refresh");
            guard.release(Release::Expired(NOT_SIGNED_IN.to_string()));
            return Err(Error::SessionExpired(NOT_SIGNED_IN.to_string()));
        };

        // Stored token already differs from the rejected one: a refresh or a
        // login completed after this request went out.
        if sent_with != Some(&credential.access_token) {
            debug!("credential changed since request was sent, replaying without refresh");
            let token = credential.access_token.clone();
            guard.release(Release::Token(token.clone()));
            return Ok(token);
        }

        let timeout = self.config.refresh_timeout;
        let outcome = tokio::time::timeout(
            timeout,
            self.refresh_client
                .refresh(credential.refresh_token.expose()),
        )
        .await;

        match outcome {
            Ok(Ok(refreshed)) => {
                metrics::counter!("session_refresh_total", "outcome" => "success").increment(1);
                let release = self.store_refreshed(&credential, refreshed).await;
                let result = release.outcome();
                guard.release(release);
                result
            }
            Ok(Err(e)) => {
                warn!(error = %e, "credential refresh failed");
                self.end_session(guard, &credential, "failure", REFRESH_FAILED.to_string())
                    .await
            }
            Err(_) => {
                self.end_session(
                    guard,
                    &credential,
                    "timeout",
                    format!("credential refresh timed out after {}s", timeout.as_secs()),
                )
                .await
            }
        }
    }

    /// Compare the store with `previous`. Call with `store_lock` held.
    async fn stored_since(&self, previous: &Credential) -> Stored {
        match self.token_store.get().await {
            Some(current) if current == *previous => Stored::Unchanged,
            Some(current) => Stored::Replaced(current.access_token),
            None => Stored::SignedOut,
        }
    }

    /// Persist a refreshed token, keeping the old refresh token unless rotated.
    ///
    /// The write is skipped when a login or logout happened during the refresh.
    async fn store_refreshed(&self, previous: &Credential, refreshed: RefreshedToken) -> Release {
        let _store = self.store_lock.lock().await;
        match self.stored_since(previous).await {
            Stored::Unchanged => {}
            Stored::Replaced(token) => {
                info!("credential replaced during refresh, discarding refreshed token");
                return Release::Token(token);
            }
            Stored::SignedOut => {
                info!("signed out during refresh, discarding refreshed token");
                return Release::Expired(NOT_SIGNED_IN.to_string());
            }
        }

        let RefreshedToken {
            access_token,
            refresh_token,
        } = refreshed;
        let rotated = refresh_token.is_some();
        let credential = Credential {
            access_token: access_token.clone(),
            refresh_token: refresh_token.unwrap_or_else(|| previous.refresh_token.clone()),
        };

        if let Err(e) = self.token_store.set(credential).await {
            warn!(error = %e, "failed to persist refreshed credential");
        }
        info!(rotated, "access token refreshed");
        Release::Token(access_token)
    }

    /// Clear the credential, reject every parked caller, then fire the hook.
    ///
    /// A login during the refresh wins: its token is handed out instead and
    /// nothing is cleared. After a logout there is nothing left to end.
    async fn end_session(
        &self,
        guard: ReleaseGuard<'_>,
        previous: &Credential,
        outcome: &'static str,
        reason: String,
    ) -> Result<Secret> {
        metrics::counter!("session_refresh_total", "outcome" => outcome).increment(1);

        let store = self.store_lock.lock().await;
        match self.stored_since(previous).await {
            Stored::Unchanged => {}
            Stored::Replaced(token) => {
                drop(store);
                info!(outcome, "credential replaced during refresh, keeping session");
                guard.release(Release::Token(token.clone()));
                return Ok(token);
            }
            Stored::SignedOut => {
                drop(store);
                debug!(outcome, "signed out during refresh");
                let release = Release::Expired(NOT_SIGNED_IN.to_string());
                let result = release.outcome();
                guard.release(release);
                return result;
            }
        }

        warn!(outcome, reason = %reason, "ending session");
        if let Err(e) = self.token_store.clear().await {
            warn!(error = %e, "failed to clear stored credential");
        }
        drop(store);
        guard.release(Release::Expired(reason.clone()));
        self.hook.session_expired(&reason);

        Err(Error::SessionExpired(reason))
    }

    /// Resend `request` with `token`. Never triggers another refresh.
    async fn replay(&self, request: ApiRequest, token: &Secret) -> Result<ApiResponse> {
        metrics::counter!("session_replayed_requests_total").increment(1);
        let path = request.path();
        let response = self.transport.send(with_bearer(request, token)?).await?;

        if response.is_success() {
            return Ok(response);
        }
        if response.status == StatusCode::UNAUTHORIZED {
            warn!(path = %path, "replayed request rejected again");
        }
        Err(rejected(&response))
    }

    fn lock_state(&self) -> MutexGuard<'_, RefreshState> {
        lock(&self.state)
    }
}

fn lock(state: &Mutex<RefreshState>) -> MutexGuard<'_, RefreshState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Returns the state to `Idle` and hands `Release::Abandoned` to any parked
/// caller if the leader's future is dropped before it settles.
struct ReleaseGuard<'a> {
    state: &'a Mutex<RefreshState>,
    released: bool,
}

impl ReleaseGuard<'_> {
    fn release(mut self, release: Release) {
        self.released = true;
        self.drain(release);
    }

    fn drain(&self, release: Release) {
        let waiters = match std::mem::replace(&mut *lock(self.state), RefreshState::Idle) {
            RefreshState::Idle => VecDeque::new(),
            RefreshState::Refreshing { waiters } => waiters,
        };
        metrics::gauge!("session_pending_requests").set(0.0);

        for waiter in waiters {
            // Receiver gone means that caller was cancelled
            let _ = waiter.send(release.clone());
        }
    }
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            warn!("credential refresh abandoned, releasing waiters");
            self.drain(Release::Abandoned);
        }
    }
}

fn with_bearer(request: ApiRequest, token: &Secret) -> Result<ApiRequest> {
    let mut value = HeaderValue::from_str(&token.bearer())
        .map_err(|e| TransportError::Encode(format!("invalid access token: {e}")))?;
    value.set_sensitive(true);
    Ok(request.header(header::AUTHORIZATION, value))
}

fn rejected(response: &ApiResponse) -> Error {
    Error::Rejected {
        status: response.status,
        message: error_message(response.status, &response.body),
    }
}
