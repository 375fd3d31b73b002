//! AppRole Credential Session
//!
//! Logs into the shared store with a role/secret pair and keeps the session
//! alive with a background renewal task.
//!
//! ## Lifecycle
//!
//! `Unauthenticated -> Authenticated (renewing) -> Unauthenticated`
//!
//! The session falls back to unauthenticated when the lease is exhausted,
//! when a non-renewable lease reaches its expiry, or when the owning
//! cancellation token fires. Every login bumps the session generation; a renewal task
//! only touches state while its generation is current, so a superseded
//! task can never clobber a newer login.

use k8s_openapi::api::core::v1::Secret;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, warn, Instrument, Span};

use super::lease::{LeaseWatcher, WatcherEvent, DEFAULT_RENEW_INCREMENT};
use super::vault::{AuthBackend, AuthLease};
use crate::error::{Result, VanFormError};

pub const DEFAULT_APPROLE_PATH: &str = "approle";

const KEY_APPROLE_PATH: &str = "approle-path";
const KEY_ROLE_ID: &str = "role-id";
const KEY_SECRET_ID: &str = "secret-id";

/// Role/secret pair used to authenticate against the store
#[derive(Clone, PartialEq, Eq)]
pub struct AppRoleCredentials {
    pub role_id: String,
    pub secret_id: String,
    pub auth_method_path: String,
}

impl AppRoleCredentials {
    pub fn new(role_id: impl Into<String>, secret_id: impl Into<String>) -> Self {
        Self {
            role_id: role_id.into(),
            secret_id: secret_id.into(),
            auth_method_path: DEFAULT_APPROLE_PATH.to_string(),
        }
    }

    pub fn auth_method_path(mut self, path: impl Into<String>) -> Self {
        self.auth_method_path = path.into();
        self
    }

    /// Read `role-id`, `secret-id` and the optional `approle-path` from the
    /// store credentials secret.
    pub fn from_secret(secret: &Secret) -> Result<Self> {
        let name = secret.metadata.name.as_deref().unwrap_or("<unnamed>");
        let value = |key: &str| -> Option<String> {
            let data = secret.data.as_ref().and_then(|data| data.get(key));
            match data {
                Some(bytes) => Some(String::from_utf8_lossy(&bytes.0).trim().to_string()),
                None => secret
                    .string_data
                    .as_ref()
                    .and_then(|data| data.get(key))
                    .map(|s| s.trim().to_string()),
            }
        };
        let required = |key: &str| {
            value(key).filter(|v| !v.is_empty()).ok_or_else(|| {
                VanFormError::Config(format!("{} not found in secret {}", key, name))
            })
        };

        let credentials = Self::new(required(KEY_ROLE_ID)?, required(KEY_SECRET_ID)?);
        match value(KEY_APPROLE_PATH).filter(|p| !p.is_empty()) {
            Some(path) => Ok(credentials.auth_method_path(path)),
            None => Ok(credentials),
        }
    }
}

impl fmt::Debug for AppRoleCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppRoleCredentials")
            .field("role_id", &self.role_id)
            .field("secret_id", &"<redacted>")
            .field("auth_method_path", &self.auth_method_path)
            .finish()
    }
}

/// How the renewal task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalOutcome {
    /// The lease cannot be renewed; the session expires with it
    NotRenewable,
    /// The lease reached its maximum lifetime
    Exhausted,
    /// Renewal failed
    Failed,
    /// The owning context was cancelled
    Cancelled,
    /// A newer login replaced this task's session
    Superseded,
}

#[derive(Default)]
struct SessionState {
    generation: u64,
    logged_in: bool,
    client_token: Option<String>,
    cancel: Option<CancellationToken>,
    renewal: Option<JoinHandle<RenewalOutcome>>,
    /// Set for leases nobody renews
    expires_at: Option<Instant>,
}

impl SessionState {
    fn active(&self) -> bool {
        self.logged_in && self.expires_at.map_or(true, |at| Instant::now() < at)
    }

    fn clear(&mut self) {
        self.logged_in = false;
        self.client_token = None;
        self.expires_at = None;
    }
}

/// One authenticated store session per VAN Form instance
pub struct AppRoleSession {
    backend: Arc<dyn AuthBackend>,
    credentials: Option<AppRoleCredentials>,
    increment: u64,
    state: Arc<Mutex<SessionState>>,
    span: Span,
}

impl AppRoleSession {
    pub fn new(backend: Arc<dyn AuthBackend>) -> Self {
        Self {
            backend,
            credentials: None,
            increment: DEFAULT_RENEW_INCREMENT,
            state: Arc::new(Mutex::new(SessionState::default())),
            span: info_span!("approle"),
        }
    }

    pub fn with_credentials(mut self, credentials: AppRoleCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn for_van(mut self, van: &str) -> Self {
        self.span = info_span!("approle", van = %van);
        self
    }

    pub fn credentials(&self) -> Option<&AppRoleCredentials> {
        self.credentials.as_ref()
    }

    /// Authenticate and start the renewal task.
    ///
    /// Any previous renewal task is cancelled before the new login is
    /// attempted. The renewal task is scoped to a child of `parent`.
    pub async fn login(&self, parent: &CancellationToken) -> Result<AuthLease> {
        let mut state = self.state.lock().await;
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }
        state.renewal = None;
        state.generation += 1;
        state.clear();

        let credentials = self
            .credentials
            .as_ref()
            .ok_or_else(|| VanFormError::Auth("vault auth method not configured".to_string()))?;

        let lease = self
            .backend
            .login(
                &credentials.auth_method_path,
                &credentials.role_id,
                &credentials.secret_id,
            )
            .instrument(self.span.clone())
            .await
            .map_err(|e| VanFormError::Auth(format!("unable to login: {}", e)))?;

        state.logged_in = true;
        state.client_token = Some(lease.client_token.clone());
        // A zero lease never expires
        if !lease.renewable && lease.lease_duration > 0 {
            state.expires_at = Some(Instant::now() + Duration::from_secs(lease.lease_duration));
        }

        let cancel = parent.child_token();
        state.cancel = Some(cancel.clone());

        let task = RenewalTask {
            backend: self.backend.clone(),
            state: self.state.clone(),
            generation: state.generation,
            increment: self.increment,
            cancel,
        };
        let lease_for_task = lease.clone();
        state.renewal = Some(tokio::spawn(
            async move { task.run(lease_for_task).await }.instrument(self.span.clone()),
        ));

        debug!(parent: &self.span, generation = state.generation, "logged in");
        Ok(lease)
    }

    /// Cancel renewal and drop the session token
    pub async fn logout(&self) {
        let handle = {
            let mut state = self.state.lock().await;
            if let Some(cancel) = state.cancel.take() {
                cancel.cancel();
            }
            state.clear();
            state.renewal.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Whether the session holds a token that has not expired
    pub async fn is_authenticated(&self) -> bool {
        self.state.lock().await.active()
    }

    /// Current session token, if authenticated
    pub async fn client_token(&self) -> Option<String> {
        let state = self.state.lock().await;
        if state.active() {
            state.client_token.clone()
        } else {
            None
        }
    }

    pub async fn generation(&self) -> u64 {
        self.state.lock().await.generation
    }

    /// Wait for the current renewal task to end and report how it ended
    pub async fn wait_renewal(&self) -> Option<RenewalOutcome> {
        let handle = self.state.lock().await.renewal.take()?;
        handle.await.ok()
    }
}

struct RenewalTask {
    backend: Arc<dyn AuthBackend>,
    state: Arc<Mutex<SessionState>>,
    generation: u64,
    increment: u64,
    cancel: CancellationToken,
}

impl RenewalTask {
    async fn run(self, lease: AuthLease) -> RenewalOutcome {
        if !lease.renewable {
            warn!("Token is not configured to be renewable.");
            return RenewalOutcome::NotRenewable;
        }

        let mut watcher = LeaseWatcher::new(self.backend.clone(), &lease, self.increment);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    if !self.deauthenticate().await {
                        return RenewalOutcome::Superseded;
                    }
                    warn!("Context is canceled.");
                    return RenewalOutcome::Cancelled;
                }
                event = watcher.next() => match event {
                    WatcherEvent::Renewed { at, lease_duration } => {
                        debug!(at = %at, lease_duration, "Successfully renewed");
                    }
                    WatcherEvent::Done(result) => {
                        if !self.deauthenticate().await {
                            return RenewalOutcome::Superseded;
                        }
                        return match result {
                            Ok(()) => {
                                warn!("Token can no longer be renewed.");
                                RenewalOutcome::Exhausted
                            }
                            Err(e) => {
                                error!(error = %e, "Failed to renew token");
                                RenewalOutcome::Failed
                            }
                        };
                    }
                }
            }
        }
    }

    /// Mark the session unauthenticated if this task still owns it
    async fn deauthenticate(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.generation != self.generation {
            return false;
        }
        state.clear();
        state.cancel = None;
        true
    }
}
