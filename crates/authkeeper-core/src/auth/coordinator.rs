//! Top-level authentication state machine.
//!
//! The coordinator is the only writer of the token entries. It owns the
//! single pending refresh timer, the pipeline's bearer credential, and a
//! listener that mirrors token changes made by other contexts of the same
//! origin.
//!
//! Two counters guard against late async results:
//! - `epoch` is bumped on every login and every logout; a login whose epoch
//!   moved while it awaited the profile is discarded.
//! - `revision` is bumped whenever the credential changes; a refresh result
//!   whose revision moved while it was in flight is discarded.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::api::{ApiClient, ApiError, HttpPipeline, InterceptorHandle};
use crate::config::AuthConfig;
use crate::models::UserProfile;
use crate::store::{keys, KeyValueStore};

use super::session::{default_session_paths, IDLE_THRESHOLD_HOURS};
use super::token::DEFAULT_REFRESH_MARGIN;
use super::{
    AuthBackend, AuthError, Credential, CredentialStore, RefreshSchedule, SessionTracker,
    TokenManager,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub enum AuthState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    LoggingOut,
}

impl AuthState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthState::Authenticated)
    }

    /// States in which a credential is stored and refreshes may run
    fn holds_credential(&self) -> bool {
        matches!(self, AuthState::Authenticating | AuthState::Authenticated)
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AuthState::Unauthenticated => "unauthenticated",
            AuthState::Authenticating => "authenticating",
            AuthState::Authenticated => "authenticated",
            AuthState::LoggingOut => "logging out",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub refresh_margin: Duration,
    pub idle_threshold: chrono::Duration,
    pub session_paths: Vec<String>,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            refresh_margin: DEFAULT_REFRESH_MARGIN,
            idle_threshold: chrono::Duration::hours(IDLE_THRESHOLD_HOURS),
            session_paths: default_session_paths(),
        }
    }
}

impl From<&AuthConfig> for CoordinatorOptions {
    fn from(config: &AuthConfig) -> Self {
        Self {
            refresh_margin: config.refresh_margin(),
            idle_threshold: config.idle_threshold(),
            session_paths: config.tracked_session_paths(),
        }
    }
}

struct Machine {
    auth: AuthState,
    profile: Option<UserProfile>,
    schedule: RefreshSchedule,
    epoch: u64,
    revision: u64,
    listener: Option<JoinHandle<()>>,
    interceptors: Vec<InterceptorHandle>,
    /// Access token the bearer and the pending refresh were derived from
    applied_token: Option<String>,
}

struct Shared {
    credentials: CredentialStore,
    session: Arc<SessionTracker>,
    tokens: TokenManager,
    backend: Arc<dyn AuthBackend>,
    pipeline: Arc<HttpPipeline>,
    machine: Mutex<Machine>,
    state_tx: watch::Sender<AuthState>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let machine = self.machine.get_mut().unwrap_or_else(PoisonError::into_inner);
        machine.schedule.cancel();
        if let Some(listener) = machine.listener.take() {
            listener.abort();
        }
        for handle in machine.interceptors.drain(..) {
            self.pipeline.uninstall(handle);
        }
    }
}

/// Owns login/logout, the refresh timer and cross-context synchronization.
/// Clone is cheap; all clones drive the same state machine.
#[derive(Clone)]
pub struct AuthCoordinator {
    shared: Arc<Shared>,
}

impl AuthCoordinator {
    /// Create a coordinator and install the session interceptors on `pipeline`.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        backend: Arc<dyn AuthBackend>,
        pipeline: Arc<HttpPipeline>,
        options: CoordinatorOptions,
    ) -> Self {
        let session = Arc::new(SessionTracker::new(
            Arc::clone(&store),
            options.idle_threshold,
            options.session_paths,
        ));
        let interceptors = vec![
            pipeline.install_request_interceptor(session.clone()),
            pipeline.install_response_interceptor(session.clone()),
        ];
        let tokens = TokenManager::new(
            Arc::clone(&backend),
            Arc::clone(&pipeline),
            options.refresh_margin,
        );
        let (state_tx, _) = watch::channel(AuthState::Unauthenticated);

        Self {
            shared: Arc::new(Shared {
                credentials: CredentialStore::new(store),
                session,
                tokens,
                backend,
                pipeline,
                machine: Mutex::new(Machine {
                    auth: AuthState::Unauthenticated,
                    profile: None,
                    schedule: RefreshSchedule::new(),
                    epoch: 0,
                    revision: 0,
                    listener: None,
                    interceptors,
                    applied_token: None,
                }),
                state_tx,
            }),
        }
    }

    /// Build the pipeline, API client and coordinator described by `config`.
    pub fn from_config(
        config: &AuthConfig,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<(Self, ApiClient), ApiError> {
        let pipeline = Arc::new(HttpPipeline::new(config.request_timeout())?);
        let api = ApiClient::new(Arc::clone(&pipeline), &config.base_url);
        let coordinator = Self::new(
            store,
            Arc::new(api.clone()),
            pipeline,
            CoordinatorOptions::from(config),
        );
        Ok((coordinator, api))
    }

    fn lock(&self) -> MutexGuard<'_, Machine> {
        self.shared
            .machine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, machine: &mut Machine, next: AuthState) {
        if machine.auth != next {
            debug!(from = %machine.auth, to = %next, "Auth state transition");
            machine.auth = next;
            self.shared.state_tx.send_replace(next);
        }
    }

    // ===== Observation =====

    pub fn state(&self) -> AuthState {
        self.lock().auth
    }

    pub fn is_authenticated(&self) -> bool {
        self.state().is_authenticated()
    }

    pub fn profile(&self) -> Option<UserProfile> {
        self.lock().profile.clone()
    }

    /// Watch auth state transitions.
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.shared.state_tx.subscribe()
    }

    pub fn has_pending_refresh(&self) -> bool {
        self.lock().schedule.is_pending()
    }

    /// Time until the pending refresh fires
    pub fn next_refresh_in(&self) -> Option<Duration> {
        self.lock().schedule.due_in()
    }

    pub fn session(&self) -> &SessionTracker {
        &self.shared.session
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.shared.credentials
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.shared.tokens
    }

    // ===== Lifecycle =====

    /// Start listening for other contexts and adopt any stored credential.
    ///
    /// A stored credential is not trusted: a refresh is scheduled from its
    /// expiry and the profile is fetched; if that fetch fails the stored
    /// credential is discarded. Returns the profile when the stored
    /// credential checked out.
    pub async fn start(&self) -> Result<Option<UserProfile>, AuthError> {
        let epoch = {
            let mut machine = self.lock();
            if machine.listener.is_none() {
                machine.listener = Some(self.spawn_sync_listener());
            }
            let Some(token) = self.shared.credentials.access_token()? else {
                debug!("No stored credential at startup");
                return Ok(None);
            };
            machine.revision += 1;
            self.shared.tokens.apply_to_request_default(&token);
            self.schedule_refresh(&mut machine, &token);
            self.set_state(&mut machine, AuthState::Authenticated);
            machine.epoch
        };

        info!("Stored credential found, verifying with profile fetch");
        let fetched = self.shared.backend.fetch_profile().await;

        let mut machine = self.lock();
        if machine.epoch != epoch {
            debug!("Startup profile arrived after the session changed, discarding");
            return Ok(None);
        }
        match fetched {
            Ok(profile) => {
                info!(username = %profile.username, "Resumed stored session");
                machine.profile = Some(profile.clone());
                Ok(Some(profile))
            }
            Err(e) => {
                warn!(error = %e, "Stored credential failed verification, logging out");
                self.teardown(&mut machine);
                Ok(None)
            }
        }
    }

    /// Persist a freshly issued credential and fetch the user's profile.
    ///
    /// Any failure tears the session down completely before being returned.
    pub async fn login(
        &self,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<UserProfile, AuthError> {
        let credential = Credential::new(access_token, refresh_token);
        let epoch = {
            let mut machine = self.lock();
            machine.epoch += 1;
            machine.profile = None;
            self.set_state(&mut machine, AuthState::Authenticating);
            if let Err(e) = self.install(&mut machine, &credential) {
                error!(error = %e, "Failed to install credential, logging out");
                self.teardown(&mut machine);
                return Err(e);
            }
            machine.epoch
        };

        let fetched = self.shared.backend.fetch_profile().await;

        let mut machine = self.lock();
        if machine.epoch != epoch {
            debug!("Login superseded while fetching profile, discarding");
            return Err(AuthError::StaleResponse);
        }
        match fetched {
            Ok(profile) => {
                info!(username = %profile.username, scopes = profile.scopes.len(), "Logged in");
                machine.profile = Some(profile.clone());
                self.set_state(&mut machine, AuthState::Authenticated);
                Ok(profile)
            }
            Err(e) => {
                warn!(error = %e, "Profile fetch failed during login, logging out");
                self.teardown(&mut machine);
                Err(e)
            }
        }
    }

    /// Clear the credential and session and cancel the refresh timer.
    /// Calling it while already logged out does nothing.
    pub fn logout(&self) {
        let mut machine = self.lock();
        if machine.auth == AuthState::Unauthenticated
            && !machine.schedule.is_pending()
            && !self.shared.credentials.has_credentials()
        {
            debug!("Logout requested while already logged out");
            return;
        }
        self.teardown(&mut machine);
    }

    /// Stop background work and remove this coordinator's interceptors.
    /// Stored credentials are left as they are.
    pub fn shutdown(&self) {
        let mut machine = self.lock();
        machine.schedule.cancel();
        if let Some(listener) = machine.listener.take() {
            listener.abort();
        }
        for handle in machine.interceptors.drain(..) {
            self.shared.pipeline.uninstall(handle);
        }
        debug!("Auth coordinator shut down");
    }

    // ===== Internals =====

    fn install(&self, machine: &mut Machine, credential: &Credential) -> Result<(), AuthError> {
        machine.revision += 1;
        self.shared.credentials.store(credential)?;
        self.shared
            .tokens
            .apply_to_request_default(&credential.access_token);
        self.shared.session.clear()?;
        self.schedule_refresh(machine, &credential.access_token);
        Ok(())
    }

    /// Full logout semantics. Store failures are logged; local state is torn down regardless.
    fn teardown(&self, machine: &mut Machine) {
        let was = machine.auth;
        self.set_state(machine, AuthState::LoggingOut);
        machine.epoch += 1;
        machine.revision += 1;
        machine.schedule.cancel();
        machine.profile = None;
        machine.applied_token = None;
        self.shared.tokens.clear_request_default();
        if let Err(e) = self.shared.credentials.delete() {
            error!(error = %e, "Failed to delete stored credential");
        }
        if let Err(e) = self.shared.session.clear() {
            warn!(error = %e, "Failed to clear session");
        }
        self.set_state(machine, AuthState::Unauthenticated);
        if was != AuthState::Unauthenticated {
            info!("Logged out");
        }
    }

    /// Replace the pending refresh with one timed from `access_token`'s expiry.
    fn schedule_refresh(&self, machine: &mut Machine, access_token: &str) {
        let delay = self.shared.tokens.compute_refresh_delay(access_token);
        machine.applied_token = Some(access_token.to_string());
        let weak = Arc::downgrade(&self.shared);
        machine.schedule.replace(delay, move |generation| async move {
            if let Some(shared) = weak.upgrade() {
                AuthCoordinator { shared }.on_refresh_due(generation).await;
            }
        });
        debug!(delay_secs = delay.as_secs(), "Token refresh scheduled");
    }

    fn on_refresh_due(self, generation: u64) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let claim = {
                let mut machine = self.lock();
                if !machine.schedule.take_fired(generation) {
                    trace!(generation, "Superseded refresh timer fired, ignoring");
                    return;
                }
                if !machine.auth.holds_credential() {
                    debug!(state = %machine.auth, "Refresh timer fired without a session");
                    return;
                }
                match self.shared.credentials.access_token() {
                    Ok(stored) if stored != machine.applied_token => {
                        debug!("Stored token changed since the refresh was scheduled");
                        self.follow_store(&mut machine);
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "Failed to read stored token, logging out");
                        self.teardown(&mut machine);
                        return;
                    }
                }
                (
                    machine.epoch,
                    machine.revision,
                    self.shared.credentials.require_refresh_token(),
                )
            };

            let (epoch, revision, refresh_token) = match claim {
                (epoch, revision, Ok(token)) => (epoch, revision, token),
                (_, _, Err(e)) => {
                    warn!(error = %e, "Refresh due without a usable refresh token, logging out");
                    self.logout();
                    return;
                }
            };

            let outcome = self.shared.tokens.refresh(&refresh_token).await;
            self.apply_refresh_outcome(epoch, revision, &refresh_token, outcome);
        })
    }

    fn apply_refresh_outcome(
        &self,
        epoch: u64,
        revision: u64,
        used_refresh_token: &str,
        outcome: Result<Credential, AuthError>,
    ) {
        let mut machine = self.lock();
        if machine.epoch != epoch
            || machine.revision != revision
            || !machine.auth.holds_credential()
        {
            debug!("Refresh result arrived after the credential changed, discarding");
            return;
        }

        match outcome {
            Ok(credential) => {
                machine.revision += 1;
                if let Err(e) = self.shared.credentials.store(&credential) {
                    error!(error = %e, "Failed to persist refreshed credential, logging out");
                    self.teardown(&mut machine);
                    return;
                }
                self.shared
                    .tokens
                    .apply_to_request_default(&credential.access_token);
                self.schedule_refresh(&mut machine, &credential.access_token);
                info!("Access token refreshed");
            }
            Err(e) => match self.shared.credentials.load() {
                // Another context refreshed first and our refresh token was already spent
                Ok(Some(stored)) if stored.refresh_token != used_refresh_token => {
                    info!(error = %e, "Refresh lost to another context, adopting its credential");
                    self.follow_store(&mut machine);
                }
                _ => {
                    warn!(error = %e, "Token refresh failed, logging out");
                    self.teardown(&mut machine);
                }
            },
        }
    }

    fn spawn_sync_listener(&self) -> JoinHandle<()> {
        let mut changes = self.shared.credentials.subscribe();
        let weak = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                if change.key != keys::TOKEN {
                    continue;
                }
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                AuthCoordinator { shared }.apply_external_change();
            }
            trace!("Store change listener stopped");
        })
    }

    /// React to a token change made by another context.
    fn apply_external_change(&self) {
        let mut machine = self.lock();
        self.follow_store(&mut machine);
    }

    /// Bring this context in line with the token currently in the store.
    ///
    /// Notifications can arrive after the fact, so the store is read again
    /// rather than trusting the value carried by the notification. Never
    /// touches the network.
    fn follow_store(&self, machine: &mut Machine) {
        let stored = match self.shared.credentials.access_token() {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "Failed to read stored token, ignoring change");
                return;
            }
        };

        match stored {
            Some(token) => {
                if machine.applied_token.as_deref() == Some(token.as_str())
                    && machine.auth.holds_credential()
                    && machine.schedule.is_pending()
                {
                    return;
                }
                machine.revision += 1;
                self.shared.tokens.apply_to_request_default(&token);
                self.schedule_refresh(machine, &token);
                if machine.auth == AuthState::Unauthenticated {
                    info!("Signed in from another context");
                    self.set_state(machine, AuthState::Authenticated);
                } else {
                    debug!("Access token updated by another context");
                }
            }
            None => {
                if machine.auth == AuthState::Unauthenticated && !machine.schedule.is_pending() {
                    return;
                }
                info!("Signed out from another context");
                machine.epoch += 1;
                machine.revision += 1;
                machine.schedule.cancel();
                machine.profile = None;
                machine.applied_token = None;
                self.shared.tokens.clear_request_default();
                self.set_state(machine, AuthState::Unauthenticated);
            }
        }
    }
}
