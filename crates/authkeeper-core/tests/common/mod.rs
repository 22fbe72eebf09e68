#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use authkeeper_core::auth::{AuthBackend, AuthError, CoordinatorOptions};
use authkeeper_core::models::{TokenPair, UserProfile};
use authkeeper_core::store::{KeyValueStore, Origin};
use authkeeper_core::{AuthCoordinator, HttpPipeline};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use futures::future::BoxFuture;
use tokio::sync::Notify;

/// Unsigned JWT expiring `secs` seconds from now.
pub fn jwt_expiring_in(secs: i64) -> String {
    let exp = chrono::Utc::now().timestamp() + secs;
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"ada","exp":{}}}"#, exp));
    format!("{}.{}.test-signature", header, payload)
}

pub fn profile() -> UserProfile {
    UserProfile {
        username: "ada".to_string(),
        scopes: vec!["compare".to_string()],
        id: None,
        email: None,
    }
}

/// Let spawned timer and listener tasks run to completion.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// In-process backend with call counters.
pub struct FakeBackend {
    pub refresh_calls: AtomicUsize,
    pub profile_calls: AtomicUsize,
    reject_refresh: AtomicBool,
    fail_profile: AtomicBool,
    issued_lifetime_secs: i64,
    profile_gate: Mutex<Option<Arc<Notify>>>,
    refresh_gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeBackend {
    pub fn new(issued_lifetime_secs: i64) -> Arc<Self> {
        Arc::new(Self {
            refresh_calls: AtomicUsize::new(0),
            profile_calls: AtomicUsize::new(0),
            reject_refresh: AtomicBool::new(false),
            fail_profile: AtomicBool::new(false),
            issued_lifetime_secs,
            profile_gate: Mutex::new(None),
            refresh_gate: Mutex::new(None),
        })
    }

    pub fn reject_refresh(&self) {
        self.reject_refresh.store(true, Ordering::SeqCst);
    }

    pub fn fail_profile(&self) {
        self.fail_profile.store(true, Ordering::SeqCst);
    }

    /// Make the next profile fetches wait until the returned gate is notified.
    pub fn gate_profile(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.profile_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    /// Make the next refreshes wait until the returned gate is notified.
    pub fn gate_refresh(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.refresh_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn refreshes(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn profiles(&self) -> usize {
        self.profile_calls.load(Ordering::SeqCst)
    }
}

impl AuthBackend for FakeBackend {
    fn refresh<'a>(
        &'a self,
        _refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<TokenPair, AuthError>> {
        Box::pin(async move {
            let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
            let gate = self.refresh_gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            if self.reject_refresh.load(Ordering::SeqCst) {
                return Err(AuthError::RefreshRejected("refresh token revoked".to_string()));
            }
            Ok(TokenPair {
                access_token: jwt_expiring_in(self.issued_lifetime_secs),
                refresh_token: format!("r{}", n + 1),
            })
        })
    }

    fn fetch_profile(&self) -> BoxFuture<'_, Result<UserProfile, AuthError>> {
        Box::pin(async move {
            self.profile_calls.fetch_add(1, Ordering::SeqCst);
            let gate = self.profile_gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            if self.fail_profile.load(Ordering::SeqCst) {
                return Err(AuthError::ProfileFetch("server error 500".to_string()));
            }
            Ok(profile())
        })
    }
}

pub struct Harness {
    pub coordinator: AuthCoordinator,
    pub backend: Arc<FakeBackend>,
    pub pipeline: Arc<HttpPipeline>,
    pub store: Arc<dyn KeyValueStore>,
}

/// A coordinator bound to its own context of `origin`.
pub fn harness(origin: &Arc<Origin>, margin_secs: u64, issued_lifetime_secs: i64) -> Harness {
    let store: Arc<dyn KeyValueStore> = Arc::new(origin.open_context());
    let backend = FakeBackend::new(issued_lifetime_secs);
    let pipeline = Arc::new(HttpPipeline::new(Duration::from_secs(5)).unwrap());
    let options = CoordinatorOptions {
        refresh_margin: Duration::from_secs(margin_secs),
        ..CoordinatorOptions::default()
    };
    let coordinator = AuthCoordinator::new(
        Arc::clone(&store),
        backend.clone(),
        Arc::clone(&pipeline),
        options,
    );
    Harness {
        coordinator,
        backend,
        pipeline,
        store,
    }
}
