use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::api::HttpPipeline;

use super::{AuthBackend, AuthError, Credential};

/// Default lead time before expiry at which the access token is refreshed
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ExpiryClaim {
    exp: f64,
}

/// Read the `exp` claim from a JWT payload without verifying the signature.
pub fn decode_expiry(access_token: &str) -> Result<DateTime<Utc>, AuthError> {
    let mut segments = access_token.split('.');
    let payload = match (segments.next(), segments.next(), segments.next(), segments.next()) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => {
            return Err(AuthError::MalformedCredential(
                "expected three dot-separated segments".to_string(),
            ))
        }
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| AuthError::MalformedCredential(format!("payload is not base64url: {}", e)))?;
    let claim: ExpiryClaim = serde_json::from_slice(&bytes)
        .map_err(|e| AuthError::MalformedCredential(format!("no usable exp claim: {}", e)))?;

    if !claim.exp.is_finite() {
        return Err(AuthError::MalformedCredential("exp is not finite".to_string()));
    }
    DateTime::from_timestamp(claim.exp.trunc() as i64, 0)
        .ok_or_else(|| AuthError::MalformedCredential("exp is out of range".to_string()))
}

/// Computes refresh timing, performs the refresh exchange, and owns the
/// pipeline's default bearer credential. Never writes the credential store.
#[derive(Clone)]
pub struct TokenManager {
    backend: Arc<dyn AuthBackend>,
    pipeline: Arc<HttpPipeline>,
    safety_margin: Duration,
}

impl TokenManager {
    pub fn new(
        backend: Arc<dyn AuthBackend>,
        pipeline: Arc<HttpPipeline>,
        safety_margin: Duration,
    ) -> Self {
        Self {
            backend,
            pipeline,
            safety_margin,
        }
    }

    pub fn safety_margin(&self) -> Duration {
        self.safety_margin
    }

    /// Time until the token should be refreshed: `max(0, exp - now - margin)`.
    /// An undecodable token is due immediately.
    pub fn compute_refresh_delay(&self, access_token: &str) -> Duration {
        self.refresh_delay_at(access_token, Utc::now())
    }

    fn refresh_delay_at(&self, access_token: &str, now: DateTime<Utc>) -> Duration {
        let expiry = match decode_expiry(access_token) {
            Ok(expiry) => expiry,
            Err(e) => {
                warn!(error = %e, "Treating access token as already expired");
                return Duration::ZERO;
            }
        };
        let remaining = (expiry - now).to_std().unwrap_or(Duration::ZERO);
        remaining.saturating_sub(self.safety_margin)
    }

    /// Exchange `refresh_token` for a fresh credential. Failures are returned as-is, never retried.
    pub async fn refresh(&self, refresh_token: &str) -> Result<Credential, AuthError> {
        debug!("Exchanging refresh token");
        let pair = self.backend.refresh(refresh_token).await?;
        Ok(pair.into())
    }

    /// Make `access_token` the bearer credential for every subsequent request.
    pub fn apply_to_request_default(&self, access_token: &str) {
        self.pipeline.set_bearer(access_token);
    }

    pub fn clear_request_default(&self) {
        self.pipeline.clear_bearer();
    }
}
