//! API client for communicating with the admin REST backend.
//!
//! Only the calls that matter to authentication and session continuity live
//! here: the refresh exchange, the profile fetch, and the two session-tracked
//! endpoints (comparison submission and identity check).

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;

use crate::auth::{AuthBackend, AuthError};
use crate::models::{IdentityStatus, TokenPair, UserProfile};

use super::{ApiError, HttpPipeline};

// ============================================================================
// Constants
// ============================================================================

/// Token refresh exchange
const REFRESH_PATH: &str = "/auth/refresh";

/// Current user profile
const PROFILE_PATH: &str = "/me";

/// Comparison submission (session-tracked)
pub const COMPARISONS_PATH: &str = "/comparisons";

/// Identity check (session-tracked)
pub const IDENTITY_PATH: &str = "/identity";

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// API client for the admin backend.
/// Clone is cheap - the pipeline is shared behind an Arc.
#[derive(Clone)]
pub struct ApiClient {
    pipeline: Arc<HttpPipeline>,
    base_url: String,
}

impl ApiClient {
    pub fn new(pipeline: Arc<HttpPipeline>, base_url: &str) -> Self {
        Self {
            pipeline,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn pipeline(&self) -> &Arc<HttpPipeline> {
        &self.pipeline
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Exchange a refresh token for a new access/refresh pair. Never retried.
    pub async fn refresh_tokens(&self, refresh_token: &str) -> Result<TokenPair, ApiError> {
        self.pipeline
            .post_json(&self.url(REFRESH_PATH), &RefreshRequest { refresh_token })
            .await
    }

    /// Fetch the profile of whoever the current bearer credential belongs to
    pub async fn fetch_profile(&self) -> Result<UserProfile, ApiError> {
        self.pipeline.get_json(&self.url(PROFILE_PATH)).await
    }

    /// Submit a model comparison. Carries the session headers.
    pub async fn submit_comparison<B: Serialize + ?Sized>(
        &self,
        comparison: &B,
    ) -> Result<Value, ApiError> {
        self.pipeline
            .post_json(&self.url(COMPARISONS_PATH), comparison)
            .await
    }

    /// Ask the backend whether this device is already known. Carries the session headers.
    pub async fn check_identity(&self) -> Result<IdentityStatus, ApiError> {
        self.pipeline.get_json(&self.url(IDENTITY_PATH)).await
    }
}

impl AuthBackend for ApiClient {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<TokenPair, AuthError>> {
        Box::pin(async move {
            self.refresh_tokens(refresh_token)
                .await
                .map_err(AuthError::from_refresh)
        })
    }

    fn fetch_profile(&self) -> BoxFuture<'_, Result<UserProfile, AuthError>> {
        Box::pin(async move {
            ApiClient::fetch_profile(self)
                .await
                .map_err(AuthError::from_profile)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(base_url: &str) -> ApiClient {
        let pipeline = Arc::new(HttpPipeline::new(Duration::from_secs(5)).unwrap());
        ApiClient::new(pipeline, base_url)
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let api = client("https://admin.example.test/api/");
        assert_eq!(api.base_url(), "https://admin.example.test/api");
        assert_eq!(api.url(PROFILE_PATH), "https://admin.example.test/api/me");
    }

    #[tokio::test]
    async fn test_refresh_exchange() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .and(body_json(json!({"refresh_token": "r1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "a2",
                "refresh_token": "r2"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let pair = AuthBackend::refresh(&client(&server.uri()), "r1").await.unwrap();
        assert_eq!(pair.access_token, "a2");
        assert_eq!(pair.refresh_token, "r2");
    }

    #[tokio::test]
    async fn test_refresh_rejection_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let result = AuthBackend::refresh(&client(&server.uri()), "revoked").await;
        assert!(matches!(result, Err(AuthError::RefreshRejected(_))));
    }

    #[tokio::test]
    async fn test_refresh_server_error_is_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let result = AuthBackend::refresh(&client(&server.uri()), "r1").await;
        assert!(matches!(result, Err(AuthError::RefreshRejected(_))));
    }

    #[tokio::test]
    async fn test_refresh_unreachable_backend_is_network_error() {
        // Grab a free port and release it so nothing is listening there
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let uri = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let result = AuthBackend::refresh(&client(&uri), "r1").await;
        assert!(matches!(result, Err(AuthError::Network(_))));
    }

    #[tokio::test]
    async fn test_fetch_profile_uses_pipeline_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me"))
            .and(header("authorization", "Bearer access-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "username": "ada",
                "scopes": ["admin"]
            })))
            .mount(&server)
            .await;

        let api = client(&server.uri());
        api.pipeline().set_bearer("access-1");
        let profile = AuthBackend::fetch_profile(&api).await.unwrap();
        assert_eq!(profile.username, "ada");
        assert_eq!(profile.scopes, vec!["admin".to_string()]);
    }

    #[tokio::test]
    async fn test_fetch_profile_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let result = AuthBackend::fetch_profile(&client(&server.uri())).await;
        assert!(matches!(result, Err(AuthError::ProfileFetch(_))));
    }
}
