//! Request/response middleware around the shared HTTP client.
//!
//! Every request goes through the same ordered steps:
//! 1. the default bearer credential is attached (unless the request already carries one)
//! 2. request interceptors run in installation order
//! 3. the request is executed
//! 4. response interceptors run in installation order
//!
//! Installing an interceptor returns an `InterceptorHandle`; passing it to
//! `uninstall` removes exactly that interceptor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Request, Response, StatusCode, Url};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::ApiError;

/// Maximum number of retries for rate-limited (429) GET requests.
/// 3 retries with exponential backoff usually succeeds without excessive delay.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Mutates an outgoing request before it is sent.
pub trait RequestInterceptor: Send + Sync {
    fn on_request(&self, request: &mut Request);
}

/// What a response interceptor gets to see of a response.
#[derive(Debug)]
pub struct ResponseMeta<'a> {
    pub url: &'a Url,
    pub status: StatusCode,
    pub headers: &'a HeaderMap,
}

/// Observes a response before it is returned to the caller.
pub trait ResponseInterceptor: Send + Sync {
    fn on_response(&self, response: &ResponseMeta<'_>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterceptorHandle(u64);

pub struct HttpPipeline {
    client: Client,
    bearer: RwLock<Option<String>>,
    request_interceptors: RwLock<Vec<(InterceptorHandle, Arc<dyn RequestInterceptor>)>>,
    response_interceptors: RwLock<Vec<(InterceptorHandle, Arc<dyn ResponseInterceptor>)>>,
    next_handle: AtomicU64,
}

impl HttpPipeline {
    pub fn new(timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client))
    }

    /// Build a pipeline around an existing client, sharing its connection pool.
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            bearer: RwLock::new(None),
            request_interceptors: RwLock::new(Vec::new()),
            response_interceptors: RwLock::new(Vec::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Replace the bearer credential attached to every subsequent request.
    pub fn set_bearer(&self, token: &str) {
        let mut bearer = self.bearer.write().unwrap_or_else(PoisonError::into_inner);
        *bearer = Some(token.to_string());
    }

    pub fn clear_bearer(&self) {
        let mut bearer = self.bearer.write().unwrap_or_else(PoisonError::into_inner);
        *bearer = None;
    }

    pub fn bearer(&self) -> Option<String> {
        self.bearer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn next_handle(&self) -> InterceptorHandle {
        InterceptorHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    pub fn install_request_interceptor(
        &self,
        interceptor: Arc<dyn RequestInterceptor>,
    ) -> InterceptorHandle {
        let handle = self.next_handle();
        self.request_interceptors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((handle, interceptor));
        handle
    }

    pub fn install_response_interceptor(
        &self,
        interceptor: Arc<dyn ResponseInterceptor>,
    ) -> InterceptorHandle {
        let handle = self.next_handle();
        self.response_interceptors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((handle, interceptor));
        handle
    }

    /// Remove a previously installed interceptor. Returns false if the handle was unknown.
    pub fn uninstall(&self, handle: InterceptorHandle) -> bool {
        let mut requests = self
            .request_interceptors
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = requests.len();
        requests.retain(|(h, _)| *h != handle);
        if requests.len() != before {
            return true;
        }
        drop(requests);

        let mut responses = self
            .response_interceptors
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = responses.len();
        responses.retain(|(h, _)| *h != handle);
        responses.len() != before
    }

    /// Number of installed interceptors, request and response combined
    pub fn interceptor_count(&self) -> usize {
        let requests = self
            .request_interceptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        let responses = self
            .response_interceptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        requests + responses
    }

    fn prepare(&self, request: &mut Request) {
        if !request.headers().contains_key(AUTHORIZATION) {
            if let Some(token) = self.bearer() {
                match HeaderValue::from_str(&format!("Bearer {}", token)) {
                    Ok(mut value) => {
                        value.set_sensitive(true);
                        request.headers_mut().insert(AUTHORIZATION, value);
                    }
                    Err(_) => warn!("Bearer token is not a valid header value, sending without it"),
                }
            }
        }

        // Snapshot so no lock is held while interceptors run
        let interceptors: Vec<Arc<dyn RequestInterceptor>> = self
            .request_interceptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, i)| Arc::clone(i))
            .collect();
        for interceptor in interceptors {
            interceptor.on_request(request);
        }
    }

    fn observe(&self, response: &Response) {
        let meta = ResponseMeta {
            url: response.url(),
            status: response.status(),
            headers: response.headers(),
        };
        let interceptors: Vec<Arc<dyn ResponseInterceptor>> = self
            .response_interceptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, i)| Arc::clone(i))
            .collect();
        for interceptor in interceptors {
            interceptor.on_response(&meta);
        }
    }

    /// Run a request through the pipeline without interpreting the status code.
    pub async fn execute(&self, mut request: Request) -> Result<Response, ApiError> {
        self.prepare(&mut request);
        debug!(method = %request.method(), path = request.url().path(), "Sending request");
        let response = self.client.execute(request).await?;
        self.observe(&response);
        Ok(response)
    }

    /// Run a request through the pipeline, turning non-success statuses into errors.
    pub async fn send(&self, request: Request) -> Result<Response, ApiError> {
        let response = self.execute(request).await?;
        Self::check_response(response).await
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn parse_json<T: DeserializeOwned>(response: Response, url: &str) -> Result<T, ApiError> {
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to parse JSON response from {}: {}", url, e))
        })
    }

    /// GET and decode JSON, backing off and retrying on 429.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, ApiError> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let request = self.client.get(url).build()?;
            let response = self.execute(request).await?;

            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                let response = Self::check_response(response).await?;
                return Self::parse_json(response, url).await;
            }

            retries += 1;
            if retries > MAX_RATE_LIMIT_RETRIES {
                return Err(ApiError::RateLimited);
            }
            warn!(url = url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms *= 2; // Exponential backoff
        }
    }

    /// POST a JSON body and decode the JSON answer. Never retried.
    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let request = self.client.post(url).json(body).build()?;
        let response = self.send(request).await?;
        Self::parse_json(response, url).await
    }
}
