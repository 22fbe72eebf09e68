//! REST API client module for the admin backend.
//!
//! This module provides the `HttpPipeline` every outgoing request flows
//! through, and the `ApiClient` with the typed calls the auth layer and the
//! session-tracked endpoints need.
//!
//! The API uses JWT bearer token authentication; the token attached to
//! requests is whatever the auth coordinator last applied to the pipeline.

pub mod client;
pub mod error;
pub mod pipeline;

pub use client::ApiClient;
pub use error::ApiError;
pub use pipeline::{
    HttpPipeline, InterceptorHandle, RequestInterceptor, ResponseInterceptor, ResponseMeta,
};
