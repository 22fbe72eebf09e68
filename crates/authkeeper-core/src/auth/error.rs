use thiserror::Error;

use crate::api::ApiError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Access token expiry could not be decoded: {0}")]
    MalformedCredential(String),

    #[error("Refresh token rejected: {0}")]
    RefreshRejected(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Response arrived after the session changed and was discarded")]
    StaleResponse,

    #[error("Profile fetch failed: {0}")]
    ProfileFetch(String),

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Credential storage failed: {0}")]
    Store(#[from] StoreError),
}

impl AuthError {
    /// Classify a failed refresh exchange. Anything but a transport failure is a rejection.
    pub fn from_refresh(err: ApiError) -> Self {
        if err.is_transport() {
            AuthError::Network(err.to_string())
        } else {
            AuthError::RefreshRejected(err.to_string())
        }
    }

    pub fn from_profile(err: ApiError) -> Self {
        if err.is_transport() {
            AuthError::Network(err.to_string())
        } else {
            AuthError::ProfileFetch(err.to_string())
        }
    }
}
