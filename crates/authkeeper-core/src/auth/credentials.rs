use std::fmt;
use std::sync::Arc;

use crate::models::TokenPair;
use crate::store::{keys, KeyValueStore, StoreError, StoreSubscription};

use super::AuthError;

/// An access/refresh token pair.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

impl From<TokenPair> for Credential {
    fn from(pair: TokenPair) -> Self {
        Self::new(pair.access_token, pair.refresh_token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Typed access to the token entries of the shared store.
///
/// Only the auth coordinator writes through this.
#[derive(Clone)]
pub struct CredentialStore {
    store: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Persist a credential. The refresh token is written before the access
    /// token so that a context reacting to the token change already sees the
    /// matching refresh token.
    pub fn store(&self, credential: &Credential) -> Result<(), StoreError> {
        self.store
            .set(keys::REFRESH_TOKEN, &credential.refresh_token)?;
        self.store.set(keys::TOKEN, &credential.access_token)?;
        Ok(())
    }

    pub fn access_token(&self) -> Result<Option<String>, StoreError> {
        self.store.get(keys::TOKEN)
    }

    pub fn refresh_token(&self) -> Result<Option<String>, StoreError> {
        self.store.get(keys::REFRESH_TOKEN)
    }

    /// The stored refresh token, `NotAuthenticated` when there is none.
    pub fn require_refresh_token(&self) -> Result<String, AuthError> {
        self.refresh_token()?.ok_or(AuthError::NotAuthenticated)
    }

    /// The stored credential, if both halves are present
    pub fn load(&self) -> Result<Option<Credential>, StoreError> {
        let access = self.access_token()?;
        let refresh = self.refresh_token()?;
        Ok(match (access, refresh) {
            (Some(access), Some(refresh)) => Some(Credential::new(access, refresh)),
            _ => None,
        })
    }

    /// Delete both tokens, access token first so other contexts tear down immediately.
    pub fn delete(&self) -> Result<(), StoreError> {
        let token = self.store.delete(keys::TOKEN);
        let refresh = self.store.delete(keys::REFRESH_TOKEN);
        token.and(refresh)
    }

    /// Check if an access token is stored
    pub fn has_credentials(&self) -> bool {
        matches!(self.access_token(), Ok(Some(_)))
    }

    pub fn subscribe(&self) -> StoreSubscription {
        self.store.subscribe()
    }
}
