use futures::future::BoxFuture;

use crate::models::{TokenPair, UserProfile};

use super::AuthError;

/// The two backend calls the auth layer depends on.
///
/// `ApiClient` is the production implementation; the seam exists so the
/// coordinator can be driven by any transport.
pub trait AuthBackend: Send + Sync {
    /// Exchange a refresh token for a new pair. Implementations must not retry.
    fn refresh<'a>(&'a self, refresh_token: &'a str)
        -> BoxFuture<'a, Result<TokenPair, AuthError>>;

    /// Fetch the profile of the holder of the currently applied bearer credential.
    fn fetch_profile(&self) -> BoxFuture<'_, Result<UserProfile, AuthError>>;
}
