//! authkeeper - authentication and session lifecycle for the admin console.
//!
//! Keeps a user signed in across reloads and across every open context:
//! credentials live in a shared store, access tokens are refreshed ahead of
//! expiry by a single timer, session headers ride along on the endpoints
//! that need them, and a logout anywhere is a logout everywhere.

pub mod api;
pub mod auth;
pub mod config;
pub mod models;
pub mod store;

pub use api::{ApiClient, ApiError, HttpPipeline};
pub use auth::{AuthBackend, AuthCoordinator, AuthError, AuthState, Credential, SessionTracker};
pub use config::{AuthConfig, StorageKind};
pub use models::UserProfile;
pub use store::{ContextStore, KeyValueStore, Origin};
