//! Authentication module for managing credentials and sessions.
//!
//! This module provides:
//! - `CredentialStore`: typed access to the stored access/refresh tokens
//! - `TokenManager`: expiry decoding, refresh timing and the refresh exchange
//! - `SessionTracker`: idle-session expiry and session headers on allow-listed paths
//! - `RefreshSchedule`: the single cancellable refresh timer
//! - `AuthCoordinator`: the login/logout state machine tying it all together
//!
//! Access tokens are refreshed ahead of their `exp` claim; sessions expire
//! after 2 hours without server-acknowledged activity.

pub mod backend;
pub mod coordinator;
pub mod credentials;
pub mod error;
pub mod schedule;
pub mod session;
pub mod token;

pub use backend::AuthBackend;
pub use coordinator::{AuthCoordinator, AuthState, CoordinatorOptions};
pub use credentials::{Credential, CredentialStore};
pub use error::AuthError;
pub use schedule::RefreshSchedule;
pub use session::{SessionData, SessionTracker, IDENTIFICATION_HEADER, SESSION_HEADER};
pub use token::{decode_expiry, TokenManager};
