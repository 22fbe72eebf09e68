//! Data models exchanged with the backend.
//!
//! - `UserProfile`: the authenticated user as reported by `GET /me`
//! - `TokenPair`: the access/refresh pair issued by `POST /auth/refresh`

pub mod profile;

pub use profile::{IdentityStatus, TokenPair, UserProfile};
