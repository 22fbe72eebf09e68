use std::fmt;

use serde::{Deserialize, Serialize};

/// The authenticated user. Never persisted; re-fetched after login and at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct UserProfile {
    pub username: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl UserProfile {
    /// Scopes joined for display, "none" when empty
    pub fn scopes_display(&self) -> String {
        if self.scopes.is_empty() {
            "none".to_string()
        } else {
            self.scopes.join(", ")
        }
    }
}

/// Access/refresh pair as returned by the refresh exchange.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Response of the identity-check endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityStatus {
    #[serde(default)]
    pub known: bool,
    #[serde(default, rename = "identificationId")]
    pub identification_id: Option<String>,
}
