//! Persistent key-value storage shared between execution contexts.
//!
//! This module provides:
//! - `KeyValueStore`: the synchronous get/set/delete interface the auth layer is written against
//! - `Origin`: one shared storage medium plus its change-notification channel
//! - `ContextStore`: a per-context handle onto an `Origin` (one per "tab")
//! - Backends: in-memory, JSON file on disk, and OS keychain via keyring
//!
//! A write made through one context is delivered as a `StoreChange` to every
//! other context of the same origin, never back to the writer. Writes made by
//! another process sharing the same file or keychain are picked up by
//! `Origin::spawn_external_watch` and delivered to every context.

pub mod backend;
pub mod keychain;
pub mod origin;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

pub use backend::{FileBackend, MemoryBackend, StorageBackend};
pub use keychain::KeyringBackend;
pub use origin::{ContextStore, Origin};

/// Logical key names of the persisted entries.
pub mod keys {
    pub const TOKEN: &str = "token";
    pub const REFRESH_TOKEN: &str = "refresh-token";
    pub const SESSION_ID: &str = "session-id";
    pub const SESSION_TIMESTAMP: &str = "session-timestamp";
    pub const IDENTIFICATION_ID: &str = "identification-id";

    pub const ALL: [&str; 5] = [
        TOKEN,
        REFRESH_TOKEN,
        SESSION_ID,
        SESSION_TIMESTAMP,
        IDENTIFICATION_ID,
    ];
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage document is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Keychain error: {0}")]
    Keyring(#[from] ::keyring::Error),
}

/// A mutation observed on a key, as seen by the other contexts of an origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub key: String,
    /// `None` when the key was deleted.
    pub new_value: Option<String>,
}

/// Identifies which context produced a change.
pub(crate) type ContextId = u64;

#[derive(Debug, Clone)]
pub(crate) struct Envelope {
    pub source: ContextId,
    pub change: StoreChange,
}

/// Synchronous key-value store with a subscription to external mutations.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Subscribe to mutations made by *other* contexts.
    fn subscribe(&self) -> StoreSubscription;
}

/// Receiving end of a context's change notifications.
pub struct StoreSubscription {
    receiver: broadcast::Receiver<Envelope>,
    own: ContextId,
}

impl StoreSubscription {
    pub(crate) fn new(receiver: broadcast::Receiver<Envelope>, own: ContextId) -> Self {
        Self { receiver, own }
    }

    /// Wait for the next external change. Returns `None` once the origin is gone.
    pub async fn recv(&mut self) -> Option<StoreChange> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) if envelope.source == self.own => continue,
                Ok(envelope) => return Some(envelope.change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Store change listener lagged, some notifications were dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of `recv`.
    #[cfg(test)]
    pub(crate) fn try_recv(&mut self) -> Option<StoreChange> {
        loop {
            match self.receiver.try_recv() {
                Ok(envelope) if envelope.source == self.own => continue,
                Ok(envelope) => return Some(envelope.change),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Store change listener lagged, some notifications were dropped");
                }
                Err(_) => return None,
            }
        }
    }
}
