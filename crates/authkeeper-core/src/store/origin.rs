use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use super::{
    keys, ContextId, Envelope, KeyValueStore, MemoryBackend, StorageBackend, StoreChange,
    StoreError, StoreSubscription,
};

/// Capacity of the change channel. A listener that falls further behind
/// than this skips notifications rather than blocking writers.
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Source of changes made outside this process. Contexts are numbered from 1.
const EXTERNAL: ContextId = 0;

/// A storage medium shared by every context of one origin.
pub struct Origin {
    backend: Box<dyn StorageBackend>,
    changes: broadcast::Sender<Envelope>,
    next_context: AtomicU64,
    /// Last value this process wrote or observed for each key
    seen: Mutex<HashMap<String, Option<String>>>,
}

impl Origin {
    pub fn new(backend: impl StorageBackend + 'static) -> Arc<Self> {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Arc::new(Self {
            backend: Box::new(backend),
            changes,
            next_context: AtomicU64::new(1),
            seen: Mutex::new(HashMap::new()),
        })
    }

    pub fn in_memory() -> Arc<Self> {
        Self::new(MemoryBackend::new())
    }

    /// Open a new context (the analogue of a browser tab) onto this origin.
    pub fn open_context(self: &Arc<Self>) -> ContextStore {
        let id = self.next_context.fetch_add(1, Ordering::Relaxed);
        ContextStore {
            origin: Arc::clone(self),
            id,
        }
    }

    fn seen(&self) -> MutexGuard<'_, HashMap<String, Option<String>>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Compare the backend with what this process last saw and publish every
    /// difference as an external change. Returns the number of changed keys.
    ///
    /// The first poll of a key only records its value.
    pub fn poll_external(&self) -> usize {
        let mut seen = self.seen();
        let mut changed = 0;
        for key in keys::ALL {
            let current = match self.backend.load(key) {
                Ok(current) => current,
                Err(e) => {
                    warn!(key, error = %e, "Failed to poll storage");
                    continue;
                }
            };
            match seen.get(key) {
                Some(previous) if *previous == current => {}
                Some(_) => {
                    self.publish(EXTERNAL, key, current.as_deref());
                    seen.insert(key.to_string(), current);
                    changed += 1;
                }
                None => {
                    seen.insert(key.to_string(), current);
                }
            }
        }
        changed
    }

    /// Poll for writes made by other processes every `interval` until the
    /// origin is dropped.
    pub fn spawn_external_watch(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        self.poll_external();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(origin) = weak.upgrade() else {
                    break;
                };
                let changed = origin.poll_external();
                if changed > 0 {
                    debug!(changed, "Picked up storage changes from another process");
                }
            }
            trace!("External storage watch stopped");
        })
    }

    fn publish(&self, source: ContextId, key: &str, new_value: Option<&str>) {
        let envelope = Envelope {
            source,
            change: StoreChange {
                key: key.to_string(),
                new_value: new_value.map(str::to_string),
            },
        };
        // No subscribers is fine, nobody is listening yet
        if self.changes.send(envelope).is_err() {
            trace!(key, "Store change published with no listeners");
        }
    }
}

/// One context's handle onto a shared `Origin`.
#[derive(Clone)]
pub struct ContextStore {
    origin: Arc<Origin>,
    id: ContextId,
}

impl ContextStore {
    pub fn origin(&self) -> &Arc<Origin> {
        &self.origin
    }
}

impl KeyValueStore for ContextStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.origin.backend.load(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut seen = self.origin.seen();
        let previous = self.origin.backend.load(key)?;
        self.origin.backend.save(key, value)?;
        seen.insert(key.to_string(), Some(value.to_string()));
        // Like browser storage events, rewriting the same value is not a change
        if previous.as_deref() != Some(value) {
            self.origin.publish(self.id, key, Some(value));
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut seen = self.origin.seen();
        let previous = self.origin.backend.load(key)?;
        self.origin.backend.remove(key)?;
        seen.insert(key.to_string(), None);
        if previous.is_some() {
            self.origin.publish(self.id, key, None);
        }
        Ok(())
    }

    fn subscribe(&self) -> StoreSubscription {
        StoreSubscription::new(self.origin.changes.subscribe(), self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileBackend;

    #[test]
    fn test_contexts_share_values() {
        let origin = Origin::in_memory();
        let a = origin.open_context();
        let b = origin.open_context();

        a.set("token", "t1").unwrap();
        assert_eq!(b.get("token").unwrap().as_deref(), Some("t1"));

        b.delete("token").unwrap();
        assert_eq!(a.get("token").unwrap(), None);
    }

    #[test]
    fn test_changes_are_not_echoed_to_writer() {
        let origin = Origin::in_memory();
        let a = origin.open_context();
        let b = origin.open_context();
        let mut a_changes = a.subscribe();
        let mut b_changes = b.subscribe();

        a.set("token", "t1").unwrap();

        assert_eq!(a_changes.try_recv(), None);
        assert_eq!(
            b_changes.try_recv(),
            Some(StoreChange {
                key: "token".to_string(),
                new_value: Some("t1".to_string()),
            })
        );
    }

    #[test]
    fn test_unchanged_writes_and_missing_deletes_are_silent() {
        let origin = Origin::in_memory();
        let a = origin.open_context();
        let b = origin.open_context();
        a.set("token", "t1").unwrap();

        let mut b_changes = b.subscribe();
        a.set("token", "t1").unwrap();
        a.delete("session-id").unwrap();
        assert_eq!(b_changes.try_recv(), None);

        a.delete("token").unwrap();
        assert_eq!(
            b_changes.try_recv(),
            Some(StoreChange {
                key: "token".to_string(),
                new_value: None,
            })
        );
    }

    #[test]
    fn test_poll_picks_up_other_process_writes() {
        let dir = tempfile::tempdir().unwrap();
        let here = Origin::new(FileBackend::in_dir(dir.path()));
        let elsewhere = Origin::new(FileBackend::in_dir(dir.path()));
        let local = here.open_context();
        let mut changes = local.subscribe();
        assert_eq!(here.poll_external(), 0);

        elsewhere.open_context().set("token", "t1").unwrap();
        assert_eq!(here.poll_external(), 1);
        assert_eq!(
            changes.try_recv(),
            Some(StoreChange {
                key: "token".to_string(),
                new_value: Some("t1".to_string()),
            })
        );
        assert_eq!(here.poll_external(), 0);

        elsewhere.open_context().delete("token").unwrap();
        here.poll_external();
        assert_eq!(changes.try_recv().map(|c| c.new_value), Some(None));
    }

    #[test]
    fn test_poll_ignores_writes_from_this_process() {
        let dir = tempfile::tempdir().unwrap();
        let origin = Origin::new(FileBackend::in_dir(dir.path()));
        origin.poll_external();
        let writer = origin.open_context();
        let mut changes = writer.subscribe();

        writer.set("token", "t1").unwrap();
        writer.delete("session-id").unwrap();
        assert_eq!(origin.poll_external(), 0);
        assert_eq!(changes.try_recv(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_watch_polls_on_interval() {
        let dir = tempfile::tempdir().unwrap();
        let here = Origin::new(FileBackend::in_dir(dir.path()));
        let elsewhere = Origin::new(FileBackend::in_dir(dir.path()));
        let mut changes = here.open_context().subscribe();
        let watch = here.spawn_external_watch(Duration::from_secs(2));

        elsewhere.open_context().set("token", "t1").unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        let change = changes.recv().await.unwrap();
        assert_eq!(change.new_value.as_deref(), Some("t1"));

        drop(here);
        tokio::time::advance(Duration::from_secs(3)).await;
        watch.await.unwrap();
    }

    #[tokio::test]
    async fn test_subscription_ends_when_origin_dropped() {
        let origin = Origin::in_memory();
        let a = origin.open_context();
        let mut changes = a.subscribe();
        drop(a);
        drop(origin);
        assert_eq!(changes.recv().await, None);
    }
}
