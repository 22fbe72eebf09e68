use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

struct PendingRefresh {
    generation: u64,
    due_at: Instant,
    task: JoinHandle<()>,
}

/// Owner of the single pending refresh timer.
///
/// `replace` always aborts the previous timer before spawning the next one.
/// Each timer carries a generation number; when it fires it must call
/// `take_fired` with that number, which fails if the timer was superseded.
#[derive(Default)]
pub struct RefreshSchedule {
    pending: Option<PendingRefresh>,
    generation: u64,
}

impl RefreshSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel any pending timer and schedule `make(generation)` to run after `delay`.
    pub fn replace<F, Fut>(&mut self, delay: Duration, make: F) -> u64
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        self.generation += 1;
        let generation = self.generation;
        let fire = make(generation);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire.await;
        });
        trace!(generation, delay_ms = delay.as_millis() as u64, "Refresh scheduled");
        self.pending = Some(PendingRefresh {
            generation,
            due_at: Instant::now() + delay,
            task,
        });
        generation
    }

    /// Abort the pending timer, if any. Returns whether one was pending.
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(pending) => {
                pending.task.abort();
                trace!(generation = pending.generation, "Refresh cancelled");
                true
            }
            None => false,
        }
    }

    /// Claim a fired timer. Detaches it (the running task is not aborted) and
    /// returns false if `generation` is no longer the pending one.
    pub fn take_fired(&mut self, generation: u64) -> bool {
        match &self.pending {
            Some(pending) if pending.generation == generation => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Time left until the pending refresh fires
    pub fn due_in(&self) -> Option<Duration> {
        self.pending
            .as_ref()
            .map(|p| p.due_at.saturating_duration_since(Instant::now()))
    }
}

impl Drop for RefreshSchedule {
    fn drop(&mut self) {
        self.cancel();
    }
}
