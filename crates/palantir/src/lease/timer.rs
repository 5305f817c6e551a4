//! One timer task services every lease deadline in a pool.

use std::collections::HashMap;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::time::{DelayQueue, delay_queue};

use super::MAX_LEASE;
use crate::resource::{LeaseId, ResourceId};

/// A deadline that came due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expiry {
    pub lease: LeaseId,
    pub resource: ResourceId,
}

enum TimerCommand {
    Schedule { expiry: Expiry, deadline: Instant },
    Cancel(LeaseId),
    Shutdown,
}

/// Handle to the timer task. The task exits on `shutdown()` or when the handle drops.
pub struct LeaseTimer {
    tx: mpsc::UnboundedSender<TimerCommand>,
}

impl LeaseTimer {
    pub fn spawn<F>(runtime: &tokio::runtime::Handle, on_expire: F) -> Self
    where
        F: Fn(Expiry) + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(run(rx, on_expire));
        Self { tx }
    }

    pub fn schedule(&self, expiry: Expiry, deadline: Instant) {
        if self
            .tx
            .send(TimerCommand::Schedule { expiry, deadline })
            .is_err()
        {
            tracing::debug!(lease = %expiry.lease, "Lease timer stopped, expiry not scheduled");
        }
    }

    /// Cancelling a lease that already fired, or was never scheduled, is a no-op.
    pub fn cancel(&self, lease: LeaseId) {
        let _ = self.tx.send(TimerCommand::Cancel(lease));
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(TimerCommand::Shutdown);
    }
}

async fn run<F>(mut rx: mpsc::UnboundedReceiver<TimerCommand>, on_expire: F)
where
    F: Fn(Expiry),
{
    let mut queue: DelayQueue<Expiry> = DelayQueue::new();
    let mut keys: HashMap<LeaseId, delay_queue::Key> = HashMap::new();

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(TimerCommand::Schedule { expiry, deadline }) => {
                    // The wheel panics on deadlines it cannot hold.
                    if deadline.saturating_duration_since(Instant::now()) > MAX_LEASE {
                        tracing::warn!(lease = %expiry.lease, "Deadline beyond the maximum lease, not scheduled");
                    } else {
                        // An idle wheel's clock lags behind; measure its range from now.
                        if queue.is_empty() {
                            queue = DelayQueue::new();
                            keys.clear();
                        }
                        let key = queue.insert_at(expiry, deadline);
                        keys.insert(expiry.lease, key);
                    }
                }
                Some(TimerCommand::Cancel(lease)) => {
                    if let Some(key) = keys.remove(&lease) {
                        queue.try_remove(&key);
                    }
                }
                Some(TimerCommand::Shutdown) | None => break,
            },
            Some(expired) = queue.next(), if !queue.is_empty() => {
                let expiry = expired.into_inner();
                keys.remove(&expiry.lease);
                on_expire(expiry);
            }
        }
    }

    tracing::debug!(pending = keys.len(), "Lease timer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spawn_timer() -> (LeaseTimer, mpsc::UnboundedReceiver<Expiry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let timer = LeaseTimer::spawn(&tokio::runtime::Handle::current(), move |expiry| {
            let _ = tx.send(expiry);
        });
        (timer, rx)
    }

    fn expiry(n: u64) -> Expiry {
        Expiry {
            lease: LeaseId::new(n),
            resource: ResourceId::new(n as u32),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_in_deadline_order() {
        let (timer, mut fired) = spawn_timer();
        let now = Instant::now();

        timer.schedule(expiry(2), now + Duration::from_millis(80));
        timer.schedule(expiry(1), now + Duration::from_millis(30));

        assert_eq!(fired.recv().await, Some(expiry(1)));
        assert_eq!(fired.recv().await, Some(expiry(2)));
        assert!(Instant::now() >= now + Duration::from_millis(80));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_deadline_never_fires() {
        let (timer, mut fired) = spawn_timer();
        let now = Instant::now();

        timer.schedule(expiry(1), now + Duration::from_millis(30));
        timer.cancel(LeaseId::new(1));
        timer.cancel(LeaseId::new(1));

        let result = tokio::time::timeout(Duration::from_millis(200), fired.recv()).await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn unschedulable_deadline_leaves_timer_running() {
        let (timer, mut fired) = spawn_timer();
        let now = Instant::now();

        timer.schedule(expiry(1), now + Duration::from_secs(3 * 365 * 24 * 60 * 60));
        timer.schedule(expiry(2), now + Duration::from_millis(50));

        assert_eq!(fired.recv().await, Some(expiry(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drops_pending_deadlines() {
        let (timer, mut fired) = spawn_timer();
        timer.schedule(expiry(1), Instant::now() + Duration::from_millis(30));
        timer.shutdown();

        // The callback (and its sender) is dropped with the task.
        assert_eq!(fired.recv().await, None);
    }
}
