use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use thiserror::Error;
use tokio::{sync::mpsc, task::AbortHandle};
use tracing::debug;

/// Deferred execution of monitoring cycles, keyed by record id.
///
/// A record has at most one pending cycle. Scheduling it again replaces the
/// pending one, so restarts never fork a second monitoring chain.
pub trait Scheduler: Send + Sync {
    fn schedule_after(&self, delay: Duration, record_id: &str) -> Result<(), SchedulerError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("scheduler dispatcher has shut down")]
    Closed,
}

#[derive(Default)]
struct PendingTimers {
    next_generation: u64,
    by_record: HashMap<String, (u64, AbortHandle)>,
}

/// Sleeps on a spawned task, then hands the record id to the dispatcher.
#[derive(Clone)]
pub struct TokioScheduler {
    tx: mpsc::UnboundedSender<String>,
    pending: Arc<Mutex<PendingTimers>>,
}

impl TokioScheduler {
    /// Returns the scheduler and the receiving end the dispatcher drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                pending: Arc::new(Mutex::new(PendingTimers::default())),
            },
            rx,
        )
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_record
            .len()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_after(&self, delay: Duration, record_id: &str) -> Result<(), SchedulerError> {
        if self.tx.is_closed() {
            return Err(SchedulerError::Closed);
        }

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.next_generation += 1;
        let generation = pending.next_generation;

        let tx = self.tx.clone();
        let timers = self.pending.clone();
        let fired_id = record_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut timers = timers.lock().unwrap_or_else(PoisonError::into_inner);
                match timers.by_record.get(&fired_id) {
                    Some((current, _)) if *current == generation => {
                        timers.by_record.remove(&fired_id);
                    }
                    _ => return,
                }
            }
            if tx.send(fired_id).is_err() {
                debug!(stage = "monitor", "dispatcher gone, dropping scheduled cycle");
            }
        });

        let replaced = pending
            .by_record
            .insert(record_id.to_string(), (generation, timer.abort_handle()));
        if let Some((_, previous)) = replaced {
            previous.abort();
            debug!(stage = "monitor", %record_id, "pending cycle superseded");
        }
        debug!(stage = "monitor", %record_id, delay_secs = delay.as_secs(), "cycle scheduled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn delivers_record_id_after_delay() {
        let (scheduler, mut rx) = TokioScheduler::new();
        scheduler
            .schedule_after(Duration::from_secs(300), "rec-1")
            .unwrap();

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.recv().await.as_deref(), Some("rec-1"));
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_pending_cycle() {
        let (scheduler, mut rx) = TokioScheduler::new();
        scheduler
            .schedule_after(Duration::from_secs(60), "rec-1")
            .unwrap();
        scheduler
            .schedule_after(Duration::from_secs(120), "rec-1")
            .unwrap();
        scheduler
            .schedule_after(Duration::from_secs(60), "rec-2")
            .unwrap();
        assert_eq!(scheduler.pending_count(), 2);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(rx.recv().await.as_deref(), Some("rec-2"));
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(rx.recv().await.as_deref(), Some("rec-1"));

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_dispatcher_is_reported() {
        let (scheduler, rx) = TokioScheduler::new();
        drop(rx);
        assert_eq!(
            scheduler.schedule_after(Duration::from_secs(1), "rec-1"),
            Err(SchedulerError::Closed)
        );
    }
}
