use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Result, SchedulerError};
use crate::job::ScheduledJob;

/// Transport that delivers jobs to workers.
///
/// Implementations must not deliver a message before `delay_seconds` have passed,
/// either natively (delayed delivery) or by leaving the wait to a poller that only
/// dispatches due jobs.
pub trait JobQueue: Send + Sync {
    fn dispatch(&self, job: &ScheduledJob, delay_seconds: u64) -> Result<()>;
}

/// A message on the in-process channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job: ScheduledJob,
    pub delay_seconds: u64,
    /// Earliest moment the consumer should act on the job.
    pub deliver_at: DateTime<Utc>,
}

/// [`JobQueue`] over a bounded tokio mpsc channel.
///
/// `dispatch` never blocks: a full or closed channel is reported as an error and the
/// repository stays the source of truth for the job.
#[derive(Clone)]
pub struct ChannelQueue {
    tx: mpsc::Sender<QueuedJob>,
}

impl ChannelQueue {
    pub fn new(tx: mpsc::Sender<QueuedJob>) -> Self {
        Self { tx }
    }

    /// Create a queue and the receiver its messages arrive on.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<QueuedJob>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

impl JobQueue for ChannelQueue {
    fn dispatch(&self, job: &ScheduledJob, delay_seconds: u64) -> Result<()> {
        let deliver_at = i64::try_from(delay_seconds)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|delay| job.updated_at.checked_add_signed(delay))
            .unwrap_or(job.run_at);
        let message = QueuedJob {
            job: job.clone(),
            delay_seconds,
            deliver_at,
        };
        match self.tx.try_send(message) {
            Ok(()) => {
                debug!(job_id = %job.id, delay_secs = delay_seconds, "job queued");
                Ok(())
            }
            Err(e) => {
                warn!(job_id = %job.id, "delivery channel full or closed: {e}");
                Err(SchedulerError::Queue(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ScheduleDefinition;
    use cadence_core::ManualClock;
    use chrono::TimeZone;

    fn job() -> ScheduledJob {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(now);
        let def = ScheduleDefinition::new("report.build", "01HXZ34Q7N8M2K5V9P0R1S2T3W", now);
        ScheduledJob::from_definition(def, &clock).unwrap()
    }

    #[tokio::test]
    async fn dispatch_delivers_with_delay() {
        let (queue, mut rx) = ChannelQueue::channel(4);
        let job = job();
        queue.dispatch(&job, 120).unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.job.id, job.id);
        assert_eq!(msg.delay_seconds, 120);
        assert_eq!(msg.deliver_at, job.updated_at + Duration::seconds(120));
    }

    #[tokio::test]
    async fn full_channel_is_an_error() {
        let (queue, _rx) = ChannelQueue::channel(1);
        let job = job();
        queue.dispatch(&job, 0).unwrap();
        let err = queue.dispatch(&job, 0).unwrap_err();
        assert_eq!(err.code(), "QUEUE_ERROR");
    }

    #[tokio::test]
    async fn closed_channel_is_an_error() {
        let (queue, rx) = ChannelQueue::channel(1);
        drop(rx);
        assert!(queue.dispatch(&job(), 0).is_err());
    }
}
