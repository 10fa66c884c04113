use cadence_core::EntityId;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::job::ScheduledJob;

/// Durable storage for job records.
///
/// A record is identified by `(id, occurrence_count)`: occurrences of a recurring job
/// share an id but are stored separately.
///
/// # Conditional writes
///
/// `save` is a compare-and-swap on the record's [`version`](ScheduledJob::version).
/// It succeeds only when
/// - no record exists for the key and the job is `Pending`, or
/// - the stored version equals the job's version (the caller's copy derives from the
///   latest stored state) and the stored status may legally transition to the job's
///   status ([`JobStatus::can_transition_to`](crate::types::JobStatus::can_transition_to)).
///
/// Anything else returns [`SchedulerError::Conflict`](crate::error::SchedulerError::Conflict).
/// Every successful update advances the stored version, so a copy read before another
/// worker's write can never be saved, even when its status change would be legal. This
/// is what stops two workers from running the same attempt, and a stale copy from
/// resetting the retry budget.
///
/// `save` returns the record as persisted, carrying the new version; later
/// transitions of the same job must start from that copy.
pub trait ScheduleRepository: Send + Sync {
    fn save(&self, job: &ScheduledJob) -> Result<ScheduledJob>;

    /// Latest occurrence stored under `id`.
    fn find(&self, id: &EntityId) -> Result<Option<ScheduledJob>>;

    /// Pending jobs with `run_at <= now`, highest priority first, then oldest `run_at`.
    fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledJob>>;
}
