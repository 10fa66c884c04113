use cadence_core::{Clock, EntityId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};
use crate::types::{JobResult, JobStatus, Metadata, Payload, ScheduleDefinition, ScheduleRecurrence};

/// How far past `run_at` a due job must be before it counts as overdue.
pub const OVERDUE_GRACE_MINUTES: i64 = 5;

/// One job instance.
///
/// Never mutated in place: every transition consumes the record and returns a new one,
/// so a value observed by one component cannot change under it. Fields are read
/// through accessors; the only way to a different state is a `with_*` transition.
///
/// ```compile_fail
/// # use cadence_scheduler::{JobStatus, ScheduledJob};
/// fn force_complete(mut job: ScheduledJob) -> ScheduledJob {
///     job.status = JobStatus::Completed;
///     job
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub(crate) id: EntityId,
    pub(crate) job_type: String,
    pub(crate) target_id: EntityId,
    pub(crate) run_at: DateTime<Utc>,
    pub(crate) status: JobStatus,
    pub(crate) payload: Payload,
    pub(crate) recurrence: Option<ScheduleRecurrence>,
    pub(crate) max_retries: u32,
    pub(crate) retry_count: u32,
    pub(crate) priority: i32,
    pub(crate) occurrence_count: u32,
    pub(crate) last_result: Option<JobResult>,
    pub(crate) metadata: Metadata,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
    #[serde(default)]
    pub(crate) version: u32,
}

impl ScheduledJob {
    /// Build the first instance of a schedule. Fails if the definition is invalid.
    pub fn from_definition(definition: ScheduleDefinition, clock: &dyn Clock) -> Result<Self> {
        let (target_id, max_retries) = definition.validate()?;
        let now = clock.now();
        Ok(Self {
            id: EntityId::new(),
            job_type: definition.job_type,
            target_id,
            run_at: definition.run_at,
            status: JobStatus::Pending,
            payload: definition.payload,
            recurrence: definition.recurrence,
            max_retries,
            retry_count: 0,
            priority: definition.priority,
            occurrence_count: 0,
            last_result: None,
            metadata: definition.metadata,
            created_at: now,
            updated_at: now,
            version: 0,
        })
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    /// Selects the handler family.
    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    /// Domain entity the job acts on.
    pub fn target_id(&self) -> &EntityId {
        &self.target_id
    }

    pub fn run_at(&self) -> DateTime<Utc> {
        self.run_at
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn recurrence(&self) -> Option<&ScheduleRecurrence> {
        self.recurrence.as_ref()
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Dispatch ordering hint; higher runs first.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Completed repetitions of a recurring job.
    pub fn occurrence_count(&self) -> u32 {
        self.occurrence_count
    }

    pub fn last_result(&self) -> Option<&JobResult> {
        self.last_result.as_ref()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Revision of the stored record this copy was read from or written as.
    ///
    /// Transitions keep it unchanged; only a repository write advances it. A save
    /// whose version no longer matches the stored one was computed from a stale read.
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn can_execute(&self) -> bool {
        self.status == JobStatus::Pending
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_recurring(&self) -> bool {
        self.recurrence.as_ref().is_some_and(|r| r.is_repeating())
    }

    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn is_due(&self, clock: &dyn Clock) -> bool {
        self.can_execute() && clock.now() >= self.run_at
    }

    /// Due, and by more than [`OVERDUE_GRACE_MINUTES`].
    pub fn is_overdue(&self, clock: &dyn Clock) -> bool {
        self.can_execute() && clock.now() > self.run_at + Duration::minutes(OVERDUE_GRACE_MINUTES)
    }

    /// Not yet due, but due within the next `window_minutes`.
    pub fn is_nearing_expiry(&self, clock: &dyn Clock, window_minutes: i64) -> bool {
        let now = clock.now();
        self.can_execute() && now < self.run_at && now >= self.run_at - Duration::minutes(window_minutes)
    }

    /// Move to `status`, enforcing the state machine.
    pub fn with_status(self, status: JobStatus, now: DateTime<Utc>) -> Result<Self> {
        if !self.status.can_transition_to(status) {
            return Err(SchedulerError::InvalidTransition {
                id: self.id.to_string(),
                from: self.status,
                to: status,
            });
        }
        Ok(Self {
            status,
            updated_at: now,
            ..self
        })
    }

    /// Consume one unit of retry budget. Fails if the budget is already spent.
    pub fn with_incremented_retry(self, now: DateTime<Utc>) -> Result<Self> {
        if !self.has_retries_left() {
            return Err(SchedulerError::InvalidState {
                id: self.id.to_string(),
                status: self.status,
                action: "consume a retry beyond max_retries",
            });
        }
        Ok(Self {
            retry_count: self.retry_count + 1,
            updated_at: now,
            ..self
        })
    }

    pub fn with_run_at(self, run_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            run_at,
            updated_at: now,
            ..self
        }
    }

    pub fn with_result(self, result: JobResult, now: DateTime<Utc>) -> Self {
        Self {
            last_result: Some(result),
            updated_at: now,
            ..self
        }
    }

    /// The next occurrence of a completed recurring job.
    ///
    /// Keeps the id, advances `occurrence_count` and `run_at`, and starts over with a
    /// fresh retry budget and no previous result.
    pub fn for_next_occurrence(&self, run_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<Self> {
        if self.status != JobStatus::Completed {
            return Err(SchedulerError::InvalidState {
                id: self.id.to_string(),
                status: self.status,
                action: "produce a next occurrence",
            });
        }
        if !self.is_recurring() {
            return Err(SchedulerError::InvalidState {
                id: self.id.to_string(),
                status: self.status,
                action: "produce a next occurrence of a one-shot job",
            });
        }
        Ok(Self {
            status: JobStatus::Pending,
            run_at,
            retry_count: 0,
            occurrence_count: self.occurrence_count + 1,
            last_result: None,
            created_at: now,
            updated_at: now,
            version: 0,
            ..self.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RecurrenceType;
    use cadence_core::ManualClock;
    use chrono::TimeZone;

    const TARGET: &str = "01HXZ34Q7N8M2K5V9P0R1S2T3W";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn job_at(run_at: DateTime<Utc>, clock: &ManualClock) -> ScheduledJob {
        let def = ScheduleDefinition::new("ledger.close", TARGET, run_at).max_retries(2);
        ScheduledJob::from_definition(def, clock).unwrap()
    }

    #[test]
    fn creation_starts_pending_and_fresh() {
        let clock = ManualClock::new(t0());
        let job = job_at(t0(), &clock);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.occurrence_count, 0);
        assert!(job.last_result.is_none());
        assert_eq!(job.id.as_str().len(), 26);
        assert_eq!(job.created_at, t0());
    }

    #[test]
    fn invalid_definition_is_rejected() {
        let clock = ManualClock::new(t0());
        let def = ScheduleDefinition::new("ledger.close", "not-an-id", t0());
        assert!(ScheduledJob::from_definition(def, &clock).is_err());
    }

    #[test]
    fn due_flips_exactly_at_run_at() {
        let run_at = t0() + Duration::hours(1);
        let clock = ManualClock::new(t0());
        let job = job_at(run_at, &clock);

        for offset in [-3600, -60, -1] {
            clock.set(run_at + Duration::seconds(offset));
            assert!(!job.is_due(&clock), "due {offset}s early");
        }
        for offset in [0, 1, 86_400] {
            clock.set(run_at + Duration::seconds(offset));
            assert!(job.is_due(&clock), "not due {offset}s late");
        }
    }

    #[test]
    fn running_job_is_never_due() {
        let clock = ManualClock::new(t0());
        let job = job_at(t0(), &clock)
            .with_status(JobStatus::Running, t0())
            .unwrap();
        assert!(!job.is_due(&clock));
        assert!(!job.can_execute());
    }

    #[test]
    fn overdue_after_grace_window() {
        let clock = ManualClock::new(t0());
        let job = job_at(t0(), &clock);

        clock.set(t0() + Duration::minutes(OVERDUE_GRACE_MINUTES));
        assert!(job.is_due(&clock));
        assert!(!job.is_overdue(&clock));

        clock.advance(Duration::seconds(1));
        assert!(job.is_overdue(&clock));
    }

    #[test]
    fn nearing_expiry_window() {
        let run_at = t0() + Duration::minutes(30);
        let clock = ManualClock::new(t0());
        let job = job_at(run_at, &clock);

        assert!(!job.is_nearing_expiry(&clock, 10));
        clock.set(run_at - Duration::minutes(10));
        assert!(job.is_nearing_expiry(&clock, 10));
        clock.set(run_at);
        assert!(!job.is_nearing_expiry(&clock, 10));
    }

    #[test]
    fn transitions_produce_new_records() {
        let clock = ManualClock::new(t0());
        let pending = job_at(t0(), &clock);
        let later = t0() + Duration::seconds(5);

        let running = pending.clone().with_status(JobStatus::Running, later).unwrap();
        assert_eq!(pending.status, JobStatus::Pending);
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(running.updated_at, later);
        assert_eq!(running.id, pending.id);
        assert_eq!(running.version(), pending.version());
    }

    #[test]
    fn illegal_transitions_are_errors() {
        let clock = ManualClock::new(t0());
        let pending = job_at(t0(), &clock);
        let err = pending.clone().with_status(JobStatus::Completed, t0()).unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");

        let completed = pending
            .with_status(JobStatus::Running, t0())
            .and_then(|j| j.with_status(JobStatus::Completed, t0()))
            .unwrap();
        for next in [JobStatus::Pending, JobStatus::Running, JobStatus::FailedPermanent] {
            assert!(completed.clone().with_status(next, t0()).is_err());
        }
    }

    #[test]
    fn retry_budget_cannot_be_overdrawn() {
        let clock = ManualClock::new(t0());
        let job = job_at(t0(), &clock);
        let job = job.with_incremented_retry(t0()).unwrap();
        let job = job.with_incremented_retry(t0()).unwrap();
        assert_eq!(job.retry_count, 2);
        assert!(!job.has_retries_left());
        assert_eq!(job.with_incremented_retry(t0()).unwrap_err().code(), "INVALID_STATE");
    }

    #[test]
    fn next_occurrence_resets_retry_state() {
        let clock = ManualClock::new(t0());
        let def = ScheduleDefinition::new("ledger.close", TARGET, t0())
            .recurrence(ScheduleRecurrence::every(RecurrenceType::Day, 1).unwrap());
        let job = ScheduledJob::from_definition(def, &clock).unwrap();
        let completed = job
            .with_status(JobStatus::Running, t0())
            .and_then(|j| j.with_incremented_retry(t0()))
            .map(|j| j.with_result(JobResult::success(), t0()))
            .and_then(|j| j.with_status(JobStatus::Completed, t0()))
            .unwrap();

        let next_run = t0() + Duration::days(1);
        let next = completed.for_next_occurrence(next_run, t0()).unwrap();
        assert_eq!(next.id, completed.id);
        assert_eq!(next.status, JobStatus::Pending);
        assert_eq!(next.run_at, next_run);
        assert_eq!(next.retry_count, 0);
        assert_eq!(next.occurrence_count, 1);
        assert!(next.last_result.is_none());
    }

    #[test]
    fn next_occurrence_requires_completed_recurring_job() {
        let clock = ManualClock::new(t0());
        let one_shot = job_at(t0(), &clock);
        assert!(one_shot.for_next_occurrence(t0(), t0()).is_err());

        let completed = one_shot
            .with_status(JobStatus::Running, t0())
            .and_then(|j| j.with_status(JobStatus::Completed, t0()))
            .unwrap();
        assert!(completed.for_next_occurrence(t0(), t0()).is_err());
    }
}
