use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use cadence_core::Clock;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use crate::{
    backoff::retry_delay_secs,
    error::{Result, SchedulerError},
    handler::{find_handler, JobHandler},
    job::ScheduledJob,
    queue::JobQueue,
    recurrence::RecurrenceEngine,
    repository::ScheduleRepository,
    types::{JobResult, JobStatus},
};

/// Runs one attempt of one job and records what happened.
///
/// Synchronous: `execute` returns only after the job has been finalized, rescheduled
/// for retry, or followed by its next occurrence. Run several engines (or several
/// workers sharing one) for concurrency; the repository's conditional write keeps
/// two of them from executing the same attempt.
pub struct ExecutionEngine {
    repository: Arc<dyn ScheduleRepository>,
    queue: Arc<dyn JobQueue>,
    recurrence: RecurrenceEngine,
    clock: Arc<dyn Clock>,
}

impl ExecutionEngine {
    pub fn new(
        repository: Arc<dyn ScheduleRepository>,
        queue: Arc<dyn JobQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repository,
            queue,
            recurrence: RecurrenceEngine::new(Arc::clone(&clock)),
            clock,
        }
    }

    pub fn recurrence(&self) -> &RecurrenceEngine {
        &self.recurrence
    }

    /// See [`find_handler`].
    pub fn find_handler<'a>(
        &self,
        job: &ScheduledJob,
        handlers: &'a [Arc<dyn JobHandler>],
    ) -> Result<&'a Arc<dyn JobHandler>> {
        find_handler(job, handlers)
    }

    /// Execute `job` with `handler` and return the attempt's result, timing attached.
    ///
    /// Handler failures never surface as `Err`; they are classified and recovered here.
    /// `Err` means the caller misused the engine (job not pending), the job changed
    /// since `job` was read, e.g. another worker claimed or retried it (`Conflict`), or
    /// the repository failed.
    pub fn execute(&self, job: &ScheduledJob, handler: &dyn JobHandler) -> Result<JobResult> {
        if !job.can_execute() {
            error!(job_id = %job.id, status = %job.status, "refusing to execute job that is not pending");
            return Err(SchedulerError::InvalidState {
                id: job.id.to_string(),
                status: job.status,
                action: "execute",
            });
        }

        let started_at = self.clock.now();
        // Persist the claim before running anything: a crash from here on leaves
        // a durable "running" record rather than a job that looks untouched.
        let running = self
            .repository
            .save(&job.clone().with_status(JobStatus::Running, started_at)?)?;
        debug!(
            job_id = %running.id,
            job_type = %running.job_type,
            handler = handler.name(),
            retry = running.retry_count,
            occurrence = running.occurrence_count,
            "job running"
        );

        let outcome = invoke(handler, &running);

        let ended_at = self.clock.now();
        let elapsed = (ended_at - started_at).num_milliseconds() as f64 / 1_000.0;
        let result = outcome.with_timing(ended_at, elapsed);

        self.apply(running, &result, ended_at)?;
        Ok(result)
    }

    fn apply(&self, running: ScheduledJob, result: &JobResult, now: DateTime<Utc>) -> Result<()> {
        let recorded = running.with_result(result.clone(), now);

        if result.success {
            let completed = self
                .repository
                .save(&recorded.with_status(JobStatus::Completed, now)?)?;
            info!(
                job_id = %completed.id,
                job_type = %completed.job_type,
                occurrence = completed.occurrence_count,
                duration_secs = result.duration_seconds,
                "job completed"
            );
            if completed.is_recurring() {
                self.schedule_next_occurrence(&completed, now)?;
            }
            return Ok(());
        }

        let error_text = result.error.as_deref().unwrap_or("unknown error");
        if result.is_permanent_failure() || !recorded.has_retries_left() {
            let failed = self
                .repository
                .save(&recorded.with_status(JobStatus::FailedPermanent, now)?)?;
            error!(
                job_id = %failed.id,
                job_type = %failed.job_type,
                retry = failed.retry_count,
                max_retries = failed.max_retries,
                permanent = result.is_permanent_failure(),
                "job failed permanently: {error_text}"
            );
            return Ok(());
        }

        let delay_secs = retry_delay_secs(result, recorded.retry_count);
        let retry_at = offset(now, delay_secs);
        let retry = recorded
            .with_incremented_retry(now)?
            .with_run_at(retry_at, now)
            .with_status(JobStatus::Pending, now)?;
        let retry = self.repository.save(&retry)?;
        warn!(
            job_id = %retry.id,
            job_type = %retry.job_type,
            retry = retry.retry_count,
            max_retries = retry.max_retries,
            delay_secs,
            "job failed, retry scheduled: {error_text}"
        );
        self.enqueue(&retry, delay_secs);
        Ok(())
    }

    /// Persist the next occurrence of a completed recurring job, if there is one.
    fn schedule_next_occurrence(&self, completed: &ScheduledJob, now: DateTime<Utc>) -> Result<()> {
        let Some(recurrence) = completed.recurrence.as_ref() else {
            return Ok(());
        };
        // The run that just finished counts towards the end condition.
        let runs = completed.occurrence_count + 1;
        let Some(next_run_at) =
            self.recurrence
                .calculate_next_run_time(completed.run_at, recurrence, runs)?
        else {
            info!(job_id = %completed.id, runs, "recurrence finished");
            return Ok(());
        };

        let next = self
            .repository
            .save(&completed.for_next_occurrence(next_run_at, now)?)?;
        info!(
            job_id = %next.id,
            occurrence = next.occurrence_count,
            run_at = %next.run_at,
            "next occurrence scheduled"
        );
        let delay_secs = u64::try_from((next_run_at - now).num_seconds()).unwrap_or(0);
        self.enqueue(&next, delay_secs);
        Ok(())
    }

    /// The row is already saved as pending, so a refused message only costs latency:
    /// any poller over the repository still finds the job once it is due.
    fn enqueue(&self, job: &ScheduledJob, delay_secs: u64) {
        if let Err(e) = self.queue.dispatch(job, delay_secs) {
            error!(job_id = %job.id, code = e.code(), "failed to enqueue job: {e}");
        }
    }
}

/// Run the handler, turning errors and panics into transient failures.
///
/// Without an explicit permanent-failure result the engine cannot tell a bug from a
/// flaky dependency, so both are retried.
fn invoke(handler: &dyn JobHandler, job: &ScheduledJob) -> JobResult {
    match catch_unwind(AssertUnwindSafe(|| handler.handle(job))) {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => JobResult::failure(format!("{e:#}")),
        Err(panic) => JobResult::failure(format!("handler panicked: {}", panic_message(&*panic))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// `now + delay_secs`, saturating at the latest representable instant.
fn offset(now: DateTime<Utc>, delay_secs: u64) -> DateTime<Utc> {
    i64::try_from(delay_secs)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
