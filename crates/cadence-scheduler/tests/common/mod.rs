#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use cadence_core::{Clock, EntityId, ManualClock};
use cadence_scheduler::{
    ExecutionEngine, JobHandler, JobQueue, JobResult, JobStatus, ScheduleDefinition,
    ScheduleRepository, ScheduledJob, SqliteRepository,
};
use chrono::{DateTime, TimeZone, Utc};

pub const TARGET: &str = "01HXZ34Q7N8M2K5V9P0R1S2T3W";

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Repository wrapper that remembers the status of every successful save.
pub struct RecordingRepository {
    pub inner: SqliteRepository,
    pub saved: Mutex<Vec<(JobStatus, u32)>>,
}

impl RecordingRepository {
    pub fn new() -> Self {
        Self {
            inner: SqliteRepository::open_in_memory().unwrap(),
            saved: Mutex::new(Vec::new()),
        }
    }

    pub fn statuses(&self) -> Vec<JobStatus> {
        self.saved.lock().unwrap().iter().map(|(s, _)| *s).collect()
    }

    pub fn latest(&self, id: &EntityId) -> ScheduledJob {
        self.inner.find(id).unwrap().unwrap()
    }
}

impl ScheduleRepository for RecordingRepository {
    fn save(&self, job: &ScheduledJob) -> cadence_scheduler::Result<ScheduledJob> {
        let saved = self.inner.save(job)?;
        self.saved.lock().unwrap().push((saved.status(), saved.retry_count()));
        Ok(saved)
    }

    fn find(&self, id: &EntityId) -> cadence_scheduler::Result<Option<ScheduledJob>> {
        self.inner.find(id)
    }

    fn find_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> cadence_scheduler::Result<Vec<ScheduledJob>> {
        self.inner.find_due(now, limit)
    }
}

/// Queue that keeps every dispatched `(job, delay)` pair.
#[derive(Default)]
pub struct RecordingQueue {
    pub sent: Mutex<Vec<(ScheduledJob, u64)>>,
}

impl RecordingQueue {
    pub fn delays(&self) -> Vec<u64> {
        self.sent.lock().unwrap().iter().map(|(_, d)| *d).collect()
    }
}

impl JobQueue for RecordingQueue {
    fn dispatch(&self, job: &ScheduledJob, delay_seconds: u64) -> cadence_scheduler::Result<()> {
        self.sent.lock().unwrap().push((job.clone(), delay_seconds));
        Ok(())
    }
}

/// Handler whose behaviour is a closure; counts invocations.
pub struct ScriptedHandler {
    pub calls: AtomicUsize,
    script: Box<dyn Fn(usize) -> anyhow::Result<JobResult> + Send + Sync>,
}

impl ScriptedHandler {
    pub fn new(script: impl Fn(usize) -> anyhow::Result<JobResult> + Send + Sync + 'static) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            script: Box::new(script),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl JobHandler for ScriptedHandler {
    fn name(&self) -> &str {
        "scripted"
    }

    fn supports(&self, job_type: &str) -> bool {
        job_type == "test.job"
    }

    fn handle(&self, _job: &ScheduledJob) -> anyhow::Result<JobResult> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        (self.script)(n)
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub repo: Arc<RecordingRepository>,
    pub queue: Arc<RecordingQueue>,
    pub engine: ExecutionEngine,
}

impl Harness {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let repo = Arc::new(RecordingRepository::new());
        let queue = Arc::new(RecordingQueue::default());
        let engine = ExecutionEngine::new(repo.clone(), queue.clone(), clock.clone());
        Self {
            clock,
            repo,
            queue,
            engine,
        }
    }

    /// Create and persist the first instance of `definition`.
    pub fn schedule(&self, definition: ScheduleDefinition) -> ScheduledJob {
        let job = ScheduledJob::from_definition(definition, self.clock.as_ref()).unwrap();
        self.repo.save(&job).unwrap()
    }

    /// Move the clock to the job's run time and execute it.
    pub fn run_when_due(&self, job: &ScheduledJob, handler: &dyn JobHandler) -> JobResult {
        self.clock.set(job.run_at());
        assert!(job.is_due(self.clock.as_ref()));
        self.engine.execute(job, handler).unwrap()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

pub fn definition(run_at: DateTime<Utc>) -> ScheduleDefinition {
    ScheduleDefinition::new("test.job", TARGET, run_at)
}
