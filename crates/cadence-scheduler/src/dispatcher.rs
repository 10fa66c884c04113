use std::sync::Arc;
use std::time::Duration;

use cadence_core::config::WorkerConfig;
use cadence_core::Clock;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    engine::ExecutionEngine,
    error::{Result, SchedulerError},
    handler::HandlerRegistry,
    repository::ScheduleRepository,
};

/// Polling worker: finds due jobs and hands each one to the execution engine.
///
/// Cheap to clone; clones share the engine, registry and repository. Several
/// dispatchers may poll the same repository, since claiming a job is a conditional write.
#[derive(Clone)]
pub struct Dispatcher {
    repository: Arc<dyn ScheduleRepository>,
    engine: Arc<ExecutionEngine>,
    handlers: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
}

impl Dispatcher {
    pub fn new(
        repository: Arc<dyn ScheduleRepository>,
        engine: Arc<ExecutionEngine>,
        handlers: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            repository,
            engine,
            handlers,
            clock,
            config,
        }
    }

    /// Main loop. Polls every `poll_interval_ms` until `shutdown` broadcasts `true`
    /// or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            handlers = self.handlers.len(),
            "dispatcher started"
        );

        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // Handlers may block on I/O; keep them off the async workers.
                    let worker = self.clone();
                    match tokio::task::spawn_blocking(move || worker.tick()).await {
                        Ok(Ok(0)) => {}
                        Ok(Ok(n)) => debug!(executed = n, "dispatcher tick"),
                        Ok(Err(e)) => error!(code = e.code(), "dispatcher tick error: {e}"),
                        Err(e) => error!("dispatcher tick aborted: {e}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("dispatcher shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Execute every job due now, up to `batch_size`. Returns how many ran.
    ///
    /// Per-job problems are logged and skipped so one bad job cannot stall the rest.
    pub fn tick(&self) -> Result<usize> {
        let due = self
            .repository
            .find_due(self.clock.now(), self.config.batch_size)?;

        let mut executed = 0;
        for job in due {
            if job.is_overdue(self.clock.as_ref()) {
                warn!(job_id = %job.id, job_type = %job.job_type, run_at = %job.run_at, "dispatching overdue job");
            }

            let handler = match self.handlers.find(&job) {
                Ok(handler) => handler,
                Err(e) => {
                    // Left pending: registering the handler later picks it up.
                    error!(job_id = %job.id, code = e.code(), "{e}");
                    continue;
                }
            };

            match self.engine.execute(&job, handler.as_ref()) {
                Ok(_) => executed += 1,
                Err(SchedulerError::Conflict { .. }) => {
                    debug!(job_id = %job.id, "job claimed by another worker");
                }
                Err(e) => {
                    error!(job_id = %job.id, code = e.code(), "job execution error: {e}");
                }
            }
        }
        Ok(executed)
    }
}
