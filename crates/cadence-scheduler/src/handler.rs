use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::error::{Result, SchedulerError};
use crate::job::ScheduledJob;
use crate::types::JobResult;

/// Business logic for one or more job types. Owned by domain crates.
///
/// Handlers must be idempotent: delivery is at-least-once, so a job may run again
/// after a crash between the handler returning and the result being persisted.
/// `Err` and panics are treated as transient failures. Return
/// [`JobResult::permanent_failure`] to stop retries.
pub trait JobHandler: Send + Sync {
    /// Label used in logs.
    fn name(&self) -> &str;

    fn supports(&self, job_type: &str) -> bool;

    fn handle(&self, job: &ScheduledJob) -> anyhow::Result<JobResult>;
}

/// First handler in `handlers` that supports the job's type.
///
/// Order matters: when two handlers claim the same type the earlier one wins, and a
/// warning names both so the overlap gets fixed in configuration.
pub fn find_handler<'a>(
    job: &ScheduledJob,
    handlers: &'a [Arc<dyn JobHandler>],
) -> Result<&'a Arc<dyn JobHandler>> {
    let mut matching = handlers.iter().filter(|h| h.supports(&job.job_type));
    let first = matching.next().ok_or_else(|| SchedulerError::NoHandlerFound {
        job_type: job.job_type.clone(),
    })?;
    if let Some(shadowed) = matching.next() {
        warn!(
            job_type = %job.job_type,
            selected = first.name(),
            shadowed = shadowed.name(),
            "multiple handlers support job type; first registered wins"
        );
    }
    Ok(first)
}

/// Ordered handler collection shared by workers.
#[derive(Default)]
pub struct HandlerRegistry {
    /// Registration order is lookup order.
    handlers: RwLock<Vec<Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: Arc<dyn JobHandler>) {
        debug!(handler = handler.name(), "job handler registered");
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    pub fn find(&self, job: &ScheduledJob) -> Result<Arc<dyn JobHandler>> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        let handler = find_handler(job, &handlers)?;
        Ok(Arc::clone(handler))
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
