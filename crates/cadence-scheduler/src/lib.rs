//! `cadence-scheduler` — retrying, recurrence-aware job execution engine.
//!
//! # Overview
//!
//! A [`ScheduledJob`] is created from a [`ScheduleDefinition`] and stored through a
//! [`ScheduleRepository`]. When it is due, a worker hands it to
//! [`ExecutionEngine::execute`] together with the [`JobHandler`] for its type. The
//! engine claims the job, runs the handler, and then completes it, schedules a retry
//! with backoff, or fails it permanently. A successful recurring job also gets its
//! next occurrence from the [`RecurrenceEngine`].
//!
//! # Recurrence types
//!
//! | Type                               | Next run                                           |
//! |------------------------------------|----------------------------------------------------|
//! | `one_time`                         | none                                               |
//! | `minute` / `hour` / `day` / `week` | `run_at` + interval units                          |
//! | `month` / `year`                   | calendar months, clamped to the last day of month  |
//! | `cron`                             | next match of a standard 5-field cron expression   |
//!
//! # Retry backoff
//!
//! 60, 120, 240, 480, 960 seconds for the first five retries, then
//! `min(2^retry * 60, 3600)`. A [`JobResult`] may set its own delay instead.
//!
//! Delivery is at-least-once; handlers must be idempotent.

pub mod backoff;
pub mod db;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod handler;
pub mod job;
pub mod queue;
pub mod recurrence;
pub mod repository;
pub mod types;

pub use db::SqliteRepository;
pub use dispatcher::Dispatcher;
pub use engine::ExecutionEngine;
pub use error::{Result, SchedulerError};
pub use handler::{find_handler, HandlerRegistry, JobHandler};
pub use job::ScheduledJob;
pub use queue::{ChannelQueue, JobQueue, QueuedJob};
pub use recurrence::RecurrenceEngine;
pub use repository::ScheduleRepository;
pub use types::{
    JobResult, JobStatus, Metadata, Payload, RecurrenceType, ScheduleDefinition,
    ScheduleRecurrence,
};
