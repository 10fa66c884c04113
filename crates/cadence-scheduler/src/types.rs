use std::collections::BTreeMap;

use cadence_core::config::{JobDefaults, DEFAULT_MAX_RETRIES};
use cadence_core::EntityId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};
use crate::recurrence::parse_cron;

/// Opaque key/value data handed to the handler. The engine never looks inside.
pub type Payload = BTreeMap<String, serde_json::Value>;

/// Free-form annotations carried alongside a job, untouched by the engine.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Lifecycle state of a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `run_at`; eligible for dispatch.
    Pending,
    /// Claimed by a worker and currently executing.
    Running,
    /// Finished successfully. Terminal.
    Completed,
    /// Failed without retry, or exhausted its retry budget. Terminal.
    FailedPermanent,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::FailedPermanent)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Pending -> Running, then Running -> {Completed, Pending (retry), FailedPermanent}.
    /// Terminal states have no outgoing edges.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Pending)
                | (JobStatus::Running, JobStatus::FailedPermanent)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::FailedPermanent => "failed_permanent",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed_permanent" => Ok(JobStatus::FailedPermanent),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// How a recurring job repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurrenceType {
    OneTime,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
    /// Standard 5-field cron expression (minute hour day-of-month month day-of-week).
    Cron,
}

impl RecurrenceType {
    pub fn is_fixed_interval(self) -> bool {
        !matches!(self, RecurrenceType::OneTime | RecurrenceType::Cron)
    }
}

/// Repetition policy attached to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRecurrence {
    #[serde(rename = "type")]
    pub kind: RecurrenceType,
    /// Number of `kind` units between runs. Only meaningful for fixed-interval types.
    #[serde(default = "default_interval")]
    pub interval: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expression: Option<String>,
    /// No occurrence is produced once the clock reaches this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_at: Option<DateTime<Utc>>,
    /// Total number of runs after which the recurrence stops.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_after_occurrences: Option<u32>,
}

fn default_interval() -> u32 {
    1
}

impl ScheduleRecurrence {
    pub fn once() -> Self {
        Self {
            kind: RecurrenceType::OneTime,
            interval: 1,
            cron_expression: None,
            end_at: None,
            end_after_occurrences: None,
        }
    }

    /// Repeat every `interval` units of `kind`.
    pub fn every(kind: RecurrenceType, interval: u32) -> Result<Self> {
        let recurrence = Self {
            kind,
            interval,
            ..Self::once()
        };
        recurrence.validate()?;
        Ok(recurrence)
    }

    /// Repeat on a cron schedule. The expression is parsed here so a typo fails
    /// when the schedule is defined, not when the first run completes.
    pub fn cron(expression: &str) -> Result<Self> {
        let recurrence = Self {
            kind: RecurrenceType::Cron,
            cron_expression: Some(expression.trim().to_string()),
            ..Self::once()
        };
        recurrence.validate()?;
        Ok(recurrence)
    }

    pub fn ending_at(mut self, at: DateTime<Utc>) -> Self {
        self.end_at = Some(at);
        self
    }

    pub fn ending_after(mut self, occurrences: u32) -> Self {
        self.end_after_occurrences = Some(occurrences);
        self
    }

    pub fn is_repeating(&self) -> bool {
        self.kind != RecurrenceType::OneTime
    }

    /// The single authority on whether another occurrence may be produced.
    ///
    /// `occurrence_count` is the number of runs already completed.
    pub fn has_ended(&self, now: DateTime<Utc>, occurrence_count: u32) -> bool {
        if !self.is_repeating() {
            return true;
        }
        if self.end_at.is_some_and(|end| now >= end) {
            return true;
        }
        self.end_after_occurrences
            .is_some_and(|max| occurrence_count >= max)
    }

    pub fn validate(&self) -> Result<()> {
        match self.kind {
            RecurrenceType::OneTime => Ok(()),
            RecurrenceType::Cron => {
                let expr = self.cron_expression.as_deref().ok_or_else(|| {
                    SchedulerError::InvalidRecurrence(
                        "cron recurrence requires an expression".to_string(),
                    )
                })?;
                parse_cron(expr).map(|_| ())
            }
            _ if self.interval == 0 => Err(SchedulerError::InvalidArgument(format!(
                "{:?} recurrence interval must be at least 1",
                self.kind
            ))),
            _ => Ok(()),
        }
    }
}

/// Input used to create the first [`ScheduledJob`](crate::job::ScheduledJob) of a schedule.
///
/// Never persisted itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    pub job_type: String,
    pub target_id: String,
    pub run_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default)]
    pub recurrence: Option<ScheduleRecurrence>,
    /// Signed so that a negative budget from an external caller is caught by
    /// validation instead of being silently wrapped.
    pub max_retries: i64,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub metadata: Metadata,
}

impl ScheduleDefinition {
    pub fn new(job_type: impl Into<String>, target_id: impl Into<String>, run_at: DateTime<Utc>) -> Self {
        Self {
            job_type: job_type.into(),
            target_id: target_id.into(),
            run_at,
            payload: Payload::new(),
            recurrence: None,
            max_retries: i64::from(DEFAULT_MAX_RETRIES),
            priority: 0,
            metadata: Metadata::new(),
        }
    }

    /// Like [`new`](Self::new) but with retry budget and priority taken from config.
    pub fn with_defaults(
        defaults: &JobDefaults,
        job_type: impl Into<String>,
        target_id: impl Into<String>,
        run_at: DateTime<Utc>,
    ) -> Self {
        Self {
            max_retries: i64::from(defaults.default_max_retries),
            priority: defaults.default_priority,
            ..Self::new(job_type, target_id, run_at)
        }
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn recurrence(mut self, recurrence: ScheduleRecurrence) -> Self {
        self.recurrence = Some(recurrence);
        self
    }

    pub fn max_retries(mut self, max_retries: i64) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Check the definition and return the parsed target id and retry budget.
    pub fn validate(&self) -> Result<(EntityId, u32)> {
        if self.job_type.trim().is_empty() {
            return Err(SchedulerError::InvalidArgument(
                "job type must not be empty".to_string(),
            ));
        }
        let target_id = EntityId::parse(&self.target_id)?;
        let max_retries = u32::try_from(self.max_retries).map_err(|_| {
            SchedulerError::InvalidArgument(format!(
                "max_retries must be between 0 and {}, got {}",
                u32::MAX,
                self.max_retries
            ))
        })?;
        if let Some(recurrence) = &self.recurrence {
            recurrence.validate()?;
        }
        Ok((target_id, max_retries))
    }
}

/// Outcome of a single execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Handler's hint that the failure is transient.
    pub should_retry: bool,
    /// Overrides the backoff table when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
}

impl JobResult {
    pub fn success() -> Self {
        Self {
            success: true,
            error: None,
            should_retry: false,
            retry_delay_secs: None,
            ended_at: None,
            duration_seconds: None,
        }
    }

    /// A transient failure; retried with the standard backoff.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            should_retry: true,
            ..Self::success()
        }
    }

    /// A transient failure retried after exactly `delay_secs`.
    pub fn retry_after(error: impl Into<String>, delay_secs: u64) -> Self {
        Self {
            retry_delay_secs: Some(delay_secs),
            ..Self::failure(error)
        }
    }

    /// A failure that must never be retried, e.g. a malformed payload.
    pub fn permanent_failure(error: impl Into<String>) -> Self {
        Self {
            should_retry: false,
            ..Self::failure(error)
        }
    }

    pub fn is_permanent_failure(&self) -> bool {
        !self.success && !self.should_retry
    }

    pub fn with_timing(mut self, ended_at: DateTime<Utc>, duration_seconds: f64) -> Self {
        self.ended_at = Some(ended_at);
        self.duration_seconds = Some(duration_seconds);
        self
    }
}
