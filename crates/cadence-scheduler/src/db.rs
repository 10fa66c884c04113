use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use cadence_core::config::DatabaseConfig;
use cadence_core::EntityId;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, error, warn};

use crate::error::{Result, SchedulerError};
use crate::job::ScheduledJob;
use crate::repository::ScheduleRepository;
use crate::types::JobStatus;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `scheduled_jobs` table (idempotent) and an index on
/// `(status, run_at)` so the due-job poll stays cheap with many pending rows.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS scheduled_jobs (
            id                TEXT    NOT NULL,
            occurrence_count  INTEGER NOT NULL,
            job_type          TEXT    NOT NULL,
            target_id         TEXT    NOT NULL,
            run_at            TEXT    NOT NULL,   -- RFC 3339, fixed width, UTC
            status            TEXT    NOT NULL,
            payload           TEXT    NOT NULL,   -- JSON object
            recurrence        TEXT,               -- JSON ScheduleRecurrence or NULL
            max_retries       INTEGER NOT NULL,
            retry_count       INTEGER NOT NULL,
            priority          INTEGER NOT NULL,
            last_result       TEXT,               -- JSON JobResult or NULL
            metadata          TEXT    NOT NULL,   -- JSON object
            created_at        TEXT    NOT NULL,
            updated_at        TEXT    NOT NULL,
            version           INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (id, occurrence_count)
        ) STRICT;

        -- Due-job polling: WHERE status = 'pending' AND run_at <= ?
        CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_due
            ON scheduled_jobs (status, run_at);
        ",
    )?;
    Ok(())
}

const SELECT_COLUMNS: &str = "SELECT id, occurrence_count, job_type, target_id, run_at, status,
        payload, recurrence, max_retries, retry_count, priority, last_result,
        metadata, created_at, updated_at, version
     FROM scheduled_jobs";

/// Timestamps are stored in one fixed-width format so text comparison in SQL
/// orders them chronologically.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// SQLite-backed [`ScheduleRepository`] with conditional (version-guarded) writes.
pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open (or create) the database file. Several worker processes may share it;
    /// writers wait up to five seconds for the lock.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    pub fn from_config(config: &DatabaseConfig) -> Result<Self> {
        if let Some(parent) = Path::new(&config.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    SchedulerError::InvalidArgument(format!(
                        "cannot create database directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        Self::open(&config.path)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn find_occurrence(&self, id: &EntityId, occurrence: u32) -> Result<Option<ScheduledJob>> {
        let conn = self.lock();
        let raw = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1 AND occurrence_count = ?2"),
                params![id.as_str(), occurrence],
                RawJob::from_row,
            )
            .optional()?;
        raw.map(RawJob::into_job).transpose()
    }

    /// Every stored occurrence of `id`, oldest first.
    pub fn history(&self, id: &EntityId) -> Result<Vec<ScheduledJob>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{SELECT_COLUMNS} WHERE id = ?1 ORDER BY occurrence_count"
        ))?;
        let rows = stmt
            .query_map([id.as_str()], RawJob::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RawJob::into_job).collect()
    }
}

impl ScheduleRepository for SqliteRepository {
    fn save(&self, job: &ScheduledJob) -> Result<ScheduledJob> {
        let mut conn = self.lock();
        // IMMEDIATE takes the write lock up front so the version read below cannot
        // go stale before the guarded UPDATE.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let stored: Option<(String, u32)> = tx
            .query_row(
                "SELECT status, version FROM scheduled_jobs WHERE id = ?1 AND occurrence_count = ?2",
                params![job.id.as_str(), job.occurrence_count],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let payload = serde_json::to_string(&job.payload)?;
        let recurrence = job.recurrence.as_ref().map(serde_json::to_string).transpose()?;
        let last_result = job.last_result.as_ref().map(serde_json::to_string).transpose()?;
        let metadata = serde_json::to_string(&job.metadata)?;

        let version = match stored {
            None => {
                if job.status != JobStatus::Pending {
                    return Err(SchedulerError::InvalidState {
                        id: job.id.to_string(),
                        status: job.status,
                        action: "insert a job that is not pending",
                    });
                }
                tx.execute(
                    "INSERT INTO scheduled_jobs
                     (id, occurrence_count, job_type, target_id, run_at, status, payload,
                      recurrence, max_retries, retry_count, priority, last_result, metadata,
                      created_at, updated_at, version)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,0)",
                    params![
                        job.id.as_str(),
                        job.occurrence_count,
                        job.job_type,
                        job.target_id.as_str(),
                        ts(job.run_at),
                        job.status.to_string(),
                        payload,
                        recurrence,
                        job.max_retries,
                        job.retry_count,
                        job.priority,
                        last_result,
                        metadata,
                        ts(job.created_at),
                        ts(job.updated_at),
                    ],
                )?;
                0
            }
            Some((stored_status, stored_version)) => {
                let stored = parse_status(job.id.as_str(), &stored_status)?;
                let conflict = || SchedulerError::Conflict {
                    id: job.id.to_string(),
                    occurrence: job.occurrence_count,
                    stored,
                };
                if stored_version != job.version || !stored.can_transition_to(job.status) {
                    warn!(
                        job_id = %job.id,
                        occurrence = job.occurrence_count,
                        expected_version = job.version,
                        stored_version,
                        stored_status = %stored,
                        status = %job.status,
                        "save rejected, job changed since it was read"
                    );
                    return Err(conflict());
                }
                let n = tx.execute(
                    "UPDATE scheduled_jobs
                     SET run_at=?1, status=?2, payload=?3, recurrence=?4, max_retries=?5,
                         retry_count=?6, priority=?7, last_result=?8, metadata=?9,
                         updated_at=?10, version = version + 1
                     WHERE id=?11 AND occurrence_count=?12 AND version=?13",
                    params![
                        ts(job.run_at),
                        job.status.to_string(),
                        payload,
                        recurrence,
                        job.max_retries,
                        job.retry_count,
                        job.priority,
                        last_result,
                        metadata,
                        ts(job.updated_at),
                        job.id.as_str(),
                        job.occurrence_count,
                        job.version,
                    ],
                )?;
                if n != 1 {
                    return Err(conflict());
                }
                stored_version + 1
            }
        };

        tx.commit()?;
        debug!(
            job_id = %job.id,
            occurrence = job.occurrence_count,
            status = %job.status,
            version,
            "job saved"
        );
        Ok(ScheduledJob {
            version,
            ..job.clone()
        })
    }

    fn find(&self, id: &EntityId) -> Result<Option<ScheduledJob>> {
        let conn = self.lock();
        let raw = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1 ORDER BY occurrence_count DESC LIMIT 1"),
                [id.as_str()],
                RawJob::from_row,
            )
            .optional()?;
        raw.map(RawJob::into_job).transpose()
    }

    fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledJob>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "{SELECT_COLUMNS}
             WHERE status = 'pending' AND run_at <= ?1
             ORDER BY priority DESC, run_at ASC
             LIMIT ?2"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![ts(now), limit], RawJob::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        // One undecodable row must not stall every other due job.
        Ok(rows
            .into_iter()
            .filter_map(|raw| match raw.into_job() {
                Ok(job) => Some(job),
                Err(e) => {
                    error!("skipping undecodable due job: {e}");
                    None
                }
            })
            .collect())
    }
}

fn parse_status(id: &str, s: &str) -> Result<JobStatus> {
    s.parse().map_err(|reason| SchedulerError::CorruptRecord {
        id: id.to_string(),
        reason,
    })
}

fn parse_ts(id: &str, column: &str, s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SchedulerError::CorruptRecord {
            id: id.to_string(),
            reason: format!("{column}: {e}"),
        })
}

/// Column values as stored, before JSON and timestamp decoding.
struct RawJob {
    id: String,
    occurrence_count: u32,
    job_type: String,
    target_id: String,
    run_at: String,
    status: String,
    payload: String,
    recurrence: Option<String>,
    max_retries: u32,
    retry_count: u32,
    priority: i32,
    last_result: Option<String>,
    metadata: String,
    created_at: String,
    updated_at: String,
    version: u32,
}

impl RawJob {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            occurrence_count: row.get(1)?,
            job_type: row.get(2)?,
            target_id: row.get(3)?,
            run_at: row.get(4)?,
            status: row.get(5)?,
            payload: row.get(6)?,
            recurrence: row.get(7)?,
            max_retries: row.get(8)?,
            retry_count: row.get(9)?,
            priority: row.get(10)?,
            last_result: row.get(11)?,
            metadata: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
            version: row.get(15)?,
        })
    }

    fn into_job(self) -> Result<ScheduledJob> {
        let id = self.id;
        Ok(ScheduledJob {
            id: EntityId::parse(&id)?,
            job_type: self.job_type,
            target_id: EntityId::parse(&self.target_id)?,
            run_at: parse_ts(&id, "run_at", &self.run_at)?,
            status: parse_status(&id, &self.status)?,
            payload: serde_json::from_str(&self.payload)?,
            recurrence: self.recurrence.as_deref().map(serde_json::from_str).transpose()?,
            max_retries: self.max_retries,
            retry_count: self.retry_count,
            priority: self.priority,
            occurrence_count: self.occurrence_count,
            last_result: self.last_result.as_deref().map(serde_json::from_str).transpose()?,
            metadata: serde_json::from_str(&self.metadata)?,
            created_at: parse_ts(&id, "created_at", &self.created_at)?,
            updated_at: parse_ts(&id, "updated_at", &self.updated_at)?,
            version: self.version,
        })
    }
}
