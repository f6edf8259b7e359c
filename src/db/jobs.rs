use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::str::FromStr;
use tracing::{debug, warn};

use super::{optional_timestamp_column, timestamp_column, Database};
use crate::error::{StorageError, StorageResult};
use crate::models::{format_timestamp, JobStatus, ScrapeJob, ScrapeType};

const JOB_COLUMNS: &str = "id, channel_id, status, scrape_type, started_at, completed_at,
     messages_scraped, error_message, resumed_from_job_id, heartbeat_at";

const INTERRUPTED_MESSAGE: &str = "process exited while the job was running";

impl Database {
    /// Creates a `pending` job with a zeroed counter and returns its id.
    pub fn create_job(
        &self,
        channel_id: &str,
        scrape_type: ScrapeType,
        resumed_from_job_id: Option<i64>,
    ) -> StorageResult<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO scrape_jobs (channel_id, status, scrape_type, started_at, messages_scraped, resumed_from_job_id)
             VALUES (?1, 'pending', ?2, ?3, 0, ?4)",
            params![
                channel_id,
                scrape_type.as_str(),
                format_timestamp(&Utc::now()),
                resumed_from_job_id
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!("Database: Created {} scrape job {} for channel {}", scrape_type, id, channel_id);
        Ok(id)
    }

    pub fn get_job(&self, id: i64) -> StorageResult<Option<ScrapeJob>> {
        let conn = self.conn();
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM scrape_jobs WHERE id = ?1"),
                [id],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    /// Newest first, optionally filtered by status.
    pub fn list_jobs(&self, status: Option<JobStatus>) -> StorageResult<Vec<ScrapeJob>> {
        let conn = self.conn();
        let mut results = Vec::new();

        match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM scrape_jobs WHERE status = ?1
                     ORDER BY started_at DESC, id DESC"
                ))?;
                let rows = stmt.query_map([status.as_str()], job_from_row)?;
                for row in rows {
                    results.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM scrape_jobs ORDER BY started_at DESC, id DESC"
                ))?;
                let rows = stmt.query_map([], job_from_row)?;
                for row in rows {
                    results.push(row?);
                }
            }
        }
        Ok(results)
    }

    /// Moves a job to `status`, recording `error_message` and stamping
    /// `completed_at` when the new status is completed or failed. Entering
    /// `running` also stamps the heartbeat.
    ///
    /// Only forward transitions are applied. Returns `false` (leaving the row
    /// untouched) when the job is missing, already terminal, or the move is
    /// not legal from its current status. `messages_scraped` is never touched.
    pub fn update_job_status(
        &self,
        id: i64,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> StorageResult<bool> {
        let allowed = JobStatus::predecessors(status);
        if allowed.is_empty() {
            return Ok(false);
        }
        let allowed_sql = allowed
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let now = format_timestamp(&Utc::now());
        let completed_at = status.stamps_completion().then(|| now.clone());
        let heartbeat_at = (status == JobStatus::Running).then_some(now);

        let changed = self.conn().execute(
            &format!(
                "UPDATE scrape_jobs
                 SET status = ?1,
                     error_message = ?2,
                     completed_at = COALESCE(?3, completed_at),
                     heartbeat_at = COALESCE(?5, heartbeat_at)
                 WHERE id = ?4 AND status IN ({allowed_sql})"
            ),
            params![status.as_str(), error_message, completed_at, id, heartbeat_at],
        )?;

        if changed == 0 {
            warn!("Database: Ignored transition of job {} to {}", id, status);
        }
        Ok(changed == 1)
    }

    /// Atomically adds `delta` to the job's counter.
    pub fn increment_messages_scraped(&self, id: i64, delta: u64) -> StorageResult<()> {
        self.conn().execute(
            "UPDATE scrape_jobs SET messages_scraped = messages_scraped + ?1 WHERE id = ?2",
            params![delta as i64, id],
        )?;
        Ok(())
    }

    /// Records that the process running job `id` is still alive. Returns
    /// `false` once the job has left `running`.
    pub fn touch_job_heartbeat(&self, id: i64, at: DateTime<Utc>) -> StorageResult<bool> {
        let changed = self.conn().execute(
            "UPDATE scrape_jobs SET heartbeat_at = ?1 WHERE id = ?2 AND status = 'running'",
            params![format_timestamp(&at), id],
        )?;
        Ok(changed == 1)
    }

    /// Marks `running` jobs whose heartbeat is older than `stale_before` as
    /// `interrupted`. Jobs still owned by a live process keep refreshing their
    /// heartbeat and are left alone.
    pub fn mark_stale_jobs_interrupted(&self, stale_before: DateTime<Utc>) -> StorageResult<usize> {
        let count = self.conn().execute(
            "UPDATE scrape_jobs SET status = 'interrupted', error_message = ?1
             WHERE status = 'running' AND COALESCE(heartbeat_at, started_at) < ?2",
            params![INTERRUPTED_MESSAGE, format_timestamp(&stale_before)],
        )?;
        if count > 0 {
            debug!("Database: Interrupted {} stale running job(s)", count);
        }
        Ok(count)
    }
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<ScrapeJob> {
    Ok(ScrapeJob {
        id: row.get("id")?,
        channel_id: row.get("channel_id")?,
        status: enum_column(row, "status")?,
        scrape_type: enum_column(row, "scrape_type")?,
        started_at: timestamp_column(row, "started_at")?,
        completed_at: optional_timestamp_column(row, "completed_at")?,
        messages_scraped: row.get("messages_scraped")?,
        error_message: row.get("error_message")?,
        resumed_from_job_id: row.get("resumed_from_job_id")?,
        heartbeat_at: optional_timestamp_column(row, "heartbeat_at")?,
    })
}

fn enum_column<T>(row: &Row<'_>, name: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let idx = row.as_ref().column_index(name)?;
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|msg| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(StorageError::Decode(msg)),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::models::{parse_timestamp, JobStatus, ScrapeType};
    use chrono::Utc;

    #[test]
    fn test_create_job_defaults() {
        let db = seeded_db();
        let id = db.create_job("c1", ScrapeType::Full, None).unwrap();

        let job = db.get_job(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.scrape_type, ScrapeType::Full);
        assert_eq!(job.messages_scraped, 0);
        assert_eq!(job.completed_at, None);
        assert_eq!(job.error_message, None);
        assert_eq!(job.resumed_from_job_id, None);

        let next = db.create_job("c1", ScrapeType::Incremental, Some(id)).unwrap();
        assert!(next > id);
        assert_eq!(db.get_job(next).unwrap().unwrap().resumed_from_job_id, Some(id));
    }

    #[test]
    fn test_job_failure_records_message() {
        let db = seeded_db();
        let id = db.create_job("c1", ScrapeType::Full, None).unwrap();

        assert!(db
            .update_job_status(id, JobStatus::Failed, Some("Network timeout"))
            .unwrap());

        let job = db.get_job(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("Network timeout"));
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_terminal_jobs_are_frozen() {
        let db = seeded_db();
        let id = db.create_job("c1", ScrapeType::Full, None).unwrap();
        assert!(db.update_job_status(id, JobStatus::Running, None).unwrap());
        db.increment_messages_scraped(id, 3).unwrap();
        assert!(db.update_job_status(id, JobStatus::Completed, None).unwrap());
        let completed = db.get_job(id).unwrap().unwrap();

        assert!(!db
            .update_job_status(id, JobStatus::Failed, Some("late"))
            .unwrap());
        assert!(!db.update_job_status(id, JobStatus::Running, None).unwrap());

        let job = db.get_job(id).unwrap().unwrap();
        assert_eq!(job, completed);
        assert_eq!(job.messages_scraped, 3);
    }

    #[test]
    fn test_running_does_not_stamp_completion() {
        let db = seeded_db();
        let id = db.create_job("c1", ScrapeType::Full, None).unwrap();
        db.update_job_status(id, JobStatus::Running, None).unwrap();

        let job = db.get_job(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.completed_at, None);
        assert!(!db.update_job_status(id, JobStatus::Running, None).unwrap());
        assert!(!db.update_job_status(999, JobStatus::Running, None).unwrap());
    }

    #[test]
    fn test_list_jobs_by_status() {
        let db = seeded_db();
        let a = db.create_job("c1", ScrapeType::Full, None).unwrap();
        let b = db.create_job("c1", ScrapeType::Incremental, None).unwrap();
        db.update_job_status(b, JobStatus::Running, None).unwrap();

        let all = db.list_jobs(None).unwrap();
        assert_eq!(all.iter().map(|j| j.id).collect::<Vec<_>>(), vec![b, a]);

        let running = db.list_jobs(Some(JobStatus::Running)).unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, b);
        assert!(db.list_jobs(Some(JobStatus::Failed)).unwrap().is_empty());
    }

    #[test]
    fn test_recovery_only_interrupts_stale_jobs() {
        let db = seeded_db();
        let running = db.create_job("c1", ScrapeType::Full, None).unwrap();
        let pending = db.create_job("c1", ScrapeType::Full, None).unwrap();
        db.update_job_status(running, JobStatus::Running, None).unwrap();
        db.increment_messages_scraped(running, 7).unwrap();

        let beat = parse_timestamp("2024-05-01T12:00:00Z").unwrap();
        assert!(db.touch_job_heartbeat(running, beat).unwrap());
        assert!(!db.touch_job_heartbeat(pending, beat).unwrap());

        // Heartbeat newer than the cutoff: the owner is alive.
        let cutoff = parse_timestamp("2024-05-01T11:59:00Z").unwrap();
        assert_eq!(db.mark_stale_jobs_interrupted(cutoff).unwrap(), 0);
        assert_eq!(db.get_job(running).unwrap().unwrap().status, JobStatus::Running);

        let cutoff = parse_timestamp("2024-05-01T12:01:00Z").unwrap();
        assert_eq!(db.mark_stale_jobs_interrupted(cutoff).unwrap(), 1);

        let job = db.get_job(running).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Interrupted);
        assert_eq!(job.messages_scraped, 7);
        assert_eq!(job.completed_at, None);
        assert_eq!(job.heartbeat_at, Some(beat));
        assert!(!db.touch_job_heartbeat(running, Utc::now()).unwrap());
        assert_eq!(
            db.get_job(pending).unwrap().unwrap().status,
            JobStatus::Pending
        );
    }

    #[test]
    fn test_entering_running_stamps_heartbeat() {
        let db = seeded_db();
        let id = db.create_job("c1", ScrapeType::Full, None).unwrap();
        assert_eq!(db.get_job(id).unwrap().unwrap().heartbeat_at, None);

        db.update_job_status(id, JobStatus::Running, None).unwrap();
        let beat = db.get_job(id).unwrap().unwrap().heartbeat_at.unwrap();

        // A fresh heartbeat protects the job from a recovery pass.
        assert_eq!(
            db.mark_stale_jobs_interrupted(beat - chrono::Duration::seconds(30))
                .unwrap(),
            0
        );
    }
}
