//! Durable job queue over the jobs table.
//!
//! The claim is a single UPDATE-with-subquery-RETURNING statement so N
//! concurrent workers cannot take the same row. FIFO among the requested
//! kinds, tie-broken by insertion order. Terminal states never transition;
//! progress clamps upward rather than rejecting stale writes.

use rusqlite::{params, OptionalExtension};

use crate::error::{Error, Result};
use crate::now_s;
use crate::store::models::{job_from_row, Job, JobKind, JobState};
use crate::store::Store;

const JOB_COLUMNS: &str = "id, kind, campaign_id, token_id, state, progress, error, \
                           input_path, result_json, created_at, started_at, completed_at";
/// Error messages stored on the row are capped before they hit operators.
const ERROR_CAP: usize = 500;

impl Store {
    /// Insert a PENDING job. Embed jobs are conditional: when a PENDING or
    /// RUNNING embed already exists for the token, nothing is inserted and
    /// `Ok(false)` is returned (duplicate publishes are silent no-ops).
    pub fn enqueue(&self, job: &Job) -> Result<bool> {
        let changed = if job.kind.is_embed() {
            self.conn.execute(
                r#"
                INSERT INTO jobs (id, kind, campaign_id, token_id, state, progress,
                                  input_path, created_at)
                SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8
                WHERE NOT EXISTS (
                    SELECT 1 FROM jobs
                    WHERE token_id = ?4
                      AND kind IN ('embed_image', 'embed_video')
                      AND state IN ('pending', 'running')
                )
                "#,
                params![
                    job.id,
                    job.kind.as_str(),
                    job.campaign_id,
                    job.token_id,
                    JobState::Pending.as_str(),
                    0,
                    job.input_path,
                    job.created_at,
                ],
            )?
        } else {
            self.conn.execute(
                r#"
                INSERT INTO jobs (id, kind, campaign_id, token_id, state, progress,
                                  input_path, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    job.id,
                    job.kind.as_str(),
                    job.campaign_id,
                    job.token_id,
                    JobState::Pending.as_str(),
                    0,
                    job.input_path,
                    job.created_at,
                ],
            )?
        };
        Ok(changed > 0)
    }

    /// Atomically claim the oldest PENDING job among `kinds`, moving it to
    /// RUNNING and stamping `started_at`. Returns `None` when the queue has
    /// nothing claimable.
    pub fn claim_next(&self, kinds: &[JobKind]) -> Result<Option<Job>> {
        if kinds.is_empty() {
            return Ok(None);
        }
        let kind_list = kinds
            .iter()
            .map(|k| format!("'{}'", k.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            r#"
            UPDATE jobs
            SET state = 'running', started_at = ?1
            WHERE id = (
                SELECT id FROM jobs
                WHERE state = 'pending' AND kind IN ({kind_list})
                ORDER BY created_at ASC, rowid ASC
                LIMIT 1
            ) AND state = 'pending'
            RETURNING {JOB_COLUMNS}
            "#
        );
        self.conn
            .query_row(&sql, params![now_s()], job_from_row)
            .optional()
            .map_err(Error::from)
    }

    /// Clamped, non-decreasing progress. Out-of-order writes are absorbed.
    pub fn update_progress(&self, job_id: &str, pct: u8) -> Result<()> {
        self.conn.execute(
            "UPDATE jobs SET progress = MAX(progress, ?2)
             WHERE id = ?1 AND state IN ('pending', 'running')",
            params![job_id, pct.min(100)],
        )?;
        Ok(())
    }

    /// PENDING|RUNNING -> COMPLETED with progress 100.
    pub fn complete_job(&self, job_id: &str) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE jobs SET state = 'completed', progress = 100, completed_at = ?2
             WHERE id = ?1 AND state IN ('pending', 'running')",
            params![job_id, now_s()],
        )?;
        if changed == 0 {
            return Err(Error::StoreConflict(format!(
                "job {job_id} is not open for completion"
            )));
        }
        Ok(())
    }

    /// PENDING|RUNNING -> FAILED with a capped message. Not retried.
    pub fn fail_job(&self, job_id: &str, message: &str) -> Result<()> {
        let mut message = message.to_string();
        let mut cap = ERROR_CAP.min(message.len());
        while !message.is_char_boundary(cap) {
            cap -= 1;
        }
        message.truncate(cap);
        let changed = self.conn.execute(
            "UPDATE jobs SET state = 'failed', error = ?2, completed_at = ?3
             WHERE id = ?1 AND state IN ('pending', 'running')",
            params![job_id, message, now_s()],
        )?;
        if changed == 0 {
            return Err(Error::StoreConflict(format!(
                "job {job_id} is not open for failure"
            )));
        }
        Ok(())
    }

    /// Attach the detect finding to the job row.
    pub fn set_job_result(&self, job_id: &str, result_json: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE jobs SET result_json = ?2 WHERE id = ?1",
            params![job_id, result_json],
        )?;
        Ok(())
    }

    pub fn job(&self, job_id: &str) -> Result<Option<Job>> {
        self.conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![job_id],
                job_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    /// RUNNING jobs older than `max_age_secs`; crash recovery is manual, so
    /// these are surfaced to operators rather than auto-released.
    pub fn stale_running_jobs(&self, max_age_secs: i64) -> Result<Vec<Job>> {
        let cutoff = now_s() - max_age_secs;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE state = 'running' AND started_at IS NOT NULL AND started_at < ?1
             ORDER BY started_at ASC"
        ))?;
        let rows = stmt.query_map(params![cutoff], job_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

/// Convenience constructor for a fresh PENDING job row.
pub fn new_job(kind: JobKind, campaign_id: &str, token_id: Option<&str>) -> Job {
    Job {
        id: crate::store::models::new_id(),
        kind,
        campaign_id: campaign_id.to_string(),
        token_id: token_id.map(str::to_string),
        state: JobState::Pending,
        progress: 0,
        error: None,
        input_path: None,
        result_json: None,
        created_at: now_s(),
        started_at: None,
        completed_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embed_job(token: &str) -> Job {
        new_job(JobKind::EmbedImage, "c1", Some(token))
    }

    #[test]
    fn enqueue_and_claim_fifo() {
        let store = Store::open(":memory:").expect("open");
        let mut a = embed_job("t1");
        a.created_at = 100;
        let mut b = embed_job("t2");
        b.created_at = 200;
        assert!(store.enqueue(&a).unwrap());
        assert!(store.enqueue(&b).unwrap());

        let first = store
            .claim_next(&[JobKind::EmbedImage, JobKind::EmbedVideo])
            .unwrap()
            .expect("job");
        assert_eq!(first.id, a.id);
        assert_eq!(first.state, JobState::Running);
        assert!(first.started_at.is_some());

        let second = store.claim_next(&[JobKind::EmbedImage]).unwrap().expect("job");
        assert_eq!(second.id, b.id);
        assert!(store.claim_next(&[JobKind::EmbedImage]).unwrap().is_none());
    }

    #[test]
    fn duplicate_embed_enqueue_is_silent_noop() {
        let store = Store::open(":memory:").expect("open");
        assert!(store.enqueue(&embed_job("t1")).unwrap());
        assert!(!store.enqueue(&embed_job("t1")).unwrap());

        // Claimed (RUNNING) still blocks a duplicate.
        store.claim_next(&[JobKind::EmbedImage]).unwrap().expect("job");
        assert!(!store.enqueue(&embed_job("t1")).unwrap());
    }

    #[test]
    fn detect_jobs_are_never_deduplicated() {
        let store = Store::open(":memory:").expect("open");
        let a = new_job(JobKind::Detect, "account-9", None);
        let b = new_job(JobKind::Detect, "account-9", None);
        assert!(store.enqueue(&a).unwrap());
        assert!(store.enqueue(&b).unwrap());
    }

    #[test]
    fn claim_respects_kind_filter() {
        let store = Store::open(":memory:").expect("open");
        store.enqueue(&new_job(JobKind::Detect, "acct", None)).unwrap();
        assert!(store.claim_next(&[JobKind::EmbedImage]).unwrap().is_none());
        assert!(store.claim_next(&[JobKind::Detect]).unwrap().is_some());
    }

    #[test]
    fn progress_is_clamped_monotone() {
        let store = Store::open(":memory:").expect("open");
        let job = embed_job("t1");
        store.enqueue(&job).unwrap();
        store.claim_next(&[JobKind::EmbedImage]).unwrap();

        store.update_progress(&job.id, 30).unwrap();
        store.update_progress(&job.id, 10).unwrap();
        assert_eq!(store.job(&job.id).unwrap().unwrap().progress, 30);
        store.update_progress(&job.id, 90).unwrap();
        assert_eq!(store.job(&job.id).unwrap().unwrap().progress, 90);
    }

    #[test]
    fn terminal_states_never_transition() {
        let store = Store::open(":memory:").expect("open");
        let job = embed_job("t1");
        store.enqueue(&job).unwrap();
        store.claim_next(&[JobKind::EmbedImage]).unwrap();
        store.complete_job(&job.id).unwrap();

        assert!(matches!(
            store.fail_job(&job.id, "late failure"),
            Err(Error::StoreConflict(_))
        ));
        assert!(matches!(
            store.complete_job(&job.id),
            Err(Error::StoreConflict(_))
        ));

        // A completed row is also not claimable again.
        assert!(store.claim_next(&[JobKind::EmbedImage]).unwrap().is_none());
        let row = store.job(&job.id).unwrap().unwrap();
        assert_eq!(row.state, JobState::Completed);
        assert_eq!(row.progress, 100);
    }

    #[test]
    fn failure_message_is_capped() {
        let store = Store::open(":memory:").expect("open");
        let job = embed_job("t1");
        store.enqueue(&job).unwrap();
        store.fail_job(&job.id, &"x".repeat(2000)).unwrap();
        let row = store.job(&job.id).unwrap().unwrap();
        assert_eq!(row.error.unwrap().len(), 500);
        assert_eq!(row.state, JobState::Failed);
    }

    #[test]
    fn stale_running_jobs_are_visible() {
        let store = Store::open(":memory:").expect("open");
        let job = embed_job("t1");
        store.enqueue(&job).unwrap();
        store.claim_next(&[JobKind::EmbedImage]).unwrap();
        // Fresh claim: not stale yet.
        assert!(store.stale_running_jobs(60).unwrap().is_empty());
        assert_eq!(store.stale_running_jobs(-1).unwrap().len(), 1);
    }
}
