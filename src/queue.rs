//! Redis-based job queue for card sheet export jobs.

use crate::job::ExportJob;
use anyhow::{Context, Result};
use redis::{aio::ConnectionManager, AsyncCommands};
use tracing::{debug, error, info};

/// Queue name for export jobs.
const QUEUE_KEY: &str = "cardsheet:export:pdf:queue";

/// Status key prefix for job status tracking.
const STATUS_KEY_PREFIX: &str = "cardsheet:export:pdf:status";

/// Cancellation flag key prefix.
const CANCEL_KEY_PREFIX: &str = "cardsheet:export:pdf:cancel";

/// Job TTL in seconds (24 hours).
const JOB_TTL_SECONDS: u64 = 86400;

/// Redis-based job queue manager.
///
/// Jobs are stored as JSON in a Redis list, with separate status keys for
/// client polling and cancellation flags clients set to stop a running job.
#[derive(Clone)]
pub struct JobQueue {
    /// Redis connection manager for async operations.
    pub conn: ConnectionManager,
}

fn status_key(job_id: &str) -> String {
    format!("{}:{}", STATUS_KEY_PREFIX, job_id)
}

fn cancel_key(job_id: &str) -> String {
    format!("{}:{}", CANCEL_KEY_PREFIX, job_id)
}

impl JobQueue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Enqueues an export job and publishes its status.
    ///
    /// The status key expires after 24 hours.
    pub async fn enqueue(&mut self, job: &ExportJob) -> Result<()> {
        let job_json = serde_json::to_string(job).context("Failed to serialize job")?;

        // RPUSH for FIFO order
        self.conn
            .rpush::<_, _, ()>(QUEUE_KEY, &job_json)
            .await
            .context("Failed to push job to queue")?;

        self.conn
            .set_ex::<_, _, ()>(status_key(&job.job_id), &job_json, JOB_TTL_SECONDS)
            .await
            .context("Failed to set job status")?;

        info!(
            job_id = %job.job_id,
            cards = job.cards.len(),
            resume_session_id = ?job.resume_session_id,
            "Enqueued export job"
        );

        Ok(())
    }

    /// Dequeues the next job, waiting up to 5 seconds.
    ///
    /// Returns `Ok(None)` if no job arrived within the timeout window.
    pub async fn dequeue(&mut self) -> Result<Option<ExportJob>> {
        let result: Option<(String, String)> = self
            .conn
            .blpop(QUEUE_KEY, 5.0)
            .await
            .context("Failed to pop job from queue")?;

        match result {
            Some((_key, job_json)) => {
                let job: ExportJob =
                    serde_json::from_str(&job_json).context("Failed to deserialize job")?;

                debug!(job_id = %job.job_id, "Dequeued job");
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// Writes the job state to its status key, which clients poll.
    pub async fn update_status(&mut self, job: &ExportJob) -> Result<()> {
        let job_json = serde_json::to_string(job).context("Failed to serialize job status")?;

        self.conn
            .set_ex::<_, _, ()>(status_key(&job.job_id), &job_json, JOB_TTL_SECONDS)
            .await
            .context("Failed to update job status")?;

        debug!(
            job_id = %job.job_id,
            status = %job.status,
            progress = job.progress,
            "Updated job status"
        );
        Ok(())
    }

    pub async fn get_status(&mut self, job_id: &str) -> Result<Option<ExportJob>> {
        let job_json: Option<String> = self
            .conn
            .get(status_key(job_id))
            .await
            .context("Failed to get job status")?;

        match job_json {
            Some(json) => {
                let job: ExportJob =
                    serde_json::from_str(&json).context("Failed to deserialize job status")?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// Flags a job for cancellation. Workers poll the flag while it runs.
    pub async fn request_cancel(&mut self, job_id: &str) -> Result<()> {
        self.conn
            .set_ex::<_, _, ()>(cancel_key(job_id), 1, JOB_TTL_SECONDS)
            .await
            .context("Failed to set cancellation flag")?;

        info!(job_id = %job_id, "Cancellation requested");
        Ok(())
    }

    pub async fn is_cancel_requested(&mut self, job_id: &str) -> Result<bool> {
        let flagged: bool = self
            .conn
            .exists(cancel_key(job_id))
            .await
            .context("Failed to check cancellation flag")?;
        Ok(flagged)
    }

    pub async fn clear_cancel(&mut self, job_id: &str) -> Result<()> {
        self.conn
            .del::<_, ()>(cancel_key(job_id))
            .await
            .context("Failed to clear cancellation flag")?;
        Ok(())
    }

    /// Re-enqueues a failed job if it has retries left.
    ///
    /// Returns `Ok(false)` once the retry limit is exhausted; the final
    /// failed state is still published.
    pub async fn retry_job(&mut self, mut job: ExportJob) -> Result<bool> {
        if job.retry() {
            self.enqueue(&job).await?;
            Ok(true)
        } else {
            self.update_status(&job).await?;
            error!(
                job_id = %job.job_id,
                error = ?job.error,
                "Job failed after max retries"
            );
            Ok(false)
        }
    }

    pub async fn queue_length(&mut self) -> Result<usize> {
        let len: usize = self
            .conn
            .llen(QUEUE_KEY)
            .await
            .context("Failed to get queue length")?;
        Ok(len)
    }
}
