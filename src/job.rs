//! Job models and state management for the export queue.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::card::Card;
use crate::error::ExportError;
use crate::session::new_session_id;
use crate::settings::ExportSettings;

/// Card sheet export job request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportJob {
    pub job_id: String,
    pub settings: ExportSettings,
    pub cards: Vec<Card>,
    /// Image id to image file.
    pub image_paths: HashMap<String, PathBuf>,
    /// Session a retry resumes from.
    pub resume_session_id: Option<String>,
    /// Session of the most recent run.
    pub session_id: Option<String>,
    pub status: JobStatus,
    pub retry_count: u8,
    pub progress: f64,
    pub output_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Complete,
    Failed,
    Cancelled,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Complete => write!(f, "complete"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl ExportJob {
    const MAX_RETRIES: u8 = 3;

    pub fn new(
        settings: ExportSettings,
        cards: Vec<Card>,
        image_paths: HashMap<String, PathBuf>,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4().to_string(),
            settings,
            cards,
            image_paths,
            resume_session_id: None,
            session_id: None,
            status: JobStatus::Queued,
            retry_count: 0,
            progress: 0.0,
            output_path: None,
            created_at: now,
            updated_at: now,
            error: None,
        }
    }

    /// Session id this attempt checkpoints under: the one being resumed,
    /// or a new one.
    pub fn begin_session(&mut self) -> String {
        let session_id = self
            .resume_session_id
            .clone()
            .unwrap_or_else(new_session_id);
        self.session_id = Some(session_id.clone());
        session_id
    }

    /// Hands an attempt interrupted by shutdown back to the queue, pointed at
    /// whatever it checkpointed.
    pub fn requeue_interrupted(&mut self) {
        self.status = JobStatus::Queued;
        self.resume_session_id = self.session_id.clone();
        self.updated_at = Utc::now();
    }

    pub fn start_processing(&mut self) {
        self.status = JobStatus::Processing;
        self.updated_at = Utc::now();
    }

    /// Returns true if the stored progress moved.
    pub fn set_progress(&mut self, percent: f64) -> bool {
        if percent <= self.progress {
            return false;
        }
        self.progress = percent.min(100.0);
        self.updated_at = Utc::now();
        true
    }

    pub fn mark_complete(&mut self, session_id: String, output_path: PathBuf) {
        self.status = JobStatus::Complete;
        self.progress = 100.0;
        self.session_id = Some(session_id);
        self.output_path = Some(output_path);
        self.resume_session_id = None;
        self.updated_at = Utc::now();
        self.error = None;
    }

    pub fn mark_cancelled(&mut self) {
        self.status = JobStatus::Cancelled;
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = JobStatus::Failed;
        self.updated_at = Utc::now();
        self.error = Some(error);
    }

    /// Records an export failure; a resumable one points the next attempt
    /// at its checkpoint.
    pub fn record_failure(&mut self, error: &ExportError) {
        if let Some(session_id) = error.session_id() {
            self.session_id = Some(session_id.to_string());
        }
        self.resume_session_id = if error.is_resumable() {
            error.session_id().map(str::to_string)
        } else {
            None
        };
        self.mark_failed(error.to_string());
    }

    /// Whether a failure is worth another attempt.
    pub fn is_retryable(error: &ExportError) -> bool {
        !matches!(
            error,
            ExportError::Cancelled | ExportError::InvalidRequest(_)
        )
    }

    pub fn retry(&mut self) -> bool {
        if self.retry_count < Self::MAX_RETRIES {
            self.retry_count += 1;
            self.status = JobStatus::Queued;
            self.progress = 0.0;
            self.updated_at = Utc::now();
            true
        } else {
            self.mark_failed("Max retries exceeded".to_string());
            false
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            JobStatus::Complete | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn processing_duration_ms(&self) -> Option<i64> {
        if self.is_finished() {
            Some(
                self.updated_at
                    .signed_duration_since(self.created_at)
                    .num_milliseconds(),
            )
        } else {
            None
        }
    }
}
