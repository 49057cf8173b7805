//! The export pipeline.
//!
//! Plans pages and chunks, resumes from a stored session when possible,
//! renders chunks one after another through a fresh worker pool each,
//! checkpoints after every chunk and finally merges and delivers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Local;
use tokio::sync::mpsc::unbounded_channel;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cancel::CancellationGate;
use crate::card::{Card, ImageStore};
use crate::chunk::{chunk_count, pages_per_chunk, ChunkPlanner, DEFAULT_MAX_CHUNK_PIXELS};
use crate::coordinator::ChunkCoordinator;
use crate::error::ExportError;
use crate::merger::{export_filename, merge_and_deliver, Delivered, Delivery};
use crate::pages::{page_count, PageGenerator};
use crate::pool::{default_worker_count, RenderWorkerPool, WorkerShared};
use crate::progress::{ProgressCallback, ProgressTracker};
use crate::renderer::RendererFactory;
use crate::session::{resolve_resume, ExportSession, ResumePoint, SessionStore};
use crate::settings::{ExportSettings, SettingsFingerprint};
use crate::telemetry;

/// Tuning knobs that are not part of the export settings.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub max_chunk_pixels: u64,
    /// Overrides the parallelism-derived pool size.
    pub worker_count: Option<usize>,
    /// Spill rendered pages to this directory instead of keeping them in memory.
    pub spill_dir: Option<PathBuf>,
    /// Persist a checkpoint after every completed chunk.
    pub checkpoint_each_chunk: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            max_chunk_pixels: DEFAULT_MAX_CHUNK_PIXELS,
            worker_count: None,
            spill_dir: None,
            checkpoint_each_chunk: true,
        }
    }
}

/// One export: ordered cards, their images and the settings to print with.
pub struct ExportRequest {
    pub cards: Vec<Card>,
    pub images: Arc<ImageStore>,
    pub settings: ExportSettings,
    /// Session to resume, typically taken from an earlier failure.
    pub resume_session_id: Option<String>,
    /// Id to checkpoint under when nothing is resumed; generated when unset.
    pub session_id: Option<String>,
}

/// Summary of a finished export.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportOutcome {
    pub session_id: String,
    pub delivered: Delivered,
    pub page_count: usize,
    pub chunk_count: usize,
    /// Chunks reused from a stored session instead of rendered.
    pub resumed_chunks: usize,
}

pub struct ExportPipeline<S, D> {
    store: S,
    delivery: D,
    renderers: Arc<dyn RendererFactory>,
    options: PipelineOptions,
}

impl<S, D> ExportPipeline<S, D>
where
    S: SessionStore,
    D: Delivery,
{
    pub fn new(store: S, delivery: D, renderers: Arc<dyn RendererFactory>) -> Self {
        Self::with_options(store, delivery, renderers, PipelineOptions::default())
    }

    pub fn with_options(
        store: S,
        delivery: D,
        renderers: Arc<dyn RendererFactory>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            store,
            delivery,
            renderers,
            options,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs an export to completion, cancellation or failure.
    pub async fn run(
        &self,
        request: ExportRequest,
        on_progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> Result<ExportOutcome, ExportError> {
        let ExportRequest {
            cards,
            images,
            settings,
            resume_session_id,
            session_id: requested_session_id,
        } = request;
        settings.validate()?;
        if cards.is_empty() {
            return Err(ExportError::InvalidRequest("no cards to export".to_string()));
        }

        let gate = CancellationGate::new(cancel.clone());
        let started = Instant::now();
        let total_images = cards.len();
        let per_page = settings.cards_per_page();
        let total_pages = page_count(cards.len(), per_page);
        let per_chunk = pages_per_chunk(settings.page_size_px(), self.options.max_chunk_pixels);
        let total_chunks = chunk_count(total_pages, per_chunk);
        let fingerprint = settings.fingerprint();
        let worker_count = self
            .options
            .worker_count
            .unwrap_or_else(default_worker_count)
            .max(1);

        info!(
            cards = total_images,
            pages = total_pages,
            chunks = total_chunks,
            pages_per_chunk = ?per_chunk,
            workers = worker_count,
            "Starting export"
        );

        let mut resume = resolve_resume(
            &self.store,
            resume_session_id.as_deref(),
            &fingerprint,
            total_chunks,
        )
        .await;
        if let (false, Some(id)) = (resume.is_resumed(), requested_session_id) {
            resume = ResumePoint::fresh_as(id);
        }
        let session_id = resume.session_id.clone();
        let resumed_chunks = resume.start_chunk();
        let mut completed = resume.completed_chunks;

        let mut planner = ChunkPlanner::new(PageGenerator::new(cards, per_page), per_chunk);
        let mut progress = ProgressTracker::new(total_images, on_progress);
        progress.skip(planner.fast_forward(resumed_chunks));

        let settings = Arc::new(settings);
        let page_size_pt = settings.page_size_pt();

        for chunk in planner {
            gate.check()?;
            let chunk_index = chunk.index;
            let first_page = chunk.first_page;
            let chunk_pages = chunk.page_count();
            let chunk_images = chunk.card_count();
            let chunk_started = Instant::now();

            let (events_tx, events_rx) = unbounded_channel();
            let shared = Arc::new(WorkerShared {
                settings: settings.clone(),
                images: images.clone(),
                spill_dir: self.options.spill_dir.clone(),
            });
            let pool = RenderWorkerPool::spawn(
                worker_count.min(chunk_pages.max(1)),
                self.renderers.clone(),
                shared,
                events_tx,
            )?;

            let coordinator = ChunkCoordinator::new(
                chunk,
                pool,
                page_size_pt,
                &mut progress,
                cancel.clone(),
            );

            match gate.race(coordinator.run(events_rx)).await? {
                Ok(bytes) => {
                    progress.finish_chunk(chunk_images);
                    completed.push(bytes);
                    telemetry::record_chunk_telemetry(
                        &session_id,
                        chunk_index,
                        chunk_pages,
                        chunk_started.elapsed(),
                    );
                    if self.options.checkpoint_each_chunk {
                        // A failed checkpoint costs resumability, not the export.
                        let _ = self
                            .checkpoint(&session_id, &completed, total_chunks, &fingerprint)
                            .await;
                    }
                }
                Err(failure) => {
                    let failure = failure.offset_pages(first_page);
                    error!(
                        session_id = %session_id,
                        chunk = chunk_index,
                        error = %failure,
                        "Chunk failed"
                    );
                    let resumable = !completed.is_empty()
                        && self
                            .checkpoint(&session_id, &completed, total_chunks, &fingerprint)
                            .await;
                    return Err(failure.into_export_error(resumable, session_id));
                }
            }
        }

        gate.check()?;
        let filename = export_filename(&settings.product_name, Local::now().date_naive());
        let chunk_total = completed.len();
        let delivered = gate
            .race(merge_and_deliver(completed, filename, &self.delivery))
            .await??;

        if let Err(e) = self.store.delete(&session_id).await {
            warn!(session_id = %session_id, error = %format!("{:#}", e), "Failed to remove finished session");
        }

        info!(
            session_id = %session_id,
            pages = total_pages,
            chunks = chunk_total,
            resumed_chunks,
            duration_ms = started.elapsed().as_millis() as u64,
            "Export finished"
        );

        Ok(ExportOutcome {
            session_id,
            delivered,
            page_count: total_pages,
            chunk_count: chunk_total,
            resumed_chunks,
        })
    }

    /// Persists completed chunks; returns whether the session was stored.
    async fn checkpoint(
        &self,
        session_id: &str,
        completed: &[Vec<u8>],
        total_chunks: usize,
        fingerprint: &SettingsFingerprint,
    ) -> bool {
        let session = ExportSession::new(
            session_id.to_string(),
            completed.to_vec(),
            total_chunks,
            fingerprint.clone(),
        );
        match self.store.save(&session).await {
            Ok(()) => {
                info!(
                    session_id = %session_id,
                    completed_chunks = completed.len(),
                    total_chunks,
                    "Checkpoint stored"
                );
                true
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %format!("{:#}", e), "Failed to store checkpoint");
                false
            }
        }
    }
}
