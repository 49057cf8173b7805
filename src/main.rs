//! Card Sheet Export Worker Service
//!
//! This worker consumes card sheet export jobs from a Redis queue and runs
//! them through the chunked render and assembly pipeline.
//!
//! ## Architecture
//!
//! - **Queue**: Redis list (`cardsheet:export:pdf:queue`)
//! - **Status**: Redis keys (`cardsheet:export:pdf:status:{job_id}`)
//! - **Cancellation**: Redis keys (`cardsheet:export:pdf:cancel:{job_id}`)
//! - **Checkpoints**: Redis keys (`cardsheet:export:session:{session_id}`)
//! - **Telemetry**: OpenTelemetry OTLP export
//!
//! See [`WorkerConfig`] for the environment variables read at startup.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cardsheet_export::config::WorkerConfig;
use cardsheet_export::job::ExportJob;
use cardsheet_export::merger::FileDelivery;
use cardsheet_export::pipeline::{ExportPipeline, ExportRequest};
use cardsheet_export::progress::ProgressCallback;
use cardsheet_export::queue::JobQueue;
use cardsheet_export::raster::GridPageRenderer;
use cardsheet_export::renderer::{RenderError, RendererFactory};
use cardsheet_export::session::{RedisSessionStore, SessionStore};
use cardsheet_export::telemetry;
use cardsheet_export::ImageStore;
use redis::Client;
use tokio::signal;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type Pipeline = ExportPipeline<RedisSessionStore, FileDelivery>;

/// How often a running job checks its cancellation flag.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = telemetry::init_telemetry() {
        warn!("Failed to initialize telemetry: {}", e);
    }

    info!("Starting card sheet export worker service");

    let config = WorkerConfig::from_env();
    info!(
        redis_url = %config.redis_url,
        concurrency = config.concurrency,
        output_dir = %config.output_dir.display(),
        max_chunk_pixels = config.max_chunk_pixels,
        render_workers = ?config.render_workers,
        spill_pages = config.spill_pages,
        "Configuration loaded"
    );

    let client = Client::open(config.redis_url.as_str()).context("Failed to create Redis client")?;
    let conn = redis::aio::ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")?;

    info!("Connected to Redis");

    let renderers: Arc<dyn RendererFactory> =
        Arc::new(|_worker_id: usize| Ok::<_, RenderError>(GridPageRenderer::new()));
    let pipeline = Arc::new(ExportPipeline::with_options(
        RedisSessionStore::new(conn.clone()),
        FileDelivery::new(config.output_dir.clone()),
        renderers,
        config.pipeline_options(),
    ));
    let shutdown = CancellationToken::new();

    let mut handles = vec![];
    for worker_id in 0..config.concurrency {
        let queue = JobQueue::new(conn.clone());
        let pipeline = pipeline.clone();
        let shutdown = shutdown.clone();

        handles.push(tokio::spawn(async move {
            worker_loop(worker_id, queue, pipeline, shutdown).await
        }));
    }

    info!("Worker service ready, press Ctrl+C to shutdown");
    signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;

    info!("Received shutdown signal, stopping running exports...");
    shutdown.cancel();

    for handle in handles {
        let _ = handle.await;
    }

    info!("Worker service shutdown complete");
    Ok(())
}

/// Pulls jobs from the queue one at a time until shutdown.
async fn worker_loop(
    worker_id: usize,
    mut queue: JobQueue,
    pipeline: Arc<Pipeline>,
    shutdown: CancellationToken,
) {
    info!(worker_id, "Worker started");
    let mut processed = 0usize;

    loop {
        let dequeued = tokio::select! {
            _ = shutdown.cancelled() => break,
            dequeued = queue.dequeue() => dequeued,
        };

        let job = match dequeued {
            Ok(Some(job)) => job,
            Ok(None) => continue,
            Err(e) => {
                error!(worker_id, error = %format!("{:#}", e), "Failed to dequeue job");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        process_job(job, &mut queue, &pipeline, &shutdown).await;

        processed += 1;
        if processed % 10 == 0 {
            if let Ok(queue_len) = queue.queue_length().await {
                telemetry::record_worker_heartbeat(queue_len);
            }
        }
    }

    info!(worker_id, "Worker stopped");
}

/// Runs a single export job through its lifecycle.
///
/// 1. Mark job as processing
/// 2. Load card images
/// 3. Run the pipeline with progress and cancellation wired to Redis
/// 4. Mark job as complete, cancelled or failed
/// 5. Retry retryable failures, resuming from the checkpoint when possible
async fn process_job(
    mut job: ExportJob,
    queue: &mut JobQueue,
    pipeline: &Pipeline,
    shutdown: &CancellationToken,
) {
    info!(
        job_id = %job.job_id,
        cards = job.cards.len(),
        resume_session_id = ?job.resume_session_id,
        retry_count = job.retry_count,
        "Processing job"
    );

    job.start_processing();
    if let Err(e) = queue.update_status(&job).await {
        error!(job_id = %job.job_id, error = %format!("{:#}", e), "Failed to update job status");
    }

    let images = match ImageStore::load_files(&job.image_paths).await {
        Ok(images) => Arc::new(images),
        Err(e) => {
            job.mark_failed(format!("{:#}", e));
            finish_job(&mut job, queue).await;
            return;
        }
    };

    let cancel = shutdown.child_token();
    let poller = tokio::spawn(poll_cancellation(
        queue.clone(),
        job.job_id.clone(),
        cancel.clone(),
    ));

    let (progress_tx, progress_rx) = watch::channel(0.0);
    let on_progress: ProgressCallback = Arc::new(move |percent: f64| {
        let _ = progress_tx.send(percent);
    });
    let reporter = tokio::spawn(report_progress(queue.clone(), job.clone(), progress_rx));

    let session_id = job.begin_session();
    let result = pipeline
        .run(
            ExportRequest {
                cards: job.cards.clone(),
                images,
                settings: job.settings.clone(),
                resume_session_id: job.resume_session_id.clone(),
                session_id: Some(session_id.clone()),
            },
            on_progress,
            cancel.clone(),
        )
        .await;

    poller.abort();
    if let Ok(progress) = reporter.await {
        job.set_progress(progress);
    }

    match result {
        Ok(outcome) => {
            job.mark_complete(outcome.session_id, outcome.delivered.location);
            finish_job(&mut job, queue).await;
        }
        Err(e) if e.is_cancelled() && shutdown.is_cancelled() => {
            // Interrupted by shutdown rather than by the user: hand it back.
            job.requeue_interrupted();
            info!(job_id = %job.job_id, session_id = %session_id, "Re-queueing interrupted job");
            if let Err(e) = queue.enqueue(&job).await {
                error!(job_id = %job.job_id, error = %format!("{:#}", e), "Failed to re-queue interrupted job");
            }
        }
        Err(e) if e.is_cancelled() => {
            if let Err(e) = pipeline.store().delete(&session_id).await {
                warn!(job_id = %job.job_id, error = %format!("{:#}", e), "Failed to drop cancelled session");
            }
            job.mark_cancelled();
            finish_job(&mut job, queue).await;
        }
        Err(e) => {
            error!(job_id = %job.job_id, error = %e, resumable = e.is_resumable(), "Job failed");
            job.record_failure(&e);

            if ExportJob::is_retryable(&e) {
                match queue.retry_job(job.clone()).await {
                    Ok(true) => info!(
                        job_id = %job.job_id,
                        retry_count = job.retry_count + 1,
                        resume_session_id = ?job.resume_session_id,
                        "Job re-queued for retry"
                    ),
                    Ok(false) => warn!(job_id = %job.job_id, "Job failed permanently, max retries exceeded"),
                    Err(e) => error!(job_id = %job.job_id, error = %format!("{:#}", e), "Failed to retry job"),
                }
                telemetry::record_job_telemetry(&job);
            } else {
                finish_job(&mut job, queue).await;
            }
        }
    }

    if let Err(e) = queue.clear_cancel(&job.job_id).await {
        warn!(job_id = %job.job_id, error = %format!("{:#}", e), "Failed to clear cancellation flag");
    }
}

/// Publishes the final job state and records telemetry.
async fn finish_job(job: &mut ExportJob, queue: &mut JobQueue) {
    if let Err(e) = queue.update_status(job).await {
        error!(job_id = %job.job_id, error = %format!("{:#}", e), "Failed to update job status");
    }
    telemetry::record_job_telemetry(job);
}

/// Cancels `token` once the job's cancellation flag appears.
async fn poll_cancellation(mut queue: JobQueue, job_id: String, token: CancellationToken) {
    let mut interval = tokio::time::interval(CANCEL_POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = interval.tick() => {}
        }
        match queue.is_cancel_requested(&job_id).await {
            Ok(true) => {
                info!(job_id = %job_id, "Cancelling job on request");
                token.cancel();
                return;
            }
            Ok(false) => {}
            Err(e) => warn!(job_id = %job_id, error = %format!("{:#}", e), "Failed to poll cancellation flag"),
        }
    }
}

/// Mirrors pipeline progress into the job status key until the pipeline
/// drops its callback. Returns the last percentage seen.
async fn report_progress(
    mut queue: JobQueue,
    mut job: ExportJob,
    mut progress: watch::Receiver<f64>,
) -> f64 {
    while progress.changed().await.is_ok() {
        let percent = *progress.borrow_and_update();
        if job.set_progress(percent) {
            if let Err(e) = queue.update_status(&job).await {
                warn!(job_id = %job.job_id, error = %format!("{:#}", e), "Failed to publish progress");
            }
        }
    }
    job.progress
}
