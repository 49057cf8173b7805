//! Telemetry and structured logging for the export worker.

use std::time::Duration;

use crate::job::{ExportJob, JobStatus};
use opentelemetry::trace::{Span, Tracer};
use opentelemetry::{global, KeyValue};
use tracing::{debug, info, warn};

const TRACER_NAME: &str = "cardsheet-export-worker";

/// Jobs slower than this are logged as warnings.
const SLOW_JOB_MS: i64 = 60_000;

/// Records a span and log line for a finished job.
///
/// Covers duration, status, retry count, session and error details.
pub fn record_job_telemetry(job: &ExportJob) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("export_job");

    span.set_attribute(KeyValue::new("job_id", job.job_id.clone()));
    span.set_attribute(KeyValue::new("status", job.status.to_string()));
    span.set_attribute(KeyValue::new("retry_count", job.retry_count as i64));
    span.set_attribute(KeyValue::new("card_count", job.cards.len() as i64));
    span.set_attribute(KeyValue::new(
        "product_name",
        job.settings.product_name.clone(),
    ));
    if let Some(ref session_id) = job.session_id {
        span.set_attribute(KeyValue::new("session_id", session_id.clone()));
    }

    if let Some(duration_ms) = job.processing_duration_ms() {
        span.set_attribute(KeyValue::new("duration_ms", duration_ms));

        info!(
            job_id = %job.job_id,
            duration_ms = duration_ms,
            status = %job.status,
            cards = job.cards.len(),
            "Export job finished"
        );

        if duration_ms > SLOW_JOB_MS {
            warn!(
                job_id = %job.job_id,
                duration_ms = duration_ms,
                "Export exceeded performance threshold ({}ms)",
                SLOW_JOB_MS
            );
        }
    }

    if job.status == JobStatus::Failed {
        if let Some(ref error) = job.error {
            span.set_attribute(KeyValue::new("error", error.clone()));
            span.set_attribute(KeyValue::new(
                "resumable",
                job.resume_session_id.is_some(),
            ));
            warn!(
                job_id = %job.job_id,
                error = %error,
                retry_count = job.retry_count,
                "Export job failed"
            );
        }
    }

    span.end();
}

/// Records a span for a chunk that finished rendering and assembly.
pub fn record_chunk_telemetry(session_id: &str, chunk_index: usize, pages: usize, elapsed: Duration) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("export_chunk");

    let elapsed_ms = elapsed.as_millis() as i64;
    span.set_attribute(KeyValue::new("session_id", session_id.to_string()));
    span.set_attribute(KeyValue::new("chunk_index", chunk_index as i64));
    span.set_attribute(KeyValue::new("page_count", pages as i64));
    span.set_attribute(KeyValue::new("duration_ms", elapsed_ms));
    span.end();

    debug!(
        session_id = %session_id,
        chunk = chunk_index,
        pages = pages,
        duration_ms = elapsed_ms,
        "Chunk completed"
    );
}

/// Records a worker heartbeat for monitoring worker health.
pub fn record_worker_heartbeat(queue_length: usize) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("worker_heartbeat");

    span.set_attribute(KeyValue::new("queue_length", queue_length as i64));
    span.end();

    info!(queue_length = queue_length, "Worker heartbeat");
}

/// Initializes OpenTelemetry with the OTLP exporter.
///
/// Call once at worker startup, inside the Tokio runtime. Reads:
/// - `OTEL_EXPORTER_OTLP_ENDPOINT` - Collector endpoint (default: http://localhost:4317)
/// - `OTEL_SERVICE_NAME` - Service name (default: cardsheet-export-worker)
pub fn init_telemetry() -> Result<(), Box<dyn std::error::Error>> {
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::Config;

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    let service_name =
        std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| TRACER_NAME.to_string());

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(&endpoint),
        )
        .with_trace_config(Config::default().with_resource(
            opentelemetry_sdk::Resource::new(vec![
                KeyValue::new("service.name", service_name),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ]),
        ))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    if let Some(provider) = tracer.provider() {
        global::set_tracer_provider(provider);
    }

    info!(endpoint = %endpoint, "Telemetry initialized");
    Ok(())
}
