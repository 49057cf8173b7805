//! Worker service configuration from environment variables.

use std::path::PathBuf;

use crate::chunk::DEFAULT_MAX_CHUNK_PIXELS;
use crate::pipeline::PipelineOptions;

/// Settings read once at worker startup.
///
/// - `REDIS_URL`: Redis connection string (default: redis://127.0.0.1/)
/// - `WORKER_CONCURRENCY`: concurrent export jobs (default: 2)
/// - `EXPORT_OUTPUT_DIR`: where finished exports are written (default: ./exports)
/// - `EXPORT_MAX_CHUNK_PIXELS`: pixel budget per chunk, 0 for unbounded
/// - `EXPORT_RENDER_WORKERS`: render threads per chunk (default: derived from parallelism)
/// - `EXPORT_SPILL_PAGES`: spill rendered pages to temp files (default: false)
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub redis_url: String,
    pub concurrency: usize,
    pub output_dir: PathBuf,
    pub max_chunk_pixels: u64,
    pub render_workers: Option<usize>,
    pub spill_pages: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1/".to_string(),
            concurrency: 2,
            output_dir: PathBuf::from("exports"),
            max_chunk_pixels: DEFAULT_MAX_CHUNK_PIXELS,
            render_workers: None,
            spill_pages: false,
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from `lookup`; unparsable values fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            concurrency: lookup("WORKER_CONCURRENCY")
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.concurrency),
            output_dir: lookup("EXPORT_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            max_chunk_pixels: lookup("EXPORT_MAX_CHUNK_PIXELS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_chunk_pixels),
            render_workers: lookup("EXPORT_RENDER_WORKERS")
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0),
            spill_pages: lookup("EXPORT_SPILL_PAGES")
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(defaults.spill_pages),
        }
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            max_chunk_pixels: self.max_chunk_pixels,
            worker_count: self.render_workers,
            spill_dir: self.spill_pages.then(std::env::temp_dir),
            checkpoint_each_chunk: true,
        }
    }
}
