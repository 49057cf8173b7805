//! Final merge of chunk documents and delivery of the result.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing::info;

use crate::document::merge_documents;
use crate::error::ExportError;

/// Hands the finished document to whoever asked for it.
#[cfg_attr(test, mockall::automock)]
pub trait Delivery: Send + Sync {
    /// Delivers `bytes` under `filename`, returning where it ended up.
    fn deliver(&self, filename: &str, bytes: &[u8]) -> Result<PathBuf>;
}

/// Writes exports into a directory, never overwriting an earlier file.
#[derive(Debug, Clone)]
pub struct FileDelivery {
    output_dir: PathBuf,
}

impl FileDelivery {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn free_path(&self, filename: &str) -> PathBuf {
        let candidate = self.output_dir.join(filename);
        if !candidate.exists() {
            return candidate;
        }
        let path = Path::new(filename);
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(filename);
        let ext = path.extension().and_then(|s| s.to_str());
        (1..)
            .map(|n| {
                let name = match ext {
                    Some(ext) => format!("{} ({}).{}", stem, n, ext),
                    None => format!("{} ({})", stem, n),
                };
                self.output_dir.join(name)
            })
            .find(|p| !p.exists())
            .unwrap_or(candidate)
    }
}

impl Delivery for FileDelivery {
    fn deliver(&self, filename: &str, bytes: &[u8]) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.output_dir).with_context(|| {
            format!("Failed to create output directory {}", self.output_dir.display())
        })?;
        let path = self.free_path(filename);
        std::fs::write(&path, bytes)
            .with_context(|| format!("Failed to write export to {}", path.display()))?;
        Ok(path)
    }
}

/// `<product>_<YYYY-MM-DD>.pdf`
pub fn export_filename(product: &str, date: NaiveDate) -> String {
    format!("{}_{}.pdf", product, date.format("%Y-%m-%d"))
}

/// Result of a delivered export.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivered {
    pub filename: String,
    pub location: PathBuf,
    pub bytes: usize,
}

/// Merges `chunks` in order and delivers the combined document.
///
/// The merge runs on the blocking pool; chunk buffers are released once the
/// merge has produced the final bytes.
pub async fn merge_and_deliver<D>(
    chunks: Vec<Vec<u8>>,
    filename: String,
    delivery: &D,
) -> Result<Delivered, ExportError>
where
    D: Delivery + ?Sized,
{
    let chunk_count = chunks.len();
    let merged = tokio::task::spawn_blocking(move || merge_documents(&chunks))
        .await
        .map_err(|e| ExportError::Merge(format!("merge task failed: {}", e)))??;

    let location = delivery
        .deliver(&filename, &merged)
        .map_err(|e| ExportError::Delivery(format!("{:#}", e)))?;

    info!(
        filename = %filename,
        location = %location.display(),
        chunks = chunk_count,
        bytes = merged.len(),
        "Export delivered"
    );

    Ok(Delivered {
        filename,
        location,
        bytes: merged.len(),
    })
}
