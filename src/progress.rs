//! Export-wide progress aggregation.

use std::collections::HashMap;
use std::sync::Arc;

/// Receives the overall export percentage, non-decreasing within `[0, 100]`.
pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Aggregates per-page image counters into an overall percentage.
///
/// Counters are keyed by chunk-local page index and reset at every chunk
/// boundary; images of finished chunks are folded into a running total.
pub struct ProgressTracker {
    total_images: usize,
    completed_images: usize,
    page_images: HashMap<usize, usize>,
    last_reported: f64,
    callback: ProgressCallback,
}

impl ProgressTracker {
    pub fn new(total_images: usize, callback: ProgressCallback) -> Self {
        Self {
            total_images,
            completed_images: 0,
            page_images: HashMap::new(),
            last_reported: 0.0,
            callback,
        }
    }

    /// Counts images already done by an earlier run.
    pub fn skip(&mut self, images: usize) {
        self.completed_images += images;
        self.report();
    }

    /// Records a page counter. Counters never move backwards.
    pub fn record(&mut self, page_index: usize, images_processed: usize) {
        let counter = self.page_images.entry(page_index).or_insert(0);
        if images_processed <= *counter {
            return;
        }
        *counter = images_processed;
        self.report();
    }

    /// Folds the finished chunk into the running total.
    pub fn finish_chunk(&mut self, chunk_images: usize) {
        self.page_images.clear();
        self.completed_images += chunk_images;
        self.report();
    }

    /// Drops per-page counters of a chunk that did not finish.
    pub fn abandon_chunk(&mut self) {
        self.page_images.clear();
    }

    pub fn percent(&self) -> f64 {
        if self.total_images == 0 {
            return 100.0;
        }
        let in_flight: usize = self.page_images.values().sum();
        let done = (self.completed_images + in_flight) as f64;
        (done / self.total_images as f64 * 100.0).clamp(0.0, 100.0)
    }

    pub fn last_reported(&self) -> f64 {
        self.last_reported
    }

    fn report(&mut self) {
        let percent = self.percent();
        if percent > self.last_reported {
            self.last_reported = percent;
            (self.callback)(percent);
        }
    }
}
