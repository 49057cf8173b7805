//! Per-chunk coordination of render workers and in-order page assembly.
//!
//! A [`ChunkCoordinator`] owns every piece of mutable coordination state for
//! one chunk: the task queue, the worker pool, the pending result map and
//! the assembly cursor. Worker messages are handled one at a time from a
//! single channel, so none of that state is shared.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunk::Chunk;
use crate::document::ChunkDocument;
use crate::error::ChunkFailure;
use crate::pool::{RenderTask, RenderWorkerPool, WorkerMessage, WorkerReply};
use crate::progress::ProgressTracker;
use crate::renderer::PageBlob;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Idle,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for ChunkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkState::Idle => write!(f, "idle"),
            ChunkState::Running => write!(f, "running"),
            ChunkState::Completed => write!(f, "completed"),
            ChunkState::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of handling one worker message.
#[derive(Debug)]
pub enum Step {
    Continue,
    Completed(Vec<u8>),
}

pub struct ChunkCoordinator<'a> {
    chunk_index: usize,
    page_count: usize,
    /// Card count of each page, indexed by chunk-local page index.
    page_cards: Vec<usize>,
    queue: VecDeque<RenderTask>,
    pool: RenderWorkerPool,
    pending: BTreeMap<usize, PageBlob>,
    next_page: usize,
    document: Option<ChunkDocument>,
    progress: &'a mut ProgressTracker,
    cancel: CancellationToken,
    state: ChunkState,
}

impl<'a> ChunkCoordinator<'a> {
    pub fn new(
        chunk: Chunk,
        pool: RenderWorkerPool,
        page_size_pt: (f64, f64),
        progress: &'a mut ProgressTracker,
        cancel: CancellationToken,
    ) -> Self {
        let page_cards = chunk.pages.iter().map(Vec::len).collect();
        let queue: VecDeque<RenderTask> = chunk
            .pages
            .into_iter()
            .enumerate()
            .map(|(page_index, cards)| RenderTask { page_index, cards })
            .collect();

        Self {
            chunk_index: chunk.index,
            page_count: queue.len(),
            page_cards,
            queue,
            pool,
            pending: BTreeMap::new(),
            next_page: 0,
            document: Some(ChunkDocument::new(page_size_pt)),
            progress,
            cancel,
            state: ChunkState::Idle,
        }
    }

    pub fn state(&self) -> ChunkState {
        self.state
    }

    /// Pages embedded into the chunk document so far.
    pub fn assembled_pages(&self) -> usize {
        self.next_page
    }

    /// Pages rendered but waiting for a lower-indexed page.
    pub fn pending_pages(&self) -> Vec<usize> {
        self.pending.keys().copied().collect()
    }

    pub fn queued_pages(&self) -> usize {
        self.queue.len()
    }

    /// Drives the chunk to completion, returning the serialized document.
    pub async fn run(
        mut self,
        mut events: UnboundedReceiver<WorkerMessage>,
    ) -> Result<Vec<u8>, ChunkFailure> {
        self.state = ChunkState::Running;
        info!(
            chunk = self.chunk_index,
            pages = self.page_count,
            workers = self.pool.size(),
            "Chunk started"
        );

        if self.page_count == 0 {
            return self.finalize();
        }

        while let Some(message) = events.recv().await {
            if let Step::Completed(bytes) = self.handle(message)? {
                return Ok(bytes);
            }
        }

        Err(self.fail(ChunkFailure::Render {
            page_index: None,
            message: "all render workers exited before the chunk completed".to_string(),
        }))
    }

    /// Handles a single worker message.
    pub fn handle(&mut self, message: WorkerMessage) -> Result<Step, ChunkFailure> {
        let worker_id = message.worker_id;
        match message.reply {
            WorkerReply::Ready => {
                self.pool.mark_ready(worker_id);
                self.dispatch();
                Ok(Step::Continue)
            }
            WorkerReply::Progress {
                page_index,
                images_processed,
            } => {
                self.progress.record(page_index, images_processed);
                Ok(Step::Continue)
            }
            WorkerReply::PageComplete { page_index, page } => {
                self.pool.release(worker_id);
                if page_index < self.next_page
                    || page_index >= self.page_count
                    || self.pending.contains_key(&page_index)
                {
                    warn!(
                        chunk = self.chunk_index,
                        page_index, worker_id, "Ignoring unexpected page result"
                    );
                    self.dispatch();
                    return Ok(Step::Continue);
                }

                self.pending.insert(page_index, page);
                self.progress
                    .record(page_index, self.page_cards[page_index]);

                if let Some(bytes) = self.assemble()? {
                    return Ok(Step::Completed(bytes));
                }
                self.dispatch();
                Ok(Step::Continue)
            }
            WorkerReply::Error { page_index, error } => {
                warn!(
                    chunk = self.chunk_index,
                    worker_id,
                    page_index = ?page_index,
                    error = %error,
                    "Render worker reported an error"
                );
                Err(self.fail(ChunkFailure::Render {
                    page_index,
                    message: error,
                }))
            }
        }
    }

    /// Assigns queued tasks to idle workers.
    fn dispatch(&mut self) {
        if self.cancel.is_cancelled() {
            return;
        }
        while self.pool.has_idle() {
            let Some(task) = self.queue.pop_front() else {
                break;
            };
            let page_index = task.page_index;
            match self.pool.assign(task) {
                Ok(worker_id) => {
                    debug!(chunk = self.chunk_index, page_index, worker_id, "Assigned page");
                }
                Err(task) => {
                    self.queue.push_front(task);
                    break;
                }
            }
        }
    }

    /// Embeds every pending page that is next in order.
    fn assemble(&mut self) -> Result<Option<Vec<u8>>, ChunkFailure> {
        while let Some(page) = self.pending.remove(&self.next_page) {
            let page_index = self.next_page;
            let embedded = match page.into_bytes() {
                Ok(bytes) => match self.document.as_mut() {
                    Some(document) => document.embed_jpeg(&bytes),
                    None => Err("chunk document already finalized".to_string()),
                },
                Err(e) => Err(format!("failed to read rendered page: {}", e)),
            };
            if let Err(message) = embedded {
                return Err(self.fail(ChunkFailure::Assembly {
                    page_index,
                    message,
                }));
            }

            self.next_page += 1;
            debug!(chunk = self.chunk_index, page_index, "Embedded page");
        }

        if self.next_page == self.page_count {
            return self.finalize().map(Some);
        }
        Ok(None)
    }

    fn finalize(&mut self) -> Result<Vec<u8>, ChunkFailure> {
        self.pool.terminate();
        let last_page = self.page_count.saturating_sub(1);
        let serialized = match self.document.take() {
            Some(document) => document.finish(),
            None => Err("chunk document already finalized".to_string()),
        };

        match serialized {
            Ok(bytes) => {
                self.state = ChunkState::Completed;
                info!(
                    chunk = self.chunk_index,
                    pages = self.page_count,
                    bytes = bytes.len(),
                    "Chunk completed"
                );
                Ok(bytes)
            }
            Err(message) => Err(self.fail(ChunkFailure::Assembly {
                page_index: last_page,
                message,
            })),
        }
    }

    /// Tears the chunk down: stops workers and releases every pending page.
    fn fail(&mut self, failure: ChunkFailure) -> ChunkFailure {
        self.pool.terminate();
        self.pending.clear();
        self.queue.clear();
        self.document = None;
        self.progress.abandon_chunk();
        self.state = ChunkState::Failed;
        failure
    }
}
