//! Pluggable per-page renderer interface.
//!
//! A renderer turns one page worth of cards into encoded page bytes (JPEG).
//! Every pool worker creates its own renderer through a [`RendererFactory`],
//! so renderers may hold non-shareable state such as a GPU context.

use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::card::{Card, ImageStore};
use crate::pool::{WorkerMessage, WorkerReply};
use crate::settings::ExportSettings;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("missing image {image_id} for card {card_id}")]
    MissingImage { card_id: String, image_id: String },

    #[error("failed to decode page content: {0}")]
    Decode(String),

    #[error("failed to encode page: {0}")]
    Encode(String),

    #[error("failed to create rendering context: {0}")]
    Context(String),

    #[error("failed to spill page to disk: {0}")]
    Spill(#[from] io::Error),

    #[error("render worker terminated")]
    Terminated,
}

/// Everything a renderer needs for one page.
pub struct PageJob<'a> {
    pub page_index: usize,
    pub cards: &'a [Card],
    pub settings: &'a ExportSettings,
    pub images: &'a ImageStore,
}

/// Handle a renderer uses to talk back to the coordinator mid-page.
pub struct RenderContext {
    worker_id: usize,
    page_index: usize,
    events: UnboundedSender<WorkerMessage>,
    shutdown: CancellationToken,
}

impl RenderContext {
    pub(crate) fn new(
        worker_id: usize,
        page_index: usize,
        events: UnboundedSender<WorkerMessage>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            worker_id,
            page_index,
            events,
            shutdown,
        }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Reports how many of this page's images have been processed so far.
    pub fn report_progress(&self, images_processed: usize) {
        let _ = self.events.send(WorkerMessage {
            worker_id: self.worker_id,
            reply: WorkerReply::Progress {
                page_index: self.page_index,
                images_processed,
            },
        });
    }

    /// True once the pool has been terminated; renderers may bail out early.
    pub fn is_terminated(&self) -> bool {
        self.shutdown.is_cancelled() || self.events.is_closed()
    }
}

pub trait PageRenderer: Send {
    fn render(&mut self, job: &PageJob<'_>, ctx: &RenderContext) -> Result<Vec<u8>, RenderError>;
}

/// Creates one renderer per pool worker.
pub trait RendererFactory: Send + Sync {
    fn create(&self, worker_id: usize) -> Result<Box<dyn PageRenderer>, RenderError>;
}

impl<F, R> RendererFactory for F
where
    F: Fn(usize) -> Result<R, RenderError> + Send + Sync,
    R: PageRenderer + 'static,
{
    fn create(&self, worker_id: usize) -> Result<Box<dyn PageRenderer>, RenderError> {
        Ok(Box::new(self(worker_id)?))
    }
}

/// A rendered page waiting for assembly.
///
/// Pages may be spilled to a temporary file to keep large chunks out of
/// memory; the file is removed when the blob is dropped.
#[derive(Debug)]
pub enum PageBlob {
    Memory(Vec<u8>),
    Spilled(NamedTempFile),
}

impl PageBlob {
    pub fn spill(bytes: &[u8], dir: &Path) -> io::Result<Self> {
        let mut file = NamedTempFile::new_in(dir)?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(PageBlob::Spilled(file))
    }

    /// Consumes the blob, returning its bytes and releasing any backing file.
    pub fn into_bytes(self) -> io::Result<Vec<u8>> {
        match self {
            PageBlob::Memory(bytes) => Ok(bytes),
            PageBlob::Spilled(file) => std::fs::read(file.path()),
        }
    }
}
