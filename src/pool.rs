//! Pool of isolated page-rendering workers.
//!
//! Each worker is an OS thread that owns its renderer. The pool sends work
//! over a per-worker channel; workers answer on a single event channel the
//! coordinator drains. A worker only takes new work after it has answered
//! its current task with a result or an error.

use std::any::Any;
use std::io;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use tokio::sync::mpsc::error::SendError;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::card::{Card, ImageStore};
use crate::renderer::{PageBlob, PageJob, RenderContext, RenderError, RendererFactory};
use crate::settings::ExportSettings;

/// One page of work, identified by its chunk-local index.
#[derive(Debug, Clone)]
pub struct RenderTask {
    pub page_index: usize,
    pub cards: Vec<Card>,
}

#[derive(Debug)]
pub enum WorkerReply {
    /// The worker created its renderer and can accept tasks.
    Ready,
    Progress {
        page_index: usize,
        images_processed: usize,
    },
    PageComplete {
        page_index: usize,
        page: PageBlob,
    },
    /// `page_index` is `None` when the renderer could not be created.
    Error {
        page_index: Option<usize>,
        error: String,
    },
}

#[derive(Debug)]
pub struct WorkerMessage {
    pub worker_id: usize,
    pub reply: WorkerReply,
}

/// Read-only inputs every worker of a pool shares.
pub struct WorkerShared {
    pub settings: Arc<ExportSettings>,
    pub images: Arc<ImageStore>,
    /// Directory for spilled page blobs; pages stay in memory when unset.
    pub spill_dir: Option<PathBuf>,
}

impl WorkerShared {
    fn blob(&self, bytes: Vec<u8>) -> Result<PageBlob, RenderError> {
        match &self.spill_dir {
            Some(dir) => Ok(PageBlob::spill(&bytes, dir)?),
            None => Ok(PageBlob::Memory(bytes)),
        }
    }
}

/// Default pool size: `floor(log2(available_parallelism)) + 1`.
pub fn default_worker_count() -> usize {
    let parallelism = thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1);
    worker_count_for(parallelism)
}

/// Sub-linear worker count for a given parallelism.
pub fn worker_count_for(parallelism: usize) -> usize {
    parallelism.max(1).ilog2() as usize + 1
}

struct WorkerSlot {
    tasks: Option<UnboundedSender<RenderTask>>,
    ready: bool,
    busy: bool,
}

impl WorkerSlot {
    fn is_idle(&self) -> bool {
        self.tasks.is_some() && self.ready && !self.busy
    }
}

pub struct RenderWorkerPool {
    slots: Vec<WorkerSlot>,
    shutdown: CancellationToken,
}

impl RenderWorkerPool {
    /// Spawns `size` workers, each creating its own renderer.
    ///
    /// The pool keeps no clone of `events`: once every worker has exited the
    /// receiving side observes a closed channel.
    pub fn spawn(
        size: usize,
        factory: Arc<dyn RendererFactory>,
        shared: Arc<WorkerShared>,
        events: UnboundedSender<WorkerMessage>,
    ) -> io::Result<Self> {
        let shutdown = CancellationToken::new();
        let mut slots = Vec::with_capacity(size);

        for worker_id in 0..size {
            let (task_tx, task_rx) = unbounded_channel();
            let factory = factory.clone();
            let shared = shared.clone();
            let events = events.clone();
            let shutdown = shutdown.clone();

            thread::Builder::new()
                .name(format!("render-worker-{}", worker_id))
                .spawn(move || {
                    worker_main(worker_id, factory, shared, task_rx, events, shutdown)
                })?;

            slots.push(WorkerSlot {
                tasks: Some(task_tx),
                ready: false,
                busy: false,
            });
        }

        debug!(workers = size, "Render worker pool started");
        Ok(Self { slots, shutdown })
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn has_idle(&self) -> bool {
        self.slots.iter().any(WorkerSlot::is_idle)
    }

    pub fn busy_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.busy).count()
    }

    /// Number of workers that can still take or finish work.
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.tasks.is_some()).count()
    }

    pub fn mark_ready(&mut self, worker_id: usize) {
        if let Some(slot) = self.slots.get_mut(worker_id) {
            slot.ready = true;
        }
    }

    /// Marks a worker idle after it answered its current task.
    pub fn release(&mut self, worker_id: usize) {
        if let Some(slot) = self.slots.get_mut(worker_id) {
            slot.busy = false;
        }
    }

    /// Hands `task` to the first idle worker, returning its id.
    ///
    /// Gives the task back when no worker is idle.
    pub fn assign(&mut self, mut task: RenderTask) -> Result<usize, RenderTask> {
        for (worker_id, slot) in self.slots.iter_mut().enumerate() {
            if !slot.is_idle() {
                continue;
            }
            let Some(sender) = &slot.tasks else {
                continue;
            };
            match sender.send(task) {
                Ok(()) => {
                    slot.busy = true;
                    return Ok(worker_id);
                }
                Err(SendError(returned)) => {
                    // The worker thread is gone.
                    slot.tasks = None;
                    task = returned;
                }
            }
        }
        Err(task)
    }

    /// Stops every worker without waiting for in-flight renders.
    pub fn terminate(&mut self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        for slot in &mut self.slots {
            slot.tasks = None;
            slot.busy = false;
        }
        debug!(workers = self.slots.len(), "Render worker pool terminated");
    }

    pub fn is_terminated(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for RenderWorkerPool {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn worker_main(
    worker_id: usize,
    factory: Arc<dyn RendererFactory>,
    shared: Arc<WorkerShared>,
    mut tasks: UnboundedReceiver<RenderTask>,
    events: UnboundedSender<WorkerMessage>,
    shutdown: CancellationToken,
) {
    let send = |reply: WorkerReply| events.send(WorkerMessage { worker_id, reply }).is_ok();

    let mut renderer = match factory.create(worker_id) {
        Ok(renderer) => renderer,
        Err(e) => {
            error!(worker_id, error = %e, "Failed to create page renderer");
            send(WorkerReply::Error {
                page_index: None,
                error: e.to_string(),
            });
            return;
        }
    };

    if !send(WorkerReply::Ready) {
        return;
    }

    while let Some(task) = tasks.blocking_recv() {
        if shutdown.is_cancelled() {
            break;
        }

        let ctx = RenderContext::new(worker_id, task.page_index, events.clone(), shutdown.clone());
        let job = PageJob {
            page_index: task.page_index,
            cards: &task.cards,
            settings: &shared.settings,
            images: &shared.images,
        };

        let rendered = panic::catch_unwind(AssertUnwindSafe(|| renderer.render(&job, &ctx)));
        let bytes = match rendered {
            Ok(bytes) => bytes,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(worker_id, page_index = task.page_index, error = %message, "Page renderer panicked");
                // A renderer that panicked is not reused.
                send(WorkerReply::Error {
                    page_index: Some(task.page_index),
                    error: format!("renderer panicked: {}", message),
                });
                break;
            }
        };
        if shutdown.is_cancelled() {
            break;
        }

        let reply = match bytes.and_then(|bytes| shared.blob(bytes)) {
            Ok(page) => WorkerReply::PageComplete {
                page_index: task.page_index,
                page,
            },
            Err(e) => WorkerReply::Error {
                page_index: Some(task.page_index),
                error: e.to_string(),
            },
        };

        if shutdown.is_cancelled() || !send(reply) {
            break;
        }
    }

    debug!(worker_id, "Render worker exiting");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
