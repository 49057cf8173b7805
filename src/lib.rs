//! Card Sheet Export Library
//!
//! Renders ordered cards onto printable grid pages in parallel and
//! assembles them into a single PDF. Pages are grouped into memory-bounded
//! chunks; every finished chunk is checkpointed so an interrupted export can
//! resume where it stopped.
//!
//! ## Module Overview
//!
//! - `settings`, `card`: export inputs
//! - `pages`, `chunk`: page and chunk planning
//! - `renderer`, `raster`: the page renderer seam and the grid rasterizer
//! - `pool`: isolated render worker threads
//! - `coordinator`: per-chunk dispatch and in-order assembly
//! - `document`: chunk PDFs and the final merge
//! - `session`: checkpoints and resume decisions
//! - `merger`: merge and delivery of the finished file
//! - `pipeline`: the export driver tying the above together
//! - `job`, `queue`, `config`, `telemetry`: the Redis-backed worker service
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cardsheet_export::{
//!     merger::FileDelivery,
//!     pipeline::{ExportPipeline, ExportRequest},
//!     raster::GridPageRenderer,
//!     renderer::RenderError,
//!     session::MemorySessionStore,
//!     Card, ExportSettings, ImageStore,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut images = ImageStore::new();
//!     images.insert("dragon", std::fs::read("dragon.png").unwrap());
//!
//!     let pipeline = ExportPipeline::new(
//!         MemorySessionStore::new(),
//!         FileDelivery::new("exports"),
//!         Arc::new(|_worker: usize| Ok::<_, RenderError>(GridPageRenderer::new())),
//!     );
//!
//!     let outcome = pipeline
//!         .run(
//!             ExportRequest {
//!                 cards: vec![Card::standard("card-1", "dragon")],
//!                 images: Arc::new(images),
//!                 settings: ExportSettings::default(),
//!                 resume_session_id: None,
//!                 session_id: None,
//!             },
//!             Arc::new(|percent: f64| println!("{percent:.0}%")),
//!             CancellationToken::new(),
//!         )
//!         .await
//!         .unwrap();
//!
//!     println!("wrote {}", outcome.delivered.location.display());
//! }
//! ```

pub mod cancel;
pub mod card;
pub mod chunk;
pub mod config;
pub mod coordinator;
pub mod document;
pub mod error;
pub mod job;
pub mod merger;
pub mod pages;
pub mod pipeline;
pub mod pool;
pub mod progress;
pub mod queue;
pub mod raster;
pub mod renderer;
pub mod session;
pub mod settings;
pub mod telemetry;

pub use card::{Card, ImageStore};
pub use error::ExportError;
pub use settings::ExportSettings;
