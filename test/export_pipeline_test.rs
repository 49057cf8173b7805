/// Integration tests for the card sheet export pipeline.
///
/// These tests drive whole exports: page and chunk planning, parallel
/// rendering, in-order assembly, checkpointing, resume and cancellation.
///
/// ## Running Tests
///
/// ```bash
/// # No external dependencies
/// cargo test --test export_pipeline_test
///
/// # Redis-backed tests
/// docker run -d -p 6379:6379 redis:7-alpine
/// cargo test --test export_pipeline_test -- --ignored
/// ```

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use cardsheet_export::{
        document::inspect_pages,
        job::{ExportJob, JobStatus},
        merger::{Delivery, FileDelivery},
        pipeline::{ExportPipeline, ExportRequest, PipelineOptions},
        progress::ProgressCallback,
        queue::JobQueue,
        raster::GridPageRenderer,
        renderer::{PageJob, PageRenderer, RenderContext, RenderError},
        session::{MemorySessionStore, SessionStore},
        settings::PageUnit,
        Card, ExportError, ExportSettings, ImageStore,
    };
    use image::codecs::jpeg::JpegEncoder;
    use image::ExtendedColorType;
    use pretty_assertions::assert_eq;
    use redis::Client;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    mockall::mock! {
        Sink {}

        impl Delivery for Sink {
            fn deliver(&self, filename: &str, bytes: &[u8]) -> anyhow::Result<PathBuf>;
        }
    }

    /// Emits a one-row JPEG whose width is the page's first card number + 1,
    /// so page order can be read back from the merged document.
    ///
    /// Earlier pages sleep longer, which makes later pages finish first.
    struct NumberedRenderer {
        fail_on: Option<u32>,
        page_delay: Duration,
    }

    impl PageRenderer for NumberedRenderer {
        fn render(&mut self, job: &PageJob<'_>, ctx: &RenderContext) -> Result<Vec<u8>, RenderError> {
            let first = card_number(&job.cards[0]);
            std::thread::sleep(self.page_delay.saturating_sub(Duration::from_millis(u64::from(first))));
            if self.fail_on == Some(first) {
                return Err(RenderError::Decode(format!("corrupt image for card {}", first)));
            }
            ctx.report_progress(job.cards.len());

            let width = first + 1;
            let mut out = Vec::new();
            JpegEncoder::new_with_quality(&mut out, 80)
                .encode(&vec![120u8; width as usize * 3], width, 1, ExtendedColorType::Rgb8)
                .map_err(|e| RenderError::Encode(e.to_string()))?;
            Ok(out)
        }
    }

    /// Cancels `token` as soon as it starts on the page led by card `at`.
    struct CancellingRenderer {
        inner: NumberedRenderer,
        at: u32,
        token: CancellationToken,
    }

    impl PageRenderer for CancellingRenderer {
        fn render(&mut self, job: &PageJob<'_>, ctx: &RenderContext) -> Result<Vec<u8>, RenderError> {
            if card_number(&job.cards[0]) == self.at {
                self.token.cancel();
            }
            self.inner.render(job, ctx)
        }
    }

    /// Records the first card number of every page it renders.
    struct RecordingRenderer {
        inner: NumberedRenderer,
        log: Arc<Mutex<Vec<u32>>>,
    }

    impl PageRenderer for RecordingRenderer {
        fn render(&mut self, job: &PageJob<'_>, ctx: &RenderContext) -> Result<Vec<u8>, RenderError> {
            self.log.lock().unwrap().push(card_number(&job.cards[0]));
            self.inner.render(job, ctx)
        }
    }

    fn card_number(card: &Card) -> u32 {
        card.id.trim_start_matches("card-").parse().unwrap()
    }

    fn cards(n: usize) -> Vec<Card> {
        (0..n)
            .map(|i| Card::standard(format!("card-{}", i), format!("img-{}", i)))
            .collect()
    }

    /// 3x3 grid on a 1in page at 10 DPI: 100 pixels per page.
    fn settings() -> ExportSettings {
        ExportSettings {
            product_name: "deck".to_string(),
            page_width: 1.0,
            page_height: 1.0,
            page_unit: PageUnit::In,
            dpi: 10,
            ..ExportSettings::default()
        }
    }

    /// Two pages per chunk with the 100 pixel pages above.
    fn options() -> PipelineOptions {
        PipelineOptions {
            max_chunk_pixels: 200,
            worker_count: Some(3),
            ..PipelineOptions::default()
        }
    }

    fn request(cards: Vec<Card>, settings: ExportSettings, resume: Option<String>) -> ExportRequest {
        ExportRequest {
            cards,
            images: Arc::new(ImageStore::new()),
            settings,
            resume_session_id: resume,
            session_id: None,
        }
    }

    fn recorder() -> (ProgressCallback, Arc<Mutex<Vec<f64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (Arc::new(move |p: f64| sink.lock().unwrap().push(p)), seen)
    }

    /// Delivery that keeps the merged bytes for inspection.
    fn capturing_sink() -> (MockSink, Arc<Mutex<Vec<u8>>>) {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let store = captured.clone();
        let mut sink = MockSink::new();
        sink.expect_deliver().times(1).returning(move |name, bytes| {
            *store.lock().unwrap() = bytes.to_vec();
            Ok(PathBuf::from("/downloads").join(name))
        });
        (sink, captured)
    }

    fn page_widths(pdf: &[u8]) -> Vec<i64> {
        inspect_pages(pdf).unwrap().iter().map(|p| p.image_width).collect()
    }

    /// All three pages in one chunk, spilled to `dir`.
    fn spilling_options(dir: &TempDir) -> PipelineOptions {
        PipelineOptions {
            max_chunk_pixels: 300,
            worker_count: Some(3),
            spill_dir: Some(dir.path().to_path_buf()),
            ..PipelineOptions::default()
        }
    }

    /// Workers that outlive a chunk drop their spilled pages shortly after,
    /// so give the directory a moment to drain.
    async fn assert_drained(dir: &TempDir) {
        for _ in 0..100 {
            if std::fs::read_dir(dir.path()).unwrap().next().is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let left: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        panic!("spilled pages left behind: {:?}", left);
    }

    /// 25 cards on a 3x3 grid: pages [9, 9, 7] in chunks [0, 1] and [2],
    /// merged in card order regardless of completion order.
    #[tokio::test]
    async fn test_export_preserves_card_order() {
        let (sink, captured) = capturing_sink();
        let pipeline = ExportPipeline::with_options(
            MemorySessionStore::new(),
            sink,
            Arc::new(|_worker: usize| {
                Ok::<_, RenderError>(NumberedRenderer {
                    fail_on: None,
                    page_delay: Duration::from_millis(30),
                })
            }),
            options(),
        );
        let (on_progress, seen) = recorder();

        let outcome = pipeline
            .run(request(cards(25), settings(), None), on_progress, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.page_count, 3);
        assert_eq!(outcome.chunk_count, 2);
        assert!(outcome.delivered.filename.starts_with("deck_"));
        assert_eq!(page_widths(&captured.lock().unwrap()), vec![1, 10, 19]);

        let seen = seen.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert!(seen.iter().all(|p| (0.0..=100.0).contains(p)));
        assert_eq!(seen.last().copied(), Some(100.0));
    }

    /// A page error aborts its chunk, leaves a checkpoint of the prior chunk
    /// and a retry with the session id renders only what is missing.
    #[tokio::test]
    async fn test_failure_checkpoints_and_resume_completes() {
        let store = MemorySessionStore::new();
        let failing = Arc::new(AtomicBool::new(true));

        let flag = failing.clone();
        let renderers = Arc::new(move |_worker: usize| {
            Ok::<_, RenderError>(NumberedRenderer {
                fail_on: flag.load(Ordering::SeqCst).then_some(18),
                page_delay: Duration::from_millis(5),
            })
        });

        let mut first_sink = MockSink::new();
        first_sink.expect_deliver().times(0);
        let first = ExportPipeline::with_options(store.clone(), first_sink, renderers.clone(), options());

        let err = first
            .run(request(cards(25), settings(), None), Arc::new(|_: f64| {}), CancellationToken::new())
            .await
            .unwrap_err();

        let session_id = match &err {
            ExportError::Render {
                page_index,
                resumable,
                session_id,
                ..
            } => {
                assert_eq!(*page_index, Some(2));
                assert!(*resumable);
                session_id.clone()
            }
            other => panic!("expected a render failure, got {:?}", other),
        };

        let stored = store.load(&session_id).await.unwrap().unwrap();
        assert_eq!(stored.completed_chunks.len(), 1);
        assert_eq!(stored.last_completed_chunk_index, Some(0));
        assert_eq!(stored.total_chunks, 2);
        assert_eq!(page_widths(&stored.completed_chunks[0]), vec![1, 10]);

        failing.store(false, Ordering::SeqCst);
        let (sink, captured) = capturing_sink();
        let second = ExportPipeline::with_options(store.clone(), sink, renderers, options());
        let (on_progress, seen) = recorder();

        let outcome = second
            .run(
                request(cards(25), settings(), Some(session_id.clone())),
                on_progress,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.session_id, session_id);
        assert_eq!(outcome.resumed_chunks, 1);
        assert_eq!(page_widths(&captured.lock().unwrap()), vec![1, 10, 19]);
        // Resumed progress starts from the 18 cards already exported.
        let first_reported = seen.lock().unwrap()[0];
        assert!((first_reported - 72.0).abs() < 1e-9);
        assert!(store.load(&session_id).await.unwrap().is_none());
    }

    /// A failure in the very first chunk has nothing to resume from.
    #[tokio::test]
    async fn test_failure_in_first_chunk_is_not_resumable() {
        let mut sink = MockSink::new();
        sink.expect_deliver().times(0);
        let pipeline = ExportPipeline::with_options(
            MemorySessionStore::new(),
            sink,
            Arc::new(|_worker: usize| {
                Ok::<_, RenderError>(NumberedRenderer {
                    fail_on: Some(9),
                    page_delay: Duration::ZERO,
                })
            }),
            options(),
        );

        let err = pipeline
            .run(request(cards(25), settings(), None), Arc::new(|_: f64| {}), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(!err.is_resumable());
        assert_eq!(err.page_index(), Some(1));
        assert_eq!(pipeline.store().len().await, 0);
    }

    /// Changed settings invalidate a stored session; the export restarts
    /// from chunk 0 and the stale session is removed.
    #[tokio::test]
    async fn test_resume_with_changed_settings_starts_fresh() {
        let store = MemorySessionStore::new();
        let renderers = Arc::new(|_worker: usize| {
            Ok::<_, RenderError>(NumberedRenderer {
                fail_on: Some(18),
                page_delay: Duration::ZERO,
            })
        });
        let mut failing_sink = MockSink::new();
        failing_sink.expect_deliver().times(0);
        let err = ExportPipeline::with_options(store.clone(), failing_sink, renderers, options())
            .run(request(cards(25), settings(), None), Arc::new(|_: f64| {}), CancellationToken::new())
            .await
            .unwrap_err();
        let stale = err.session_id().unwrap().to_string();
        assert_eq!(store.len().await, 1);

        let (sink, captured) = capturing_sink();
        let pipeline = ExportPipeline::with_options(
            store.clone(),
            sink,
            Arc::new(|_worker: usize| {
                Ok::<_, RenderError>(NumberedRenderer {
                    fail_on: None,
                    page_delay: Duration::ZERO,
                })
            }),
            options(),
        );
        let changed = ExportSettings {
            darken: true,
            ..settings()
        };

        let outcome = pipeline
            .run(request(cards(25), changed, Some(stale.clone())), Arc::new(|_: f64| {}), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.resumed_chunks, 0);
        assert_ne!(outcome.session_id, stale);
        assert_eq!(page_widths(&captured.lock().unwrap()), vec![1, 10, 19]);
        assert_eq!(store.len().await, 0);
    }

    /// Cancelling mid-export reports the cancellation tag and never delivers.
    #[tokio::test]
    async fn test_cancellation_stops_export() {
        let mut sink = MockSink::new();
        sink.expect_deliver().times(0);
        let pipeline = ExportPipeline::with_options(
            MemorySessionStore::new(),
            sink,
            Arc::new(|_worker: usize| {
                Ok::<_, RenderError>(NumberedRenderer {
                    fail_on: None,
                    page_delay: Duration::from_millis(200),
                })
            }),
            PipelineOptions {
                max_chunk_pixels: 100,
                worker_count: Some(1),
                ..PipelineOptions::default()
            },
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = pipeline
            .run(request(cards(25), settings(), None), Arc::new(|_: f64| {}), cancel)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(pipeline.store().len().await, 0);
    }

    /// A job interrupted between chunks is resumed under the id it was
    /// given, without rendering the checkpointed chunk again.
    #[tokio::test]
    async fn test_interrupted_export_resumes_under_given_session() {
        let store = MemorySessionStore::new();
        let cancel = CancellationToken::new();

        let mut first_sink = MockSink::new();
        first_sink.expect_deliver().times(0);
        let trigger = cancel.clone();
        let first = ExportPipeline::with_options(
            store.clone(),
            first_sink,
            Arc::new(move |_worker: usize| {
                Ok::<_, RenderError>(CancellingRenderer {
                    inner: NumberedRenderer {
                        fail_on: None,
                        page_delay: Duration::from_millis(5),
                    },
                    at: 18,
                    token: trigger.clone(),
                })
            }),
            options(),
        );

        let err = first
            .run(
                ExportRequest {
                    session_id: Some("job-session".to_string()),
                    ..request(cards(25), settings(), None)
                },
                Arc::new(|_: f64| {}),
                cancel,
            )
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        let stored = store.load("job-session").await.unwrap().unwrap();
        assert_eq!(stored.completed_chunks.len(), 1);

        let (sink, captured) = capturing_sink();
        let rendered = Arc::new(Mutex::new(Vec::new()));
        let log = rendered.clone();
        let second = ExportPipeline::with_options(
            store.clone(),
            sink,
            Arc::new(move |_worker: usize| {
                Ok::<_, RenderError>(RecordingRenderer {
                    inner: NumberedRenderer {
                        fail_on: None,
                        page_delay: Duration::ZERO,
                    },
                    log: log.clone(),
                })
            }),
            options(),
        );

        let outcome = second
            .run(
                ExportRequest {
                    session_id: Some("job-session".to_string()),
                    ..request(cards(25), settings(), Some("job-session".to_string()))
                },
                Arc::new(|_: f64| {}),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.session_id, "job-session");
        assert_eq!(outcome.resumed_chunks, 1);
        assert_eq!(*rendered.lock().unwrap(), vec![18]);
        assert_eq!(page_widths(&captured.lock().unwrap()), vec![1, 10, 19]);
        assert!(store.load("job-session").await.unwrap().is_none());
    }

    /// A requested id is used for fresh runs too, so the first checkpoint
    /// lands where the caller expects it.
    #[tokio::test]
    async fn test_failure_checkpoints_under_given_session() {
        let mut sink = MockSink::new();
        sink.expect_deliver().times(0);
        let pipeline = ExportPipeline::with_options(
            MemorySessionStore::new(),
            sink,
            Arc::new(|_worker: usize| {
                Ok::<_, RenderError>(NumberedRenderer {
                    fail_on: Some(18),
                    page_delay: Duration::ZERO,
                })
            }),
            options(),
        );

        let err = pipeline
            .run(
                ExportRequest {
                    session_id: Some("job-session".to_string()),
                    ..request(cards(25), settings(), None)
                },
                Arc::new(|_: f64| {}),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.session_id(), Some("job-session"));
        assert!(err.is_resumable());
        assert!(pipeline.store().load("job-session").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_spilled_pages_are_removed_after_export() {
        let dir = TempDir::new().unwrap();
        let (sink, captured) = capturing_sink();
        let pipeline = ExportPipeline::with_options(
            MemorySessionStore::new(),
            sink,
            Arc::new(|_worker: usize| {
                Ok::<_, RenderError>(NumberedRenderer {
                    fail_on: None,
                    page_delay: Duration::from_millis(30),
                })
            }),
            spilling_options(&dir),
        );

        let outcome = pipeline
            .run(request(cards(25), settings(), None), Arc::new(|_: f64| {}), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.chunk_count, 1);
        assert_eq!(page_widths(&captured.lock().unwrap()), vec![1, 10, 19]);
        assert_drained(&dir).await;
    }

    /// Later pages finish and spill before the first page fails.
    #[tokio::test]
    async fn test_spilled_pages_are_removed_after_page_failure() {
        let dir = TempDir::new().unwrap();
        let mut sink = MockSink::new();
        sink.expect_deliver().times(0);
        let pipeline = ExportPipeline::with_options(
            MemorySessionStore::new(),
            sink,
            Arc::new(|_worker: usize| {
                Ok::<_, RenderError>(NumberedRenderer {
                    fail_on: Some(0),
                    page_delay: Duration::from_millis(60),
                })
            }),
            spilling_options(&dir),
        );

        let err = pipeline
            .run(request(cards(25), settings(), None), Arc::new(|_: f64| {}), CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.page_index(), Some(0));
        assert_drained(&dir).await;
    }

    /// Cancelling once the last page has reported leaves the earlier pages
    /// still rendering; nothing they spill may survive.
    #[tokio::test]
    async fn test_spilled_pages_are_removed_after_cancellation() {
        let dir = TempDir::new().unwrap();
        let mut sink = MockSink::new();
        sink.expect_deliver().times(0);
        let pipeline = ExportPipeline::with_options(
            MemorySessionStore::new(),
            sink,
            Arc::new(|_worker: usize| {
                Ok::<_, RenderError>(NumberedRenderer {
                    fail_on: None,
                    page_delay: Duration::from_millis(60),
                })
            }),
            spilling_options(&dir),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let err = pipeline
            .run(
                request(cards(25), settings(), None),
                Arc::new(move |percent: f64| {
                    if percent > 0.0 {
                        trigger.cancel();
                    }
                }),
                cancel,
            )
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_drained(&dir).await;
    }

    /// Real rasterizer and file delivery: a 2x2 sheet of small cards.
    #[tokio::test]
    async fn test_grid_renderer_writes_pdf_file() {
        let dir = TempDir::new().unwrap();
        let mut png = Vec::new();
        image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(8, 8, image::Rgb([200, 30, 30])))
            .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let mut images = ImageStore::new();
        images.insert("art", png);

        let cards: Vec<Card> = (0..5)
            .map(|i| Card {
                width_mm: 20.0,
                height_mm: 20.0,
                ..Card::standard(format!("card-{}", i), "art")
            })
            .collect();
        let settings = ExportSettings {
            product_name: "minis".to_string(),
            page_width: 2.0,
            page_height: 2.0,
            page_unit: PageUnit::In,
            columns: 2,
            rows: 2,
            dpi: 20,
            ..ExportSettings::default()
        };

        let pipeline = ExportPipeline::new(
            MemorySessionStore::new(),
            FileDelivery::new(dir.path()),
            Arc::new(|_worker: usize| Ok::<_, RenderError>(GridPageRenderer::new())),
        );

        let outcome = pipeline
            .run(
                ExportRequest {
                    cards,
                    images: Arc::new(images),
                    settings,
                    resume_session_id: None,
                    session_id: None,
                },
                Arc::new(|_: f64| {}),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.page_count, 2);
        assert!(outcome.delivered.location.starts_with(dir.path()));
        let pages = inspect_pages(&std::fs::read(&outcome.delivered.location).unwrap()).unwrap();
        assert_eq!(pages.len(), 2);
        assert!(pages.iter().all(|p| p.media_box == (144.0, 144.0)));
        assert!(pages.iter().all(|p| p.image_width == 40 && p.image_height == 40));
    }

    /// Jobs round-trip through the Redis queue.
    ///
    /// Requires Redis running on localhost:6379.
    #[tokio::test]
    #[ignore]
    async fn test_queue_integration() {
        let client = Client::open("redis://127.0.0.1/").unwrap();
        let conn = redis::aio::ConnectionManager::new(client).await.unwrap();
        let mut queue = JobQueue::new(conn);

        let job = ExportJob::new(
            settings(),
            cards(3),
            HashMap::from([("img-0".to_string(), PathBuf::from("/tmp/img-0.png"))]),
        );

        queue.enqueue(&job).await.unwrap();

        let dequeued = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(dequeued.job_id, job.job_id);
        assert_eq!(dequeued.cards, job.cards);
        assert_eq!(dequeued.status, JobStatus::Queued);
    }
}
