//! CPU reference page renderer.
//!
//! Lays a page of cards out on the configured grid as an SVG document,
//! rasterizes it with resvg and encodes the bitmap as JPEG.

use std::fmt::Write as _;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use tracing::debug;

use crate::card::Card;
use crate::renderer::{PageJob, PageRenderer, RenderContext, RenderError};
use crate::settings::{ExportSettings, GuideStyle};

/// Length of corner cut marks.
const CORNER_MARK_MM: f64 = 3.0;

/// Opacity of the overlay applied to cards in darken mode.
const DARKEN_OPACITY: f64 = 0.12;

/// Renders pages on the CPU. Holds no state, so every worker gets its own.
#[derive(Debug, Default)]
pub struct GridPageRenderer;

impl GridPageRenderer {
    pub fn new() -> Self {
        Self
    }
}

impl PageRenderer for GridPageRenderer {
    fn render(&mut self, job: &PageJob<'_>, ctx: &RenderContext) -> Result<Vec<u8>, RenderError> {
        let (width, height) = job.settings.page_size_px();
        let svg = compose_page_svg(job, ctx)?;

        let tree = usvg::Tree::from_str(&svg, &usvg::Options::default())
            .map_err(|e| RenderError::Decode(e.to_string()))?;

        let mut pixmap = resvg::tiny_skia::Pixmap::new(width, height).ok_or_else(|| {
            RenderError::Context(format!("cannot allocate {}x{} page bitmap", width, height))
        })?;
        resvg::render(&tree, resvg::tiny_skia::Transform::default(), &mut pixmap.as_mut());

        // The page background is opaque, so premultiplied RGBA is plain RGB.
        let rgb: Vec<u8> = pixmap
            .data()
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect();

        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, job.settings.jpeg_quality.clamp(1, 100))
            .encode(&rgb, width, height, ExtendedColorType::Rgb8)
            .map_err(|e| RenderError::Encode(e.to_string()))?;

        debug!(
            worker_id = ctx.worker_id(),
            page_index = job.page_index,
            cards = job.cards.len(),
            bytes = jpeg.len(),
            "Rendered page"
        );
        Ok(jpeg)
    }
}

/// Pixel rectangle of a card's outer edge (bleed included).
#[derive(Debug, Clone, Copy, PartialEq)]
struct CardRect {
    x: f64,
    y: f64,
    width: f64,
    height: f64,
    bleed: f64,
}

impl CardRect {
    fn trim(&self) -> (f64, f64, f64, f64) {
        (
            self.x + self.bleed,
            self.y + self.bleed,
            self.x + self.width - self.bleed,
            self.y + self.height - self.bleed,
        )
    }
}

/// Places cards row-major on a grid centered on the page.
fn layout(cards: &[Card], settings: &ExportSettings) -> Vec<CardRect> {
    let (page_w, page_h) = settings.page_size_px();
    let (cell_w_mm, cell_h_mm) = cards
        .iter()
        .map(Card::outer_size_mm)
        .fold((0.0_f64, 0.0_f64), |(w, h), (cw, ch)| (w.max(cw), h.max(ch)));

    let columns = settings.columns as usize;
    let rows = settings.rows as usize;
    let cell_w = settings.mm_to_px(cell_w_mm);
    let cell_h = settings.mm_to_px(cell_h_mm);
    let spacing = settings.mm_to_px(settings.spacing_mm);

    let grid_w = columns as f64 * cell_w + (columns.saturating_sub(1)) as f64 * spacing;
    let grid_h = rows as f64 * cell_h + (rows.saturating_sub(1)) as f64 * spacing;
    let origin_x = (f64::from(page_w) - grid_w) / 2.0 + settings.mm_to_px(settings.offset_x_mm);
    let origin_y = (f64::from(page_h) - grid_h) / 2.0 + settings.mm_to_px(settings.offset_y_mm);

    cards
        .iter()
        .enumerate()
        .map(|(i, card)| {
            let (w_mm, h_mm) = card.outer_size_mm();
            let col = i % columns;
            let row = i / columns;
            CardRect {
                x: origin_x + col as f64 * (cell_w + spacing),
                y: origin_y + row as f64 * (cell_h + spacing),
                width: settings.mm_to_px(w_mm),
                height: settings.mm_to_px(h_mm),
                bleed: settings.mm_to_px(card.bleed_mm),
            }
        })
        .collect()
}

fn image_mime(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        Some("image/png")
    } else if bytes.starts_with(&[0xFF, 0xD8]) {
        Some("image/jpeg")
    } else {
        None
    }
}

fn compose_page_svg(job: &PageJob<'_>, ctx: &RenderContext) -> Result<String, RenderError> {
    let settings = job.settings;
    let (width, height) = settings.page_size_px();
    let rects = layout(job.cards, settings);
    let stroke = settings.guide_width_px;

    let mut svg = String::new();
    let _ = write!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" xmlns:xlink="http://www.w3.org/1999/xlink" width="{w}" height="{h}" viewBox="0 0 {w} {h}"><rect x="0" y="0" width="{w}" height="{h}" fill="white"/>"#,
        w = width,
        h = height
    );

    // Full cut lines run underneath the cards so they only show in gutters.
    if settings.guide_style == GuideStyle::FullLines {
        for rect in &rects {
            let (left, top, right, bottom) = rect.trim();
            for x in [left, right] {
                let _ = write!(
                    svg,
                    r#"<line x1="{x:.2}" y1="0" x2="{x:.2}" y2="{height}" stroke="black" stroke-width="{stroke:.2}"/>"#
                );
            }
            for y in [top, bottom] {
                let _ = write!(
                    svg,
                    r#"<line x1="0" y1="{y:.2}" x2="{width}" y2="{y:.2}" stroke="black" stroke-width="{stroke:.2}"/>"#
                );
            }
        }
    }

    for (i, (card, rect)) in job.cards.iter().zip(&rects).enumerate() {
        if ctx.is_terminated() {
            return Err(RenderError::Terminated);
        }

        let bytes = job
            .images
            .get(&card.image_id)
            .ok_or_else(|| RenderError::MissingImage {
                card_id: card.id.clone(),
                image_id: card.image_id.clone(),
            })?;
        let mime = image_mime(bytes).ok_or_else(|| {
            RenderError::Decode(format!("unsupported image format for card {}", card.id))
        })?;

        let _ = write!(
            svg,
            r#"<image x="{:.2}" y="{:.2}" width="{:.2}" height="{:.2}" preserveAspectRatio="none" xlink:href="data:{};base64,{}"/>"#,
            rect.x,
            rect.y,
            rect.width,
            rect.height,
            mime,
            BASE64.encode(bytes)
        );

        if settings.darken {
            let _ = write!(
                svg,
                r#"<rect x="{:.2}" y="{:.2}" width="{:.2}" height="{:.2}" fill="black" fill-opacity="{}"/>"#,
                rect.x, rect.y, rect.width, rect.height, DARKEN_OPACITY
            );
        }

        ctx.report_progress(i + 1);
    }

    if settings.guide_style == GuideStyle::Corners {
        let mark = settings.mm_to_px(CORNER_MARK_MM);
        for rect in &rects {
            let (left, top, right, bottom) = rect.trim();
            for (x, y, dx, dy) in [
                (left, top, -mark, -mark),
                (right, top, mark, -mark),
                (left, bottom, -mark, mark),
                (right, bottom, mark, mark),
            ] {
                let _ = write!(
                    svg,
                    r#"<path d="M {:.2} {:.2} L {:.2} {:.2} M {:.2} {:.2} L {:.2} {:.2}" stroke="black" stroke-width="{:.2}" fill="none"/>"#,
                    x,
                    y,
                    x + dx,
                    y,
                    x,
                    y,
                    x,
                    y + dy,
                    stroke
                );
            }
        }
    }

    svg.push_str("</svg>");
    Ok(svg)
}
