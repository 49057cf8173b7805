//! Grouping pages into memory-bounded chunks.
//!
//! Each chunk becomes one intermediate PDF, so the pixel budget caps how
//! many rendered pages are held at once. Chunking never changes page order.

use crate::card::Card;

/// Default per-chunk pixel budget (2^28 pixels, about 31 letter pages at 300 DPI).
pub const DEFAULT_MAX_CHUNK_PIXELS: u64 = 1 << 28;

/// Pages per chunk for the given page bitmap size and pixel budget.
///
/// Returns `None` when chunking is unbounded: a zero budget or a page with
/// no pixel area.
pub fn pages_per_chunk(page_size_px: (u32, u32), max_chunk_pixels: u64) -> Option<usize> {
    let pixels_per_page = u64::from(page_size_px.0) * u64::from(page_size_px.1);
    if pixels_per_page == 0 || max_chunk_pixels == 0 {
        return None;
    }
    let pages = (max_chunk_pixels / pixels_per_page).max(1);
    Some(usize::try_from(pages).unwrap_or(usize::MAX))
}

/// Number of chunks for `total_pages`; unbounded chunking yields one chunk.
pub fn chunk_count(total_pages: usize, pages_per_chunk: Option<usize>) -> usize {
    match pages_per_chunk {
        Some(per_chunk) if per_chunk > 0 => total_pages.div_ceil(per_chunk),
        _ => usize::from(total_pages > 0),
    }
}

/// A run of consecutive pages rendered into one intermediate document.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub index: usize,
    /// Global index of this chunk's first page.
    pub first_page: usize,
    pub pages: Vec<Vec<Card>>,
}

impl Chunk {
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn card_count(&self) -> usize {
        self.pages.iter().map(Vec::len).sum()
    }
}

/// Pulls pages from a page iterator a chunk at a time.
pub struct ChunkPlanner<I> {
    pages: I,
    pages_per_chunk: Option<usize>,
    next_index: usize,
    next_page: usize,
}

impl<I> ChunkPlanner<I>
where
    I: Iterator<Item = Vec<Card>>,
{
    pub fn new(pages: I, pages_per_chunk: Option<usize>) -> Self {
        Self {
            pages,
            pages_per_chunk,
            next_index: 0,
            next_page: 0,
        }
    }

    pub fn pages_per_chunk(&self) -> Option<usize> {
        self.pages_per_chunk
    }

    /// Skips `chunks` chunks without collecting them, returning how many
    /// cards were skipped.
    pub fn fast_forward(&mut self, chunks: usize) -> usize {
        let mut cards = 0;
        for _ in 0..chunks {
            match self.next() {
                Some(chunk) => cards += chunk.card_count(),
                None => break,
            }
        }
        cards
    }
}

impl<I> Iterator for ChunkPlanner<I>
where
    I: Iterator<Item = Vec<Card>>,
{
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        let pages: Vec<Vec<Card>> = match self.pages_per_chunk {
            Some(per_chunk) => self.pages.by_ref().take(per_chunk.max(1)).collect(),
            None => self.pages.by_ref().collect(),
        };
        if pages.is_empty() {
            return None;
        }

        let chunk = Chunk {
            index: self.next_index,
            first_page: self.next_page,
            pages,
        };
        self.next_index += 1;
        self.next_page += chunk.page_count();
        Some(chunk)
    }
}
