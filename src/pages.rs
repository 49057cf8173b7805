//! Lazy splitting of an ordered card list into pages.

use crate::card::Card;

/// Number of pages needed for `card_count` cards at `per_page` cards each.
pub fn page_count(card_count: usize, per_page: usize) -> usize {
    if per_page == 0 {
        return 0;
    }
    card_count.div_ceil(per_page)
}

/// Single-pass iterator over page-sized groups of cards.
///
/// Consumes its input; build a new generator to iterate again.
pub struct PageGenerator {
    cards: std::vec::IntoIter<Card>,
    per_page: usize,
}

impl PageGenerator {
    pub fn new(cards: Vec<Card>, per_page: usize) -> Self {
        Self {
            cards: cards.into_iter(),
            per_page: per_page.max(1),
        }
    }

    pub fn per_page(&self) -> usize {
        self.per_page
    }
}

impl Iterator for PageGenerator {
    type Item = Vec<Card>;

    fn next(&mut self) -> Option<Self::Item> {
        let page: Vec<Card> = self.cards.by_ref().take(self.per_page).collect();
        if page.is_empty() {
            None
        } else {
            Some(page)
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let pages = page_count(self.cards.len(), self.per_page);
        (pages, Some(pages))
    }
}

impl ExactSizeIterator for PageGenerator {}
