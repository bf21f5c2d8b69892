use shared::protocol::{ChatHistoryMeta, PageDirection};

use crate::types::AUTO_FILL_CEILING;

fn slot(direction: PageDirection) -> usize {
    match direction {
        PageDirection::Past => 0,
        PageDirection::Future => 1,
    }
}

/// In-flight and exhaustion bookkeeping for history fetches.
///
/// Concurrent fetches in the same direction are deduplicated by the
/// per-direction in-flight flag; exhausted directions turn `load_more`
/// into a no-op rather than an error.
#[derive(Debug, Default)]
pub struct PageTracker {
    loading_initial: bool,
    in_flight: [bool; 2],
    exhausted: [bool; 2],
}

impl PageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the initial fetch; `false` when one is already running.
    pub fn begin_initial(&mut self) -> bool {
        if self.loading_initial {
            return false;
        }
        self.loading_initial = true;
        true
    }

    /// Record the initial page result. A non-anchored fetch returning fewer
    /// than `page_size` messages means the channel has no further history.
    pub fn finish_initial(
        &mut self,
        meta: &ChatHistoryMeta,
        returned: usize,
        page_size: u32,
        anchored: bool,
    ) {
        self.loading_initial = false;
        self.exhausted[slot(PageDirection::Past)] =
            !meta.can_load_more_past || (!anchored && returned < page_size as usize);
        self.exhausted[slot(PageDirection::Future)] = !meta.can_load_more_future;
    }

    pub fn abort_initial(&mut self) {
        self.loading_initial = false;
    }

    /// Claim a directional fetch; `false` when it must be skipped (already
    /// in flight, exhausted, or the initial load is still running).
    pub fn begin(&mut self, direction: PageDirection) -> bool {
        let slot = slot(direction);
        if self.loading_initial || self.in_flight[slot] || self.exhausted[slot] {
            return false;
        }
        self.in_flight[slot] = true;
        true
    }

    /// Record a directional page result; an empty page exhausts the
    /// direction regardless of what the metadata claims.
    pub fn finish(&mut self, direction: PageDirection, meta: &ChatHistoryMeta, merged: usize) {
        let can_load_more = match direction {
            PageDirection::Past => meta.can_load_more_past,
            PageDirection::Future => meta.can_load_more_future,
        };
        let slot = slot(direction);
        self.in_flight[slot] = false;
        self.exhausted[slot] = !can_load_more || merged == 0;
    }

    pub fn abort(&mut self, direction: PageDirection) {
        self.in_flight[slot(direction)] = false;
    }

    pub fn has_more(&self, direction: PageDirection) -> bool {
        !self.exhausted[slot(direction)]
    }

    pub fn is_in_flight(&self, direction: PageDirection) -> bool {
        self.in_flight[slot(direction)]
    }

    /// Whether another automatic past fetch may run: history remains and
    /// the window is still under the growth ceiling.
    pub fn may_auto_fill(&self, window_len: usize) -> bool {
        self.has_more(PageDirection::Past) && window_len < AUTO_FILL_CEILING
    }
}
