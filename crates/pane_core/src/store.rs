use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use shared::domain::{CorrelationKey, MessageId, UserId};
use shared::protocol::{MessagePayload, PageDirection};
use thiserror::Error;
use tracing::debug;

use crate::types::{ChatMessage, LookupKey, AUTHOR_COLLAPSE_SECS};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("no staged message for correlation key {0:?}")]
    UnknownCorrelation(CorrelationKey),
}

/// Outcome of applying a `restored` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// The message was resident; its tombstone was cleared.
    Cleared,
    /// The message was re-inserted at its sorted position.
    Inserted,
    /// Older than everything resident; dropped to keep the oldest-visible
    /// boundary stable.
    TooOld,
}

/// Bounded ordered window of messages plus a two-key lookup index.
///
/// Ordering invariant: non-decreasing `created_at`, ties ascending by id;
/// staged entries order after confirmed ones at the same timestamp. Every
/// structural mutation goes through a method here so the index never holds
/// a dangling entry.
#[derive(Debug, Default)]
pub struct MessageStore {
    messages: Vec<ChatMessage>,
    index: HashMap<LookupKey, usize>,
    /// Reply targets referenced from the window but not resident; kept for
    /// lazy fetch when the user follows the reply link.
    unloaded_reply_ids: HashSet<MessageId>,
    max_len: usize,
}

impl MessageStore {
    pub fn new(max_len: usize) -> Self {
        Self {
            messages: Vec::new(),
            index: HashMap::new(),
            unloaded_reply_ids: HashSet::new(),
            max_len: max_len.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Window contents in display order.
    pub fn ordered(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn contains(&self, key: LookupKey) -> bool {
        self.index.contains_key(&key)
    }

    pub fn lookup(&self, key: LookupKey) -> Option<&ChatMessage> {
        self.index.get(&key).map(|&pos| &self.messages[pos])
    }

    /// Mutable lookup for in-place field updates. Callers must not change
    /// `id`, `correlation_key`, or `created_at` through this; key changes
    /// go through [`MessageStore::promote`].
    pub fn lookup_mut(&mut self, key: LookupKey) -> Option<&mut ChatMessage> {
        let pos = *self.index.get(&key)?;
        Some(&mut self.messages[pos])
    }

    /// Remove a message from both the window and the index.
    pub fn remove(&mut self, key: LookupKey) -> Option<ChatMessage> {
        let pos = self.index.remove(&key)?;
        let removed = self.messages.remove(pos);
        self.reindex();
        Some(removed)
    }

    /// Append a live message at the tail, deriving the author-info collapse
    /// against the current tail, then evict past the cap. No-op when the
    /// key is already resident (redelivered event).
    ///
    /// Assumes live delivery in timestamp order: the entry lands at the
    /// tail without re-sorting. Out-of-order arrivals go through
    /// [`MessageStore::merge_page`] or [`MessageStore::restore`].
    pub fn push_live(&mut self, mut message: ChatMessage) -> bool {
        if self.contains(message.key()) {
            return false;
        }
        message.hide_author_info = collapses_author(self.messages.last(), &message);
        self.track_reply(&message);
        self.messages.push(message);
        self.reindex();
        self.evict_overflow();
        true
    }

    /// Insert a confirmed message at its sorted position.
    pub fn insert_sorted(&mut self, message: ChatMessage) -> usize {
        let pos = self.sorted_position(&message);
        self.track_reply(&message);
        self.messages.insert(pos, message);
        self.reindex();
        pos
    }

    /// Promote a staged message to its confirmed server echo.
    ///
    /// Merges server-rendered content (server cooking may legitimately
    /// diverge from the local rendering) and swaps the index from the
    /// correlation key to the server id in one step.
    pub fn promote(
        &mut self,
        correlation_key: CorrelationKey,
        payload: &MessagePayload,
    ) -> Result<(), StoreError> {
        let pos = self
            .index
            .remove(&LookupKey::Staged(correlation_key))
            .ok_or(StoreError::UnknownCorrelation(correlation_key))?;
        let message = &mut self.messages[pos];
        message.id = Some(payload.id);
        message.correlation_key = None;
        if message.cooked != payload.cooked {
            message.cooked = payload.cooked.clone();
        }
        message.excerpt = payload.excerpt.clone();
        message.send_error = None;
        self.index.insert(LookupKey::Confirmed(payload.id), pos);
        Ok(())
    }

    /// Merge a fetched history page, deduplicated by id. Returns how many
    /// messages were actually inserted.
    pub fn merge_page(&mut self, payloads: &[MessagePayload]) -> usize {
        let mut merged = 0;
        for payload in payloads {
            if self.contains(LookupKey::Confirmed(payload.id)) {
                continue;
            }
            let message = ChatMessage::from_payload(payload);
            let pos = self.sorted_position(&message);
            self.track_reply(&message);
            self.messages.insert(pos, message);
            merged += 1;
        }
        if merged > 0 {
            self.reindex();
            self.recompute_author_collapse();
        }
        merged
    }

    /// Apply a `restored` event: clear a resident tombstone, or re-insert
    /// the message unless it would land in front of everything resident.
    pub fn restore(&mut self, payload: &MessagePayload) -> RestoreOutcome {
        if let Some(message) = self.lookup_mut(LookupKey::Confirmed(payload.id)) {
            message.deleted_at = None;
            message.expanded = true;
            return RestoreOutcome::Cleared;
        }

        let mut message = ChatMessage::from_payload(payload);
        message.deleted_at = None;
        message.expanded = true;
        let pos = self.sorted_position(&message);
        if pos == 0 {
            debug!(id = payload.id.0, "restored message too old to surface");
            return RestoreOutcome::TooOld;
        }
        self.track_reply(&message);
        self.messages.insert(pos, message);
        self.reindex();
        self.recompute_author_collapse();
        RestoreOutcome::Inserted
    }

    /// Sorted position for a message under the `(created_at, id)` order,
    /// after any equal keys. Staged entries compare greatest within their
    /// timestamp so they stay behind confirmed peers.
    fn sorted_position(&self, message: &ChatMessage) -> usize {
        let key = order_key(message);
        self.messages.partition_point(|m| order_key(m) <= key)
    }

    fn evict_overflow(&mut self) {
        if self.messages.len() <= self.max_len {
            return;
        }
        let excess = self.messages.len() - self.max_len;
        for evicted in self.messages.drain(0..excess) {
            debug!(?evicted.id, "evicting oldest window entry");
        }
        self.reindex();
    }

    /// Rebuild the lookup index from scratch. The window is small (at most
    /// a couple hundred entries), so a full rebuild keeps every structural
    /// mutation trivially free of dangling entries.
    fn reindex(&mut self) {
        self.index.clear();
        for (pos, message) in self.messages.iter().enumerate() {
            self.index.insert(message.key(), pos);
        }
    }

    /// Re-derive the author-info collapse over the whole window; used after
    /// merges that may change adjacency at page seams.
    pub fn recompute_author_collapse(&mut self) {
        for i in 0..self.messages.len() {
            let hide = if i == 0 {
                false
            } else {
                let (head, tail) = self.messages.split_at(i);
                collapses_author(head.last(), &tail[0])
            };
            self.messages[i].hide_author_info = hide;
        }
    }

    fn track_reply(&mut self, message: &ChatMessage) {
        if let Some(reply_id) = message.reply_to {
            if !self.contains(LookupKey::Confirmed(reply_id)) {
                self.unloaded_reply_ids.insert(reply_id);
            }
        }
    }

    /// Whether a reply target is referenced from the window but not loaded.
    pub fn is_unloaded_reply(&self, id: MessageId) -> bool {
        self.unloaded_reply_ids.contains(&id) && !self.contains(LookupKey::Confirmed(id))
    }

    /// Newest confirmed id in the window, skipping staged tail entries.
    pub fn newest_confirmed_id(&self) -> Option<MessageId> {
        self.messages.iter().rev().find_map(|m| m.id)
    }

    /// Oldest confirmed id; the boundary for past pagination.
    pub fn oldest_confirmed_id(&self) -> Option<MessageId> {
        self.messages.iter().find_map(|m| m.id)
    }

    /// Pagination boundary id for a direction, `None` on an empty window.
    pub fn boundary_id(&self, direction: PageDirection) -> Option<MessageId> {
        match direction {
            PageDirection::Past => self.oldest_confirmed_id(),
            PageDirection::Future => self.newest_confirmed_id(),
        }
    }

    /// Clear all last-read markers and set one on `id` if resident.
    pub fn mark_last_read(&mut self, id: MessageId) -> bool {
        for message in &mut self.messages {
            message.last_read = false;
        }
        if let Some(message) = self.lookup_mut(LookupKey::Confirmed(id)) {
            message.last_read = true;
            true
        } else {
            false
        }
    }

    /// Count of confirmed messages strictly newer than `id` (all of them
    /// when `id` is `None`).
    pub fn count_newer_than(&self, id: Option<MessageId>) -> usize {
        self.messages
            .iter()
            .filter(|m| match (m.id, id) {
                (Some(mid), Some(cursor)) => mid > cursor,
                (Some(_), None) => true,
                (None, _) => false,
            })
            .count()
    }

    /// Set the selection marker over the inclusive index range between two
    /// resident ids, in either order.
    pub fn select_range(&mut self, a: MessageId, b: MessageId, selected: bool) -> bool {
        let (Some(&pa), Some(&pb)) = (
            self.index.get(&LookupKey::Confirmed(a)),
            self.index.get(&LookupKey::Confirmed(b)),
        ) else {
            return false;
        };
        let (lo, hi) = if pa <= pb { (pa, pb) } else { (pb, pa) };
        for message in &mut self.messages[lo..=hi] {
            message.selected = selected;
        }
        true
    }

    pub fn clear_selection(&mut self) {
        for message in &mut self.messages {
            message.selected = false;
        }
    }

    pub fn selected_ids(&self) -> Vec<MessageId> {
        self.messages
            .iter()
            .filter(|m| m.selected)
            .filter_map(|m| m.id)
            .collect()
    }

    /// Newest message authored by `user`, for the edit-last shortcut.
    pub fn last_authored_by(&self, user: UserId) -> Option<&ChatMessage> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.author_id == user && m.deleted_at.is_none())
    }
}

fn order_key(message: &ChatMessage) -> (DateTime<Utc>, i64) {
    (
        message.created_at,
        message.id.map(|id| id.0).unwrap_or(i64::MAX),
    )
}

/// The repeated-author collapse rule: previous entry is a live message from
/// the same author within the collapse window, and the newer message is not
/// a reply.
fn collapses_author(previous: Option<&ChatMessage>, message: &ChatMessage) -> bool {
    if message.reply_to.is_some() {
        return false;
    }
    let Some(previous) = previous else {
        return false;
    };
    previous.deleted_at.is_none()
        && previous.author_id == message.author_id
        && (message.created_at - previous.created_at)
            .num_seconds()
            .abs()
            < AUTHOR_COLLAPSE_SECS
}
