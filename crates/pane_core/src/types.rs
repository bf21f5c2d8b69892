use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use shared::domain::{ChannelId, CorrelationKey, MessageId, UploadId, UserId};
use shared::protocol::MessagePayload;

/// Fixed page size for history fetches.
pub const PAGE_SIZE: u32 = 50;

/// Live-append window cap; the oldest entry is evicted past this.
pub const MAX_RECENT_MESSAGES: usize = 100;

/// Hard ceiling on window growth from the past auto-fill loop.
pub const AUTO_FILL_CEILING: usize = 200;

/// Read-cursor reporting interval.
pub const READ_INTERVAL: Duration = Duration::from_secs(2);

/// Consecutive messages from one author within this many seconds collapse
/// the repeated avatar/username block.
pub const AUTHOR_COLLAPSE_SECS: i64 = 300;

/// The single authoritative lookup key of a resident message.
///
/// A message resolves through exactly one variant at any time: the
/// correlation key while staged, the server id once confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookupKey {
    Staged(CorrelationKey),
    Confirmed(MessageId),
}

/// Advisory metadata attached by moderation-adjacent feed events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageNotice {
    MentionWarning(String),
    SelfFlagged,
    Flagged,
}

/// A message resident in the window, either staged or confirmed.
///
/// Exactly one of `id` and `correlation_key` is set at any time: the
/// constructors produce a confirmed record ([`ChatMessage::from_payload`])
/// or a staged one ([`ChatMessage::staged`]), and
/// `MessageStore::promote` swaps staged for confirmed in one step.
/// [`ChatMessage::key`] relies on this.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub id: Option<MessageId>,
    pub correlation_key: Option<CorrelationKey>,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub body: String,
    pub cooked: String,
    pub excerpt: Option<String>,
    pub created_at: DateTime<Utc>,
    pub edited: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    /// Collapsed when tombstoned; privileged viewers can re-expand.
    pub expanded: bool,
    pub reply_to: Option<MessageId>,
    pub upload_ids: Vec<UploadId>,
    pub reactions: BTreeMap<String, BTreeSet<UserId>>,
    /// Bulk-action selection marker.
    pub selected: bool,
    /// Failure reason for a staged send; never cleared by retry.
    pub send_error: Option<String>,
    /// Derived: previous window entry is a live message from the same
    /// author within [`AUTHOR_COLLAPSE_SECS`] and this is not a reply.
    pub hide_author_info: bool,
    /// Scroll-anchor marker for the rendering layer.
    pub last_read: bool,
    pub notices: Vec<MessageNotice>,
}

impl ChatMessage {
    /// Build a resident record from a confirmed wire payload.
    pub fn from_payload(payload: &MessagePayload) -> Self {
        Self {
            id: Some(payload.id),
            correlation_key: None,
            channel_id: payload.channel_id,
            author_id: payload.author_id,
            body: payload.body.clone(),
            cooked: payload.cooked.clone(),
            excerpt: payload.excerpt.clone(),
            created_at: payload.created_at,
            edited: payload.edited,
            deleted_at: payload.deleted_at,
            expanded: payload.deleted_at.is_none(),
            reply_to: payload.in_reply_to.as_ref().map(|reply| reply.id),
            upload_ids: payload.upload_ids.clone(),
            reactions: payload.reactions.clone(),
            selected: false,
            send_error: None,
            hide_author_info: false,
            last_read: false,
            notices: Vec::new(),
        }
    }

    /// Build a provisional record for an optimistic local send.
    pub fn staged(
        channel_id: ChannelId,
        author_id: UserId,
        correlation_key: CorrelationKey,
        body: String,
        cooked: String,
        upload_ids: Vec<UploadId>,
        reply_to: Option<MessageId>,
    ) -> Self {
        Self {
            id: None,
            correlation_key: Some(correlation_key),
            channel_id,
            author_id,
            body,
            cooked,
            excerpt: None,
            created_at: Utc::now(),
            edited: false,
            deleted_at: None,
            expanded: true,
            reply_to,
            upload_ids,
            reactions: BTreeMap::new(),
            selected: false,
            send_error: None,
            hide_author_info: false,
            last_read: false,
            notices: Vec::new(),
        }
    }

    pub fn is_staged(&self) -> bool {
        self.id.is_none()
    }

    /// The authoritative lookup key: server id once confirmed, else the
    /// correlation key assigned at staging time.
    pub fn key(&self) -> LookupKey {
        match self.id {
            Some(id) => LookupKey::Confirmed(id),
            None => LookupKey::Staged(
                self.correlation_key
                    .expect("staged message must carry a correlation key"),
            ),
        }
    }
}

/// What the engine knows about the viewing user, combined from the session
/// identity and the latest page-fetch capabilities.
#[derive(Debug, Clone, Copy)]
pub struct ViewerContext {
    pub user_id: UserId,
    pub can_delete_self: bool,
    pub can_delete_others: bool,
    pub can_flag: bool,
    pub user_silenced: bool,
}

impl ViewerContext {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            can_delete_self: false,
            can_delete_others: false,
            can_flag: false,
            user_silenced: false,
        }
    }

    /// Whether this viewer sees tombstones for `author` instead of hard
    /// removal: message author or elevated delete rights.
    pub fn sees_tombstone_of(&self, author: UserId) -> bool {
        self.user_id == author || self.can_delete_others
    }
}

/// Change notifications fanned out to the rendering boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaneEvent {
    /// The window mutated; re-render from the ordered snapshot.
    MessagesChanged,
    /// A live append happened while stick-to-bottom was engaged.
    RestickScroll,
    SendFailed {
        correlation_key: CorrelationKey,
        reason: String,
    },
    RateLimited,
    /// The engine asked the external unread counter to resync.
    TrackingResyncRequested {
        channel_id: ChannelId,
    },
    Closed {
        channel_id: ChannelId,
    },
}
