use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ChannelId, CorrelationKey, MessageId, UploadId, UserId};

/// A confirmed message as delivered by page fetches and feed events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub body: String,
    pub cooked: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub edited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<ReplyExcerpt>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upload_ids: Vec<UploadId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reactions: BTreeMap<String, BTreeSet<UserId>>,
}

/// Abbreviated view of a reply target; the full message may not be loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyExcerpt {
    pub id: MessageId,
    pub author_id: UserId,
    pub excerpt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionAction {
    Add,
    Remove,
}

/// Per-channel push event, delivered as a discriminated payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ChatFeedEvent {
    Sent {
        message: MessagePayload,
        /// Present when the message originated from this client's session.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_key: Option<CorrelationKey>,
    },
    /// Async server-side rendering finished for a message.
    Processed {
        id: MessageId,
        cooked: String,
    },
    Edited {
        message: MessagePayload,
    },
    Deleted {
        deleted_id: MessageId,
        deleted_at: DateTime<Utc>,
    },
    BulkDeleted {
        deleted_ids: Vec<MessageId>,
        deleted_at: DateTime<Utc>,
    },
    Restored {
        message: MessagePayload,
    },
    Reaction {
        message_id: MessageId,
        emoji: String,
        user_id: UserId,
        action: ReactionAction,
    },
    MentionWarning {
        message_id: MessageId,
        notice: String,
    },
    SelfFlagged {
        message_id: MessageId,
    },
    Flagged {
        message_id: MessageId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageDirection {
    Past,
    Future,
}

/// History page fetch parameters.
///
/// `anchor_message_id` without a direction requests a page centered on the
/// anchor (deep links); with a direction it is the boundary to page from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRequest {
    pub channel_id: ChannelId,
    pub page_size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<PageDirection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor_message_id: Option<MessageId>,
}

/// Viewer capabilities and exhaustion flags attached to every history page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatHistoryMeta {
    #[serde(default)]
    pub can_load_more_past: bool,
    #[serde(default)]
    pub can_load_more_future: bool,
    #[serde(default)]
    pub can_delete_self: bool,
    #[serde(default)]
    pub can_delete_others: bool,
    #[serde(default)]
    pub can_flag: bool,
    #[serde(default)]
    pub user_silenced: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatHistory {
    pub messages: Vec<MessagePayload>,
    pub meta: ChatHistoryMeta,
}

/// Send request body. The HTTP ack only signals acceptance; confirmation
/// arrives as a `sent` feed event carrying the same correlation key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRequest {
    pub body: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upload_ids: Vec<UploadId>,
    pub correlation_key: CorrelationKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to_id: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditRequest {
    pub new_body: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upload_ids: Vec<UploadId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_events_use_tagged_payloads() {
        let event = ChatFeedEvent::Deleted {
            deleted_id: MessageId(42),
            deleted_at: "2024-06-01T12:00:00Z".parse().expect("timestamp"),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "deleted");
        assert_eq!(json["payload"]["deleted_id"], 42);

        let back: ChatFeedEvent = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, event);
    }

    #[test]
    fn sent_event_omits_missing_correlation_key() {
        let event = ChatFeedEvent::Sent {
            message: MessagePayload {
                id: MessageId(1),
                channel_id: ChannelId(9),
                author_id: UserId(3),
                body: "hello".into(),
                cooked: "<p>hello</p>".into(),
                excerpt: None,
                created_at: "2024-06-01T12:00:00Z".parse().expect("timestamp"),
                edited: false,
                deleted_at: None,
                in_reply_to: None,
                upload_ids: Vec::new(),
                reactions: BTreeMap::new(),
            },
            correlation_key: None,
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert!(json["payload"].get("correlation_key").is_none());
    }
}
