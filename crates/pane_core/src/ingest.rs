//! Dispatch of inbound feed events into store mutations.
//!
//! Handlers are pure with respect to the store contract: each one re-reads
//! current state by lookup instead of trusting event ordering, so a late
//! `restored` racing a `deleted` resolves to whichever applied last.

use chrono::{DateTime, Utc};
use shared::domain::MessageId;
use shared::protocol::{ChatFeedEvent, MessagePayload, ReactionAction};
use tracing::{debug, trace};

use crate::store::{MessageStore, RestoreOutcome};
use crate::types::{ChatMessage, LookupKey, MessageNotice, ViewerContext};

/// What the engine should do after an event was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The window changed; `restick` requests a stick-to-bottom refresh.
    Changed { restick: bool },
    /// Stale or irrelevant event; benign no-op.
    Ignored,
}

pub fn apply(store: &mut MessageStore, viewer: &ViewerContext, event: ChatFeedEvent) -> IngestOutcome {
    match event {
        ChatFeedEvent::Sent {
            message,
            correlation_key,
        } => on_sent(store, viewer, message, correlation_key),
        ChatFeedEvent::Processed { id, cooked } => on_processed(store, id, cooked),
        ChatFeedEvent::Edited { message } => on_edited(store, message),
        ChatFeedEvent::Deleted {
            deleted_id,
            deleted_at,
        } => on_deleted(store, viewer, &[deleted_id], deleted_at),
        ChatFeedEvent::BulkDeleted {
            deleted_ids,
            deleted_at,
        } => on_deleted(store, viewer, &deleted_ids, deleted_at),
        ChatFeedEvent::Restored { message } => on_restored(store, message),
        ChatFeedEvent::Reaction {
            message_id,
            emoji,
            user_id,
            action,
        } => on_reaction(store, message_id, emoji, user_id, action),
        ChatFeedEvent::MentionWarning { message_id, notice } => {
            on_notice(store, message_id, MessageNotice::MentionWarning(notice))
        }
        ChatFeedEvent::SelfFlagged { message_id } => {
            on_notice(store, message_id, MessageNotice::SelfFlagged)
        }
        ChatFeedEvent::Flagged { message_id } => on_notice(store, message_id, MessageNotice::Flagged),
    }
}

fn on_sent(
    store: &mut MessageStore,
    viewer: &ViewerContext,
    message: MessagePayload,
    correlation_key: Option<shared::domain::CorrelationKey>,
) -> IngestOutcome {
    if store.contains(LookupKey::Confirmed(message.id)) {
        trace!(id = message.id.0, "sent echo already applied");
        return IngestOutcome::Ignored;
    }

    if message.author_id == viewer.user_id {
        if let Some(key) = correlation_key {
            if store.promote(key, &message).is_ok() {
                debug!(id = message.id.0, key = key.0, "promoted staged message");
                return IngestOutcome::Changed { restick: false };
            }
        }
    }

    if store.push_live(ChatMessage::from_payload(&message)) {
        IngestOutcome::Changed { restick: true }
    } else {
        IngestOutcome::Ignored
    }
}

fn on_processed(store: &mut MessageStore, id: MessageId, cooked: String) -> IngestOutcome {
    match store.lookup_mut(LookupKey::Confirmed(id)) {
        Some(message) => {
            message.cooked = cooked;
            IngestOutcome::Changed { restick: true }
        }
        None => IngestOutcome::Ignored,
    }
}

fn on_edited(store: &mut MessageStore, payload: MessagePayload) -> IngestOutcome {
    // Evicted or never loaded: not an error.
    match store.lookup_mut(LookupKey::Confirmed(payload.id)) {
        Some(message) => {
            message.body = payload.body;
            message.cooked = payload.cooked;
            message.excerpt = payload.excerpt;
            message.upload_ids = payload.upload_ids;
            message.edited = true;
            IngestOutcome::Changed { restick: false }
        }
        None => IngestOutcome::Ignored,
    }
}

fn on_deleted(
    store: &mut MessageStore,
    viewer: &ViewerContext,
    targets: &[MessageId],
    deleted_at: DateTime<Utc>,
) -> IngestOutcome {
    let mut changed = false;
    for &id in targets {
        let Some(author) = store.lookup(LookupKey::Confirmed(id)).map(|m| m.author_id) else {
            continue;
        };
        if viewer.sees_tombstone_of(author) {
            if let Some(message) = store.lookup_mut(LookupKey::Confirmed(id)) {
                message.deleted_at = Some(deleted_at);
                message.expanded = false;
                changed = true;
            }
        } else {
            changed |= store.remove(LookupKey::Confirmed(id)).is_some();
        }
    }
    if changed {
        IngestOutcome::Changed { restick: false }
    } else {
        IngestOutcome::Ignored
    }
}

fn on_restored(store: &mut MessageStore, payload: MessagePayload) -> IngestOutcome {
    match store.restore(&payload) {
        RestoreOutcome::Cleared | RestoreOutcome::Inserted => {
            IngestOutcome::Changed { restick: false }
        }
        RestoreOutcome::TooOld => IngestOutcome::Ignored,
    }
}

fn on_reaction(
    store: &mut MessageStore,
    message_id: MessageId,
    emoji: String,
    user_id: shared::domain::UserId,
    action: ReactionAction,
) -> IngestOutcome {
    let Some(message) = store.lookup_mut(LookupKey::Confirmed(message_id)) else {
        return IngestOutcome::Ignored;
    };
    match action {
        ReactionAction::Add => {
            message.reactions.entry(emoji).or_default().insert(user_id);
        }
        ReactionAction::Remove => {
            if let Some(users) = message.reactions.get_mut(&emoji) {
                users.remove(&user_id);
                if users.is_empty() {
                    message.reactions.remove(&emoji);
                }
            }
        }
    }
    IngestOutcome::Changed { restick: false }
}

fn on_notice(store: &mut MessageStore, message_id: MessageId, notice: MessageNotice) -> IngestOutcome {
    let Some(message) = store.lookup_mut(LookupKey::Confirmed(message_id)) else {
        return IngestOutcome::Ignored;
    };
    if message.notices.contains(&notice) {
        return IngestOutcome::Ignored;
    }
    message.notices.push(notice);
    IngestOutcome::Changed { restick: false }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use shared::domain::{ChannelId, CorrelationKey, UserId};

    use super::*;
    use crate::types::MAX_RECENT_MESSAGES;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().expect("timestamp")
    }

    fn payload(id: i64, secs: i64, author: i64) -> MessagePayload {
        MessagePayload {
            id: MessageId(id),
            channel_id: ChannelId(1),
            author_id: UserId(author),
            body: format!("message {id}"),
            cooked: format!("<p>message {id}</p>"),
            excerpt: None,
            created_at: at(secs),
            edited: false,
            deleted_at: None,
            in_reply_to: None,
            upload_ids: Vec::new(),
            reactions: Default::default(),
        }
    }

    fn viewer() -> ViewerContext {
        ViewerContext::new(UserId(7))
    }

    fn moderator() -> ViewerContext {
        let mut viewer = ViewerContext::new(UserId(99));
        viewer.can_delete_others = true;
        viewer
    }

    fn window(ids: &[i64]) -> MessageStore {
        let mut store = MessageStore::new(MAX_RECENT_MESSAGES);
        let payloads: Vec<_> = ids
            .iter()
            .map(|&id| payload(id, id, 1000 + id))
            .collect();
        store.merge_page(&payloads);
        store
    }

    fn ids(store: &MessageStore) -> Vec<i64> {
        store.ordered().iter().filter_map(|m| m.id.map(|id| id.0)).collect()
    }

    #[test]
    fn sent_echo_promotes_own_staged_message() {
        let mut store = MessageStore::new(MAX_RECENT_MESSAGES);
        store.push_live(ChatMessage::staged(
            ChannelId(1),
            UserId(7),
            CorrelationKey(7),
            "draft".into(),
            "<p>draft</p>".into(),
            Vec::new(),
            None,
        ));

        let outcome = apply(
            &mut store,
            &viewer(),
            ChatFeedEvent::Sent {
                message: payload(501, 10, 7),
                correlation_key: Some(CorrelationKey(7)),
            },
        );

        assert_eq!(outcome, IngestOutcome::Changed { restick: false });
        assert_eq!(store.len(), 1);
        assert!(store.contains(LookupKey::Confirmed(MessageId(501))));
        assert!(!store.contains(LookupKey::Staged(CorrelationKey(7))));
    }

    #[test]
    fn sent_echo_redelivery_is_idempotent() {
        let mut store = MessageStore::new(MAX_RECENT_MESSAGES);
        let event = ChatFeedEvent::Sent {
            message: payload(501, 10, 8),
            correlation_key: None,
        };
        assert_eq!(
            apply(&mut store, &viewer(), event.clone()),
            IngestOutcome::Changed { restick: true }
        );
        let snapshot: Vec<ChatMessage> = store.ordered().to_vec();

        assert_eq!(apply(&mut store, &viewer(), event), IngestOutcome::Ignored);
        assert_eq!(store.ordered(), snapshot.as_slice());
    }

    #[test]
    fn sent_from_other_author_appends_and_evicts_at_cap() {
        let mut store = MessageStore::new(MAX_RECENT_MESSAGES);
        for i in 0..MAX_RECENT_MESSAGES as i64 {
            apply(
                &mut store,
                &viewer(),
                ChatFeedEvent::Sent {
                    message: payload(i, i, 8),
                    correlation_key: None,
                },
            );
        }
        assert_eq!(store.len(), MAX_RECENT_MESSAGES);

        apply(
            &mut store,
            &viewer(),
            ChatFeedEvent::Sent {
                message: payload(1000, 1000, 8),
                correlation_key: None,
            },
        );
        assert_eq!(store.len(), MAX_RECENT_MESSAGES);
        assert!(!store.contains(LookupKey::Confirmed(MessageId(0))));
        assert!(store.contains(LookupKey::Confirmed(MessageId(1000))));
    }

    #[test]
    fn delete_hard_removes_for_plain_viewer() {
        let mut store = window(&[10, 11, 12]);
        let outcome = apply(
            &mut store,
            &viewer(),
            ChatFeedEvent::Deleted {
                deleted_id: MessageId(11),
                deleted_at: at(500),
            },
        );
        assert_eq!(outcome, IngestOutcome::Changed { restick: false });
        assert_eq!(ids(&store), vec![10, 12]);
        assert!(store.lookup(LookupKey::Confirmed(MessageId(11))).is_none());
    }

    #[test]
    fn delete_tombstones_for_privileged_viewer() {
        let mut store = window(&[10, 11, 12]);
        apply(
            &mut store,
            &moderator(),
            ChatFeedEvent::Deleted {
                deleted_id: MessageId(11),
                deleted_at: at(500),
            },
        );
        assert_eq!(ids(&store), vec![10, 11, 12]);
        let tombstoned = store
            .lookup(LookupKey::Confirmed(MessageId(11)))
            .expect("resident");
        assert_eq!(tombstoned.deleted_at, Some(at(500)));
        assert!(!tombstoned.expanded);
    }

    #[test]
    fn delete_tombstones_for_author() {
        let mut store = MessageStore::new(MAX_RECENT_MESSAGES);
        store.merge_page(&[payload(10, 10, 7)]);
        apply(
            &mut store,
            &viewer(),
            ChatFeedEvent::Deleted {
                deleted_id: MessageId(10),
                deleted_at: at(500),
            },
        );
        assert!(store
            .lookup(LookupKey::Confirmed(MessageId(10)))
            .map(|m| m.deleted_at.is_some())
            .unwrap_or(false));
    }

    #[test]
    fn bulk_delete_handles_each_target() {
        let mut store = window(&[10, 11, 12]);
        apply(
            &mut store,
            &viewer(),
            ChatFeedEvent::BulkDeleted {
                deleted_ids: vec![MessageId(10), MessageId(12), MessageId(404)],
                deleted_at: at(500),
            },
        );
        assert_eq!(ids(&store), vec![11]);
    }

    #[test]
    fn edit_of_absent_message_is_dropped_silently() {
        let mut store = window(&[10]);
        let outcome = apply(
            &mut store,
            &viewer(),
            ChatFeedEvent::Edited {
                message: payload(404, 1, 8),
            },
        );
        assert_eq!(outcome, IngestOutcome::Ignored);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn edit_updates_content_and_marks_edited() {
        let mut store = window(&[10]);
        let mut edited = payload(10, 10, 1010);
        edited.body = "fixed".into();
        edited.cooked = "<p>fixed</p>".into();
        apply(&mut store, &viewer(), ChatFeedEvent::Edited { message: edited });

        let message = store.lookup(LookupKey::Confirmed(MessageId(10))).expect("resident");
        assert_eq!(message.body, "fixed");
        assert!(message.edited);
    }

    #[test]
    fn processed_updates_cooked_when_resident() {
        let mut store = window(&[10]);
        apply(
            &mut store,
            &viewer(),
            ChatFeedEvent::Processed {
                id: MessageId(10),
                cooked: "<p>async render</p>".into(),
            },
        );
        assert_eq!(
            store
                .lookup(LookupKey::Confirmed(MessageId(10)))
                .map(|m| m.cooked.as_str()),
            Some("<p>async render</p>")
        );
    }

    #[test]
    fn reaction_add_and_remove_roundtrip() {
        let mut store = window(&[10]);
        apply(
            &mut store,
            &viewer(),
            ChatFeedEvent::Reaction {
                message_id: MessageId(10),
                emoji: "tada".into(),
                user_id: UserId(3),
                action: ReactionAction::Add,
            },
        );
        assert_eq!(
            store
                .lookup(LookupKey::Confirmed(MessageId(10)))
                .map(|m| m.reactions["tada"].len()),
            Some(1)
        );

        apply(
            &mut store,
            &viewer(),
            ChatFeedEvent::Reaction {
                message_id: MessageId(10),
                emoji: "tada".into(),
                user_id: UserId(3),
                action: ReactionAction::Remove,
            },
        );
        assert!(store
            .lookup(LookupKey::Confirmed(MessageId(10)))
            .map(|m| m.reactions.is_empty())
            .unwrap_or(false));
    }

    #[test]
    fn reaction_on_nonresident_message_is_a_noop() {
        let mut store = window(&[10]);
        let outcome = apply(
            &mut store,
            &viewer(),
            ChatFeedEvent::Reaction {
                message_id: MessageId(404),
                emoji: "eyes".into(),
                user_id: UserId(3),
                action: ReactionAction::Add,
            },
        );
        assert_eq!(outcome, IngestOutcome::Ignored);
    }

    #[test]
    fn restore_too_old_is_ignored() {
        let mut store = window(&[10, 11]);
        let outcome = apply(
            &mut store,
            &viewer(),
            ChatFeedEvent::Restored {
                message: payload(2, 2, 8),
            },
        );
        assert_eq!(outcome, IngestOutcome::Ignored);
        assert_eq!(ids(&store), vec![10, 11]);
    }

    #[test]
    fn notices_attach_once() {
        let mut store = window(&[10]);
        let event = ChatFeedEvent::Flagged {
            message_id: MessageId(10),
        };
        assert_eq!(
            apply(&mut store, &viewer(), event.clone()),
            IngestOutcome::Changed { restick: false }
        );
        assert_eq!(apply(&mut store, &viewer(), event), IngestOutcome::Ignored);
        assert_eq!(
            store
                .lookup(LookupKey::Confirmed(MessageId(10)))
                .map(|m| m.notices.len()),
            Some(1)
        );
    }

    #[test]
    fn delete_then_restore_latest_event_wins() {
        let mut store = window(&[10, 11, 12]);
        let restored = payload(11, 11, 1011);

        apply(
            &mut store,
            &moderator(),
            ChatFeedEvent::Deleted {
                deleted_id: MessageId(11),
                deleted_at: at(500),
            },
        );
        apply(
            &mut store,
            &moderator(),
            ChatFeedEvent::Restored {
                message: restored.clone(),
            },
        );
        assert_eq!(
            store
                .lookup(LookupKey::Confirmed(MessageId(11)))
                .map(|m| m.deleted_at),
            Some(None)
        );

        // opposite order: the delete applied last sticks
        apply(&mut store, &moderator(), ChatFeedEvent::Restored { message: restored });
        apply(
            &mut store,
            &moderator(),
            ChatFeedEvent::Deleted {
                deleted_id: MessageId(11),
                deleted_at: at(600),
            },
        );
        assert_eq!(
            store
                .lookup(LookupKey::Confirmed(MessageId(11)))
                .and_then(|m| m.deleted_at),
            Some(at(600))
        );
    }
}
