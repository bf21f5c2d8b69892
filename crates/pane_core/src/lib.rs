//! Client-side engine for a single live chat channel.
//!
//! One [`LivePane`] per open channel keeps the visible message window
//! correct, ordered, and live while events arrive out of order from the
//! push feed, local sends display optimistically before confirmation,
//! history pages in both directions on demand, and the read cursor is
//! reconciled with the server on a timer.
//!
//! Transport, authentication, rendering, and persistence stay outside the
//! engine behind the seams in [`api`].

use std::sync::Arc;

use futures::{Stream, StreamExt};
use shared::domain::{ChannelId, CorrelationKey, MessageId, UploadId, UserId};
use shared::protocol::{
    ChatFeedEvent, ChatHistoryMeta, EditRequest, PageDirection, PageRequest, SendRequest,
};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

pub mod api;
pub mod compose;
pub mod error;
pub mod http_api;
pub mod ingest;
pub mod pagination;
pub mod read_cursor;
pub mod store;
pub mod types;

pub use api::{
    AlwaysVisible, ChannelTracking, ChatApi, IdentityRenderer, MissingChatApi, NoTracking,
    Renderer, ViewSurface,
};
pub use error::PaneError;
pub use http_api::HttpChatApi;
pub use types::{ChatMessage, LookupKey, MessageNotice, PaneEvent, ViewerContext};

use compose::ComposeState;
use ingest::IngestOutcome;
use pagination::PageTracker;
use read_cursor::{ReadCursor, ReadTick};
use store::MessageStore;
use types::{MAX_RECENT_MESSAGES, PAGE_SIZE, READ_INTERVAL};

/// Adapt a broadcast subscription into the feed stream `open` consumes.
/// Lagged receivers drop the missed events and continue.
pub fn feed_from_broadcast(
    receiver: broadcast::Receiver<ChatFeedEvent>,
) -> impl Stream<Item = ChatFeedEvent> + Send + Unpin {
    BroadcastStream::new(receiver).filter_map(|item| futures::future::ready(item.ok()))
}

struct PaneState {
    channel_id: Option<ChannelId>,
    /// Bumped on every open/close; in-flight continuations compare it and
    /// discard their results when it moved.
    epoch: u64,
    store: MessageStore,
    pages: PageTracker,
    compose: ComposeState,
    cursor: ReadCursor,
    viewer: ViewerContext,
    sticky_scroll: bool,
    last_selected: Option<MessageId>,
}

#[derive(Default)]
struct PaneTasks {
    feed: Option<JoinHandle<()>>,
    read: Option<JoinHandle<()>>,
}

/// The reconciliation engine for one chat channel session.
pub struct LivePane {
    api: Arc<dyn ChatApi>,
    renderer: Arc<dyn Renderer>,
    surface: Arc<dyn ViewSurface>,
    tracking: Arc<dyn ChannelTracking>,
    inner: Mutex<PaneState>,
    tasks: Mutex<PaneTasks>,
    events: broadcast::Sender<PaneEvent>,
}

impl LivePane {
    pub fn new(viewer: UserId, api: Arc<dyn ChatApi>) -> Arc<Self> {
        Self::new_with_dependencies(
            viewer,
            api,
            Arc::new(IdentityRenderer),
            Arc::new(AlwaysVisible),
            Arc::new(NoTracking),
        )
    }

    pub fn new_with_dependencies(
        viewer: UserId,
        api: Arc<dyn ChatApi>,
        renderer: Arc<dyn Renderer>,
        surface: Arc<dyn ViewSurface>,
        tracking: Arc<dyn ChannelTracking>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            api,
            renderer,
            surface,
            tracking,
            inner: Mutex::new(PaneState {
                channel_id: None,
                epoch: 0,
                store: MessageStore::new(MAX_RECENT_MESSAGES),
                pages: PageTracker::new(),
                compose: ComposeState::new(),
                cursor: ReadCursor::new(),
                viewer: ViewerContext::new(viewer),
                sticky_scroll: true,
                last_selected: None,
            }),
            tasks: Mutex::new(PaneTasks::default()),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PaneEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: PaneEvent) {
        let _ = self.events.send(event);
    }

    /// Open a channel: reset session state, attach the push feed, start
    /// the read-cursor loop, and load the initial page. `anchor` deep-links
    /// to a specific message; otherwise the page centers on the externally
    /// tracked read cursor, falling back to the latest history.
    pub async fn open<S>(
        self: &Arc<Self>,
        channel_id: ChannelId,
        anchor: Option<MessageId>,
        feed: S,
    ) -> Result<(), PaneError>
    where
        S: Stream<Item = ChatFeedEvent> + Send + Unpin + 'static,
    {
        self.teardown_tasks().await;
        let epoch = {
            let mut inner = self.inner.lock().await;
            inner.epoch += 1;
            inner.channel_id = Some(channel_id);
            inner.store = MessageStore::new(MAX_RECENT_MESSAGES);
            inner.pages = PageTracker::new();
            inner.compose = ComposeState::new();
            inner.cursor = ReadCursor::new();
            inner.sticky_scroll = true;
            inner.last_selected = None;
            inner.pages.begin_initial();
            inner.epoch
        };

        {
            let mut tasks = self.tasks.lock().await;
            tasks.feed = Some(self.spawn_feed_task(epoch, feed));
            tasks.read = Some(self.spawn_read_task(epoch, channel_id));
        }

        let tracked_last_read = self.tracking.last_read_id(channel_id).await;
        let anchor = anchor.or(tracked_last_read);
        self.run_initial_fetch(epoch, channel_id, anchor, tracked_last_read)
            .await
    }

    /// Re-fetch the window centered on a specific message, e.g. when the
    /// user follows a reply link whose target was never loaded.
    pub async fn reload_around(&self, anchor: MessageId) -> Result<(), PaneError> {
        let (epoch, channel_id) = {
            let mut inner = self.inner.lock().await;
            let channel_id = inner.channel_id.ok_or(PaneError::ChannelClosed)?;
            if !inner.pages.begin_initial() {
                return Ok(());
            }
            (inner.epoch, channel_id)
        };
        let tracked_last_read = self.tracking.last_read_id(channel_id).await;
        self.run_initial_fetch(epoch, channel_id, Some(anchor), tracked_last_read)
            .await
    }

    async fn run_initial_fetch(
        &self,
        epoch: u64,
        channel_id: ChannelId,
        anchor: Option<MessageId>,
        tracked_last_read: Option<MessageId>,
    ) -> Result<(), PaneError> {
        let request = PageRequest {
            channel_id,
            page_size: PAGE_SIZE,
            direction: None,
            anchor_message_id: anchor,
        };
        let fetched = self.api.fetch_page(request).await;

        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch {
            debug!(channel = channel_id.0, "discarding initial page after channel switch");
            return Err(PaneError::ChannelClosed);
        }
        match fetched {
            Ok(history) => {
                inner.store = MessageStore::new(MAX_RECENT_MESSAGES);
                inner.store.merge_page(&history.messages);
                inner.pages.finish_initial(
                    &history.meta,
                    history.messages.len(),
                    PAGE_SIZE,
                    anchor.is_some(),
                );
                apply_meta(&mut inner.viewer, &history.meta);
                inner.cursor.adopt(tracked_last_read);
                if let Some(id) = tracked_last_read {
                    inner.store.mark_last_read(id);
                }
                drop(inner);
                self.emit(PaneEvent::MessagesChanged);
                info!(channel = channel_id.0, "channel history loaded");
                Ok(())
            }
            Err(err) => {
                inner.pages.abort_initial();
                drop(inner);
                let err = error::fetch_error(err);
                if matches!(err, PaneError::RateLimited) {
                    self.emit(PaneEvent::RateLimited);
                }
                Err(err)
            }
        }
    }

    /// Tear down the channel session: cancel the feed and read tasks and
    /// drop the window. Late continuations of in-flight requests see the
    /// epoch move and discard their results.
    pub async fn close(&self) {
        self.teardown_tasks().await;
        let channel = {
            let mut inner = self.inner.lock().await;
            inner.epoch += 1;
            inner.store = MessageStore::new(MAX_RECENT_MESSAGES);
            inner.pages = PageTracker::new();
            inner.channel_id.take()
        };
        if let Some(channel_id) = channel {
            info!(channel = channel_id.0, "channel closed");
            self.emit(PaneEvent::Closed { channel_id });
        }
    }

    async fn teardown_tasks(&self) {
        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.feed.take() {
            task.abort();
        }
        if let Some(task) = tasks.read.take() {
            task.abort();
        }
    }

    /// Fetch the next history page adjacent to the window boundary.
    ///
    /// No-op (not an error) when the direction is exhausted, a fetch is
    /// already in flight, or the window is empty. After a past merge the
    /// engine keeps fetching while the surface still reports the top
    /// boundary, capped by the window growth ceiling.
    pub async fn load_more(&self, direction: PageDirection) -> Result<(), PaneError> {
        loop {
            let Some((epoch, request)) = self.begin_page_fetch(direction).await? else {
                return Ok(());
            };
            let fetched = self.api.fetch_page(request).await;

            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                debug!("discarding history page fetched for a previous channel");
                return Ok(());
            }
            match fetched {
                Ok(history) => {
                    let merged = inner.store.merge_page(&history.messages);
                    inner.pages.finish(direction, &history.meta, merged);
                    apply_meta(&mut inner.viewer, &history.meta);
                    let refill = direction == PageDirection::Past
                        && self.surface.at_top_boundary()
                        && inner.pages.may_auto_fill(inner.store.len());
                    drop(inner);
                    if merged > 0 {
                        self.emit(PaneEvent::MessagesChanged);
                    }
                    if !refill {
                        return Ok(());
                    }
                }
                Err(err) => {
                    inner.pages.abort(direction);
                    drop(inner);
                    let err = error::fetch_error(err);
                    if matches!(err, PaneError::RateLimited) {
                        self.emit(PaneEvent::RateLimited);
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn begin_page_fetch(
        &self,
        direction: PageDirection,
    ) -> Result<Option<(u64, PageRequest)>, PaneError> {
        let mut inner = self.inner.lock().await;
        let channel_id = inner.channel_id.ok_or(PaneError::ChannelClosed)?;
        let Some(anchor) = inner.store.boundary_id(direction) else {
            return Ok(None);
        };
        if !inner.pages.begin(direction) {
            return Ok(None);
        }
        Ok(Some((
            inner.epoch,
            PageRequest {
                channel_id,
                page_size: PAGE_SIZE,
                direction: Some(direction),
                anchor_message_id: Some(anchor),
            },
        )))
    }

    /// Stage a message optimistically and send it. The returned key
    /// identifies the staged entry; transport failure is surfaced on the
    /// message itself (`send_error` plus a [`PaneEvent::SendFailed`]) and
    /// is never auto-retried — resubmission allocates a fresh key.
    pub async fn send_message(
        &self,
        body: impl Into<String>,
        uploads: Vec<UploadId>,
        reply_to: Option<MessageId>,
    ) -> Result<CorrelationKey, PaneError> {
        let body = body.into();
        let (epoch, channel_id, key, request) = {
            let mut inner = self.inner.lock().await;
            let channel_id = inner.channel_id.ok_or(PaneError::ChannelClosed)?;
            if !inner.compose.begin_send() {
                return Err(PaneError::SendInFlight);
            }
            let key = inner.compose.allocate_key();
            let reply_to = reply_to.or(inner.compose.reply_to());
            let cooked = self.renderer.cook(&body);
            let viewer_id = inner.viewer.user_id;
            inner.store.push_live(ChatMessage::staged(
                channel_id,
                viewer_id,
                key,
                body.clone(),
                cooked,
                uploads.clone(),
                reply_to,
            ));
            inner.compose.reset_after_send();
            inner.sticky_scroll = true;
            (
                inner.epoch,
                channel_id,
                key,
                SendRequest {
                    body,
                    upload_ids: uploads,
                    correlation_key: key,
                    in_reply_to_id: reply_to,
                },
            )
        };
        self.emit(PaneEvent::MessagesChanged);
        self.emit(PaneEvent::RestickScroll);

        let sent = self.api.send_message(channel_id, request).await;

        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch {
            debug!(key = key.0, "send resolved after channel teardown");
            return Ok(key);
        }
        inner.compose.finish_send();
        if let Err(err) = sent {
            let reason = err.to_string();
            if let Some(staged) = inner.store.lookup_mut(LookupKey::Staged(key)) {
                staged.send_error = Some(reason.clone());
            }
            drop(inner);
            warn!(key = key.0, "send failed: {reason}");
            self.emit(PaneEvent::MessagesChanged);
            self.emit(PaneEvent::SendFailed {
                correlation_key: key,
                reason,
            });
        }
        Ok(key)
    }

    /// Edit a confirmed message: content updates optimistically, the edit
    /// UI state resets either way, and on failure the content is left as
    /// typed (the request may have partially succeeded server-side) with a
    /// generic error returned to the caller.
    pub async fn edit_message(
        &self,
        message_id: MessageId,
        new_body: impl Into<String>,
        uploads: Vec<UploadId>,
    ) -> Result<(), PaneError> {
        let new_body = new_body.into();
        let (epoch, channel_id) = {
            let mut inner = self.inner.lock().await;
            let channel_id = inner.channel_id.ok_or(PaneError::ChannelClosed)?;
            inner.compose.start_editing(message_id);
            let cooked = self.renderer.cook(&new_body);
            if let Some(message) = inner.store.lookup_mut(LookupKey::Confirmed(message_id)) {
                message.body = new_body.clone();
                message.cooked = cooked;
                message.edited = true;
            }
            (inner.epoch, channel_id)
        };
        self.emit(PaneEvent::MessagesChanged);

        let edited = self
            .api
            .edit_message(
                channel_id,
                message_id,
                EditRequest {
                    new_body,
                    upload_ids: uploads,
                },
            )
            .await;

        let mut inner = self.inner.lock().await;
        if inner.epoch == epoch {
            inner.compose.reset_after_send();
        }
        drop(inner);
        edited.map_err(|err| PaneError::EditFailed(err.to_string()))
    }

    /// Target the viewer's newest message for editing, if any.
    pub async fn edit_last_message(&self) -> Option<MessageId> {
        let mut inner = self.inner.lock().await;
        let viewer_id = inner.viewer.user_id;
        let target = inner.store.last_authored_by(viewer_id).and_then(|m| m.id)?;
        inner.compose.start_editing(target);
        Some(target)
    }

    pub async fn cancel_editing(&self) {
        self.inner.lock().await.compose.cancel_editing();
    }

    pub async fn set_reply_to(&self, target: Option<MessageId>) {
        self.inner.lock().await.compose.set_reply_to(target);
    }

    /// Begin a bulk-selection gesture anchored at a message.
    pub async fn begin_selection(&self, id: MessageId) {
        let mut inner = self.inner.lock().await;
        inner.last_selected = Some(id);
        if let Some(message) = inner.store.lookup_mut(LookupKey::Confirmed(id)) {
            message.selected = true;
        }
        drop(inner);
        self.emit(PaneEvent::MessagesChanged);
    }

    pub async fn select_message(&self, id: MessageId, selected: bool) {
        let mut inner = self.inner.lock().await;
        inner.last_selected = Some(id);
        if let Some(message) = inner.store.lookup_mut(LookupKey::Confirmed(id)) {
            message.selected = selected;
        }
        drop(inner);
        self.emit(PaneEvent::MessagesChanged);
    }

    /// Extend the selection from the last touched message through `id`.
    pub async fn select_range_to(&self, id: MessageId, selected: bool) {
        let mut inner = self.inner.lock().await;
        let anchor = inner.last_selected.unwrap_or(id);
        inner.last_selected = Some(id);
        inner.store.select_range(anchor, id, selected);
        drop(inner);
        self.emit(PaneEvent::MessagesChanged);
    }

    pub async fn cancel_selection(&self) {
        let mut inner = self.inner.lock().await;
        inner.last_selected = None;
        inner.store.clear_selection();
        drop(inner);
        self.emit(PaneEvent::MessagesChanged);
    }

    pub async fn selected_message_ids(&self) -> Vec<MessageId> {
        self.inner.lock().await.store.selected_ids()
    }

    /// Stick-to-bottom state reported by the scrolling surface.
    pub async fn set_sticky_scroll(&self, sticky: bool) {
        self.inner.lock().await.sticky_scroll = sticky;
    }

    /// Ordered snapshot of the window for rendering.
    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.inner.lock().await.store.ordered().to_vec()
    }

    /// Confirmed messages newer than the read cursor.
    pub async fn unread_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.store.count_newer_than(inner.cursor.last_read_id())
    }

    pub async fn is_unloaded_reply(&self, id: MessageId) -> bool {
        self.inner.lock().await.store.is_unloaded_reply(id)
    }

    pub async fn has_more(&self, direction: PageDirection) -> bool {
        self.inner.lock().await.pages.has_more(direction)
    }

    pub async fn viewer(&self) -> ViewerContext {
        self.inner.lock().await.viewer
    }

    fn spawn_feed_task<S>(self: &Arc<Self>, epoch: u64, mut feed: S) -> JoinHandle<()>
    where
        S: Stream<Item = ChatFeedEvent> + Send + Unpin + 'static,
    {
        let pane = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = feed.next().await {
                pane.ingest_event(epoch, event).await;
            }
            debug!("feed stream ended");
        })
    }

    async fn ingest_event(&self, epoch: u64, event: ChatFeedEvent) {
        let applied = {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch || inner.channel_id.is_none() {
                debug!("discarding feed event for a torn-down channel");
                return;
            }
            let viewer = inner.viewer;
            match ingest::apply(&mut inner.store, &viewer, event) {
                IngestOutcome::Changed { restick } => Some(restick && inner.sticky_scroll),
                IngestOutcome::Ignored => None,
            }
        };
        match applied {
            Some(true) => {
                self.emit(PaneEvent::MessagesChanged);
                self.emit(PaneEvent::RestickScroll);
            }
            Some(false) => self.emit(PaneEvent::MessagesChanged),
            None => {}
        }
    }

    fn spawn_read_task(self: &Arc<Self>, epoch: u64, channel_id: ChannelId) -> JoinHandle<()> {
        let pane = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(READ_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick resolves immediately; reporting starts one
            // full interval after open
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !pane.read_tick(epoch, channel_id).await {
                    break;
                }
            }
            debug!(channel = channel_id.0, "read loop stopped");
        })
    }

    /// One read-cursor tick; returns `false` when the loop must stop.
    async fn read_tick(&self, epoch: u64, channel_id: ChannelId) -> bool {
        let external_unread = self.tracking.unread_count(channel_id).await;
        let focused = self.surface.is_focused_and_visible();
        let decision = {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                return false;
            }
            let newest = inner.store.newest_confirmed_id();
            let decision = inner.cursor.tick(newest, focused, external_unread);
            if let ReadTick::Report(id) = decision {
                // advance optimistically; failure below stops the loop
                // without reverting the cursor
                inner.cursor.note_reported(id);
            }
            decision
        };
        match decision {
            ReadTick::Report(id) => {
                if let Err(err) = self.api.mark_read(channel_id, id).await {
                    warn!(
                        channel = channel_id.0,
                        "read receipt failed, disabling automatic reporting: {err:#}"
                    );
                    let mut inner = self.inner.lock().await;
                    if inner.epoch == epoch {
                        inner.cursor.disable_reporting();
                    }
                    return false;
                }
            }
            ReadTick::Resync => {
                debug!(
                    channel = channel_id.0,
                    unread = external_unread,
                    "unread counter drift, requesting resync"
                );
                if let Err(err) = self.api.reset_tracking(channel_id).await {
                    warn!(channel = channel_id.0, "tracking resync failed: {err:#}");
                }
                self.emit(PaneEvent::TrackingResyncRequested { channel_id });
            }
            ReadTick::Idle => {}
        }
        true
    }
}

fn apply_meta(viewer: &mut ViewerContext, meta: &ChatHistoryMeta) {
    viewer.can_delete_self = meta.can_delete_self;
    viewer.can_delete_others = meta.can_delete_others;
    viewer.can_flag = meta.can_flag;
    viewer.user_silenced = meta.user_silenced;
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod engine_tests;

#[cfg(test)]
#[path = "tests/http_api_tests.rs"]
mod http_api_tests;
