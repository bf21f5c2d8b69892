//! Trait seams for the engine's external collaborators.
//!
//! Each seam ships a default implementation: `Missing*` stubs fail loudly
//! for collaborators the host must provide, identity/quiet defaults cover
//! the ones that are optional in headless use.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::domain::{ChannelId, MessageId};
use shared::protocol::{ChatHistory, EditRequest, PageRequest, SendRequest};

/// The chat server API at the engine's boundary.
///
/// `send_message` and `edit_message` acks only signal acceptance;
/// confirmation arrives out-of-band on the feed.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn fetch_page(&self, request: PageRequest) -> Result<ChatHistory>;
    async fn send_message(&self, channel_id: ChannelId, request: SendRequest) -> Result<()>;
    async fn edit_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        request: EditRequest,
    ) -> Result<()>;
    /// Fire-and-forget read receipt.
    async fn mark_read(&self, channel_id: ChannelId, message_id: MessageId) -> Result<()>;
    /// Corrective resync of the server-side unread tracking state.
    async fn reset_tracking(&self, channel_id: ChannelId) -> Result<()>;
}

pub struct MissingChatApi;

#[async_trait]
impl ChatApi for MissingChatApi {
    async fn fetch_page(&self, request: PageRequest) -> Result<ChatHistory> {
        Err(anyhow!(
            "chat api unavailable for channel {}",
            request.channel_id.0
        ))
    }

    async fn send_message(&self, channel_id: ChannelId, _request: SendRequest) -> Result<()> {
        Err(anyhow!("chat api unavailable for channel {}", channel_id.0))
    }

    async fn edit_message(
        &self,
        channel_id: ChannelId,
        _message_id: MessageId,
        _request: EditRequest,
    ) -> Result<()> {
        Err(anyhow!("chat api unavailable for channel {}", channel_id.0))
    }

    async fn mark_read(&self, channel_id: ChannelId, _message_id: MessageId) -> Result<()> {
        Err(anyhow!("chat api unavailable for channel {}", channel_id.0))
    }

    async fn reset_tracking(&self, channel_id: ChannelId) -> Result<()> {
        Err(anyhow!("chat api unavailable for channel {}", channel_id.0))
    }
}

/// Local markdown rendering seam ("cooking" happens outside the engine).
pub trait Renderer: Send + Sync {
    fn cook(&self, raw: &str) -> String;
}

/// Passthrough renderer for hosts that render elsewhere and for tests.
pub struct IdentityRenderer;

impl Renderer for IdentityRenderer {
    fn cook(&self, raw: &str) -> String {
        raw.to_owned()
    }
}

/// What the engine may know about the viewing surface.
pub trait ViewSurface: Send + Sync {
    /// Read receipts are only issued while the surface is focused and
    /// visible.
    fn is_focused_and_visible(&self) -> bool;

    /// Whether the oldest visible message sits at the top boundary; drives
    /// the past auto-fill loop after a merge.
    fn at_top_boundary(&self) -> bool {
        false
    }
}

/// Headless default: always focused, never at the top boundary.
pub struct AlwaysVisible;

impl ViewSurface for AlwaysVisible {
    fn is_focused_and_visible(&self) -> bool {
        true
    }
}

/// Externally tracked per-channel read state (the host application's
/// notification badge source). Eventually consistent with the engine's
/// own cursor; never merged with it.
#[async_trait]
pub trait ChannelTracking: Send + Sync {
    async fn unread_count(&self, channel_id: ChannelId) -> u64;
    async fn last_read_id(&self, channel_id: ChannelId) -> Option<MessageId>;
}

/// Tracking source that reports nothing unread.
pub struct NoTracking;

#[async_trait]
impl ChannelTracking for NoTracking {
    async fn unread_count(&self, _channel_id: ChannelId) -> u64 {
        0
    }

    async fn last_read_id(&self, _channel_id: ChannelId) -> Option<MessageId> {
        None
    }
}
