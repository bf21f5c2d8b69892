//! HTTP implementation of the [`ChatApi`] seam.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use shared::domain::{ChannelId, MessageId};
use shared::error::{ApiError, ErrorCode};
use shared::protocol::{ChatHistory, EditRequest, PageDirection, PageRequest, SendRequest};

use crate::api::ChatApi;

/// Chat server client speaking the channel HTTP endpoints.
pub struct HttpChatApi {
    http: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ChatViewEnvelope {
    chat_view: ChatHistory,
}

#[derive(Debug, Serialize)]
struct HistoryQuery {
    page_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    before_message_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    after_message_id: Option<i64>,
}

impl HttpChatApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn check(&self, response: Response) -> Result<Response> {
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(ApiError::new(ErrorCode::RateLimited, "rate limited").into());
        }
        Ok(response.error_for_status()?)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_page(&self, request: PageRequest) -> Result<ChatHistory> {
        // A bare anchor is a deep link served by the lookup endpoint; with
        // a direction the anchor is the window boundary to page from.
        let response = match (request.direction, request.anchor_message_id) {
            (None, Some(anchor)) => {
                self.http
                    .get(format!("{}/chat/lookup/{}.json", self.base_url, anchor.0))
                    .query(&[("page_size", request.page_size)])
                    .send()
                    .await?
            }
            (direction, anchor) => {
                let query = HistoryQuery {
                    page_size: request.page_size,
                    before_message_id: matches!(direction, Some(PageDirection::Past))
                        .then(|| anchor.map(|id| id.0))
                        .flatten(),
                    after_message_id: matches!(direction, Some(PageDirection::Future))
                        .then(|| anchor.map(|id| id.0))
                        .flatten(),
                };
                self.http
                    .get(format!(
                        "{}/chat/{}/messages.json",
                        self.base_url, request.channel_id.0
                    ))
                    .query(&query)
                    .send()
                    .await?
            }
        };
        let envelope: ChatViewEnvelope = self
            .check(response)
            .await?
            .json()
            .await
            .context("malformed chat history response")?;
        Ok(envelope.chat_view)
    }

    async fn send_message(&self, channel_id: ChannelId, request: SendRequest) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/chat/{}.json", self.base_url, channel_id.0))
            .json(&request)
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    async fn edit_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        request: EditRequest,
    ) -> Result<()> {
        let response = self
            .http
            .put(format!(
                "{}/chat/{}/edit/{}.json",
                self.base_url, channel_id.0, message_id.0
            ))
            .json(&request)
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    async fn mark_read(&self, channel_id: ChannelId, message_id: MessageId) -> Result<()> {
        let response = self
            .http
            .put(format!(
                "{}/chat/{}/read/{}.json",
                self.base_url, channel_id.0, message_id.0
            ))
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    async fn reset_tracking(&self, channel_id: ChannelId) -> Result<()> {
        let response = self
            .http
            .put(format!(
                "{}/chat/{}/tracking/reset.json",
                self.base_url, channel_id.0
            ))
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }
}
