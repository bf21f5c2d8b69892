use shared::error::ApiError;
use thiserror::Error;

/// Errors surfaced to callers of the pane engine.
#[derive(Debug, Error)]
pub enum PaneError {
    #[error("channel is not open")]
    ChannelClosed,
    #[error("a send is already in flight")]
    SendInFlight,
    #[error("rate limited by the server")]
    RateLimited,
    #[error("edit failed: {0}")]
    EditFailed(String),
    #[error(transparent)]
    Api(#[from] anyhow::Error),
}

/// Whether an API-seam failure carries a rate-limit error code.
pub fn is_rate_limited(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ApiError>()
        .map(ApiError::is_rate_limited)
        .unwrap_or(false)
}

/// Classify a fetch failure: rate limiting is surfaced distinctly, never
/// silently retried.
pub fn fetch_error(err: anyhow::Error) -> PaneError {
    if is_rate_limited(&err) {
        PaneError::RateLimited
    } else {
        PaneError::Api(err)
    }
}
