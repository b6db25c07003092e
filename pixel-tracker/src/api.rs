use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use pixel_common::event::{EventType, Payload};
use pixel_common::platform::PixelKey;
use pixel_common::readiness::PixelState;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tracker::{CatalogSyncReport, DispatchReport, PageContext};

const MAX_SESSION_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EventRequest {
    pub session_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default)]
    pub order_id: Option<String>,
    /// Page the session was started on; only read on the session's first request.
    #[serde(default)]
    pub page: Option<PageContext>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Dispatched,
    Suppressed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventResponse {
    pub status: EventStatus,
    #[serde(flatten)]
    pub report: DispatchReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogStatus {
    Synced,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogResponse {
    pub status: CatalogStatus,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub report: Option<CatalogSyncReport>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EndSessionRequest {
    /// Seconds spent on the site.
    #[serde(default)]
    pub visit_duration: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndSessionResponse {
    pub status: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PixelStatus {
    #[serde(flatten)]
    pub key: PixelKey,
    #[serde(flatten)]
    pub state: PixelState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PixelsResponse {
    pub pixels: Vec<PixelStatus>,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("failed to parse request: {0}")]
    RequestParsingError(#[from] serde_json::Error),
    #[error("session_id must be 1-128 characters of [A-Za-z0-9_-]")]
    InvalidSessionId,
    #[error("unknown session")]
    UnknownSession,
    #[error("destinations are not loaded yet")]
    NotReady,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::RequestParsingError(_) | ApiError::InvalidSessionId => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            ApiError::UnknownSession => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::NotReady => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
        }
        .into_response()
    }
}

pub fn validate_session_id(session_id: &str) -> Result<(), ApiError> {
    let valid = !session_id.is_empty()
        && session_id.len() <= MAX_SESSION_ID_LEN
        && session_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(ApiError::InvalidSessionId)
    }
}
