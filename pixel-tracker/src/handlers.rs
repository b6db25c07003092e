use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::Json;
use pixel_common::event::{CanonicalEvent, EventType};
use tracing::instrument;

use crate::api::{
    validate_session_id, ApiError, CatalogResponse, CatalogStatus, EndSessionRequest,
    EndSessionResponse, EventRequest, EventResponse, EventStatus, PixelStatus, PixelsResponse,
};
use crate::catalog::Product;
use crate::router;
use crate::tracker::{ready_count, CatalogSyncOutcome, TrackOutcome};

pub async fn index() -> &'static str {
    "pixel-tracker"
}

pub async fn liveness() -> &'static str {
    "ok"
}

pub async fn readiness(state: State<router::State>) -> Result<String, ApiError> {
    let context = state.sessions.context();
    if !context.is_loaded() {
        return Err(ApiError::NotReady);
    }
    let (ready, total) = ready_count(context.readiness());
    Ok(format!("ok: {ready}/{total} pixels ready"))
}

#[instrument(skip_all, fields(session_id, event_type))]
pub async fn event(
    state: State<router::State>,
    body: Bytes,
) -> Result<Json<EventResponse>, ApiError> {
    let request: EventRequest = serde_json::from_slice(&body)?;
    validate_session_id(&request.session_id)?;

    tracing::Span::current().record("session_id", request.session_id.as_str());
    tracing::Span::current().record("event_type", request.event_type.as_str());

    let tracker = state.sessions.get_or_create(&request.session_id);
    tracker.start(request.page.unwrap_or_default()).await;

    let order_id = request
        .order_id
        .map(|id| id.trim().to_owned())
        .filter(|id| !id.is_empty() && request.event_type == EventType::Purchase);
    let event = CanonicalEvent {
        event_type: request.event_type,
        payload: request.payload,
        order_id,
    };

    let response = match tracker.track(event).await {
        TrackOutcome::Suppressed => EventResponse {
            status: EventStatus::Suppressed,
            report: Default::default(),
        },
        TrackOutcome::Dispatched(report) => EventResponse {
            status: EventStatus::Dispatched,
            report,
        },
    };
    Ok(Json(response))
}

#[instrument(skip_all)]
pub async fn catalog(
    state: State<router::State>,
    body: Bytes,
) -> Result<Json<CatalogResponse>, ApiError> {
    let products: Vec<Product> = serde_json::from_slice(&body)?;

    let response = match state.sessions.context().sync_catalog(products).await {
        CatalogSyncOutcome::Unchanged => CatalogResponse {
            status: CatalogStatus::Unchanged,
            report: None,
        },
        CatalogSyncOutcome::Synced(report) => CatalogResponse {
            status: CatalogStatus::Synced,
            report: Some(report),
        },
    };
    Ok(Json(response))
}

#[instrument(skip_all, fields(session_id))]
pub async fn end_session(
    state: State<router::State>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> Result<Json<EndSessionResponse>, ApiError> {
    validate_session_id(&session_id)?;
    tracing::Span::current().record("session_id", session_id.as_str());

    let request: EndSessionRequest = if body.is_empty() {
        EndSessionRequest::default()
    } else {
        serde_json::from_slice(&body)?
    };

    let ended = state
        .sessions
        .end(&session_id, request.visit_duration.map(Duration::from_secs));
    if !ended {
        return Err(ApiError::UnknownSession);
    }
    Ok(Json(EndSessionResponse { status: "ended" }))
}

pub async fn pixels(state: State<router::State>) -> Json<PixelsResponse> {
    let pixels = state
        .sessions
        .context()
        .readiness()
        .snapshot()
        .into_iter()
        .map(|(key, state)| PixelStatus { key, state })
        .collect();
    Json(PixelsResponse { pixels })
}
