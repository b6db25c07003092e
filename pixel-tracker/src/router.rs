use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use pixel_common::metrics::{setup_metrics_routes, track_metrics};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::sessions::SessionManager;

#[derive(Clone)]
pub struct State {
    pub sessions: Arc<SessionManager>,
}

pub fn router(sessions: Arc<SessionManager>, recorder_handle: Option<PrometheusHandle>) -> Router {
    let state = State { sessions };

    let router = Router::new()
        .route("/", get(handlers::index))
        .route("/_liveness", get(handlers::liveness))
        .route("/_readiness", get(handlers::readiness))
        .route("/v1/events", post(handlers::event))
        .route("/v1/catalog", post(handlers::catalog))
        .route("/v1/sessions/:session_id/end", post(handlers::end_session))
        .route("/v1/pixels", get(handlers::pixels))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // The Prometheus recorder is global, so it is only installed by the binary.
    match recorder_handle {
        Some(handle) => setup_metrics_routes(router, handle),
        None => router.layer(axum::middleware::from_fn(track_metrics)),
    }
}
