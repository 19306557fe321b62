use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use crate::logging::LevelHandle;
use crate::model::REPORT_URI;

use super::registry::AgentRegistry;
use super::report;
use super::store::Store;

/// Shared handler state for the dispatcher's web surface.
#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub registry: Arc<AgentRegistry>,
    pub debug: LevelHandle,
}

/// Builds the dispatcher router: the report callback plus the runtime
/// debug endpoint. Device CRUD is served by the inventory frontend, not
/// by the polling plane.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route(REPORT_URI, get(report::handle_report))
        .route("/-/debug", post(handle_debug_level))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[derive(Deserialize)]
struct DebugParams {
    level: Option<u8>,
}

async fn handle_debug_level(State(state): State<ApiState>, Query(params): Query<DebugParams>) -> impl IntoResponse {
    let Some(level) = params.level.filter(|l| *l <= 3) else {
        tracing::error!("invalid debug level");
        return (StatusCode::BAD_REQUEST, "invalid debug level".to_string());
    };
    match state.debug.set_level(level) {
        Ok(()) => (StatusCode::OK, String::new()),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
