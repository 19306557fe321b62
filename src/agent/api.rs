use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use crate::logging::LevelHandle;
use crate::model::{OngoingPolls, PingRequest, SnmpRequest, CHECK_URI, ONGOING_URI, PING_JOB_URI, SNMP_JOB_URI};

use super::AgentState;

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    pub agent: Arc<AgentState>,
    pub debug: LevelHandle,
}

/// Builds the agent HTTP router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route(SNMP_JOB_URI, post(handle_snmp_request))
        .route(PING_JOB_URI, post(handle_ping_request))
        .route(CHECK_URI, get(handle_check))
        .route(ONGOING_URI, get(handle_ongoing))
        .route("/-/stop", post(handle_stop))
        .route("/-/debug", post(handle_debug_level))
        .route("/metrics", get(handle_internal_metrics))
        .route("/snmpmetrics", get(handle_snmp_metrics))
        .route("/pingmetrics", get(handle_ping_metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

fn load_body(state: &AgentState) -> String {
    format!("{:.4}", state.current_load())
}

/// Accepts an snmp polling job: 202 with the current load on accept, 429
/// when the queue is full, 423 in graceful-quit mode, 400 on bad JSON.
async fn handle_snmp_request(State(state): State<ApiState>, body: Bytes) -> (StatusCode, String) {
    let agent = &state.agent;
    if agent.is_graceful_quit() {
        tracing::debug!("in graceful quit mode, rejecting all new requests");
        return (StatusCode::LOCKED, load_body(agent));
    }
    let mut req: SnmpRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            tracing::debug!("invalid json request: {}", e);
            return (StatusCode::BAD_REQUEST, load_body(agent));
        }
    };
    if let Err(e) = req.prepare() {
        tracing::debug!("invalid request: {}", e);
        return (StatusCode::BAD_REQUEST, load_body(agent));
    }
    let uid = req.uid.clone();
    if agent.add_snmp_request(req) {
        tracing::debug!("{} - request successfully queued", uid);
        (StatusCode::ACCEPTED, load_body(agent))
    } else {
        tracing::warn!("no more workers, rejecting request {}", uid);
        (StatusCode::TOO_MANY_REQUESTS, load_body(agent))
    }
}

/// Accepts a ping batch; same codes as the snmp intake with empty bodies.
async fn handle_ping_request(State(state): State<ApiState>, body: Bytes) -> StatusCode {
    let agent = &state.agent;
    if agent.is_graceful_quit() {
        tracing::debug!("in graceful quit mode, rejecting all new requests");
        return StatusCode::LOCKED;
    }
    let req: PingRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            tracing::debug!("invalid ping request: {}", e);
            return StatusCode::BAD_REQUEST;
        }
    };
    if req.hosts.is_empty() {
        tracing::warn!("{} - ping job with no host, rejecting", req.uid);
        return StatusCode::BAD_REQUEST;
    }
    let uid = req.uid.clone();
    let count = req.hosts.len();
    if agent.add_ping_request(req) {
        tracing::debug!("{} - ping job successfully queued ({} hosts)", uid, count);
        StatusCode::ACCEPTED
    } else {
        tracing::warn!("{} - no more workers, rejecting ping request", uid);
        StatusCode::TOO_MANY_REQUESTS
    }
}

/// Keep-alive: 200 with the current load as plain text.
async fn handle_check(State(state): State<ApiState>) -> String {
    load_body(&state.agent)
}

/// Lists the in-flight request UIDs with the current load.
async fn handle_ongoing(State(state): State<ApiState>) -> Json<OngoingPolls> {
    Json(OngoingPolls {
        ongoing: state.agent.ongoing_uids().await,
        load: state.agent.current_load(),
    })
}

/// Graceful stop: refuse further jobs, wait for the load to drain, wait
/// for one final prometheus scrape (bounded by 5 minutes), then exit 0.
/// In-flight jobs run to completion and post their reports first.
async fn handle_stop(State(state): State<ApiState>) -> StatusCode {
    let agent = Arc::clone(&state.agent);
    tracing::info!("** graceful stop requested");
    let initial_scrapes = agent.snmp_scrape_count();
    agent.begin_graceful_quit();
    while agent.current_load() > 0.0 {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    if agent.cfg.prom_max_age_secs > 0 {
        let mut remaining = 600;
        while agent.snmp_scrape_count() == initial_scrapes && remaining > 0 {
            tokio::time::sleep(Duration::from_millis(500)).await;
            remaining -= 1;
        }
    }
    tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        std::process::exit(0);
    });
    StatusCode::NO_CONTENT
}

#[derive(Deserialize)]
struct DebugParams {
    level: Option<u8>,
}

/// Adjusts the log verbosity (0..3).
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

async fn handle_internal_metrics() -> String {
    super::prom::internal_metrics()
}

async fn handle_snmp_metrics(State(state): State<ApiState>) -> String {
    match &state.agent.sinks.snmp_collector {
        Some(collector) => collector.cache.scrape().await,
        None => String::new(),
    }
}

async fn handle_ping_metrics(State(state): State<ApiState>) -> String {
    match &state.agent.sinks.ping_collector {
        Some(collector) => collector.cache.scrape().await,
        None => String::new(),
    }
}
