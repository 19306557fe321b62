use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use serde::Deserialize;

use super::server::ApiState;

#[derive(Debug, Deserialize)]
pub struct ReportParams {
    pub request_id: String,
    #[serde(default)]
    pub agent_id: Option<i64>,
    #[serde(default)]
    pub poll_duration_ms: Option<i64>,
    #[serde(default)]
    pub poll_error: Option<String>,
    #[serde(default)]
    pub metric_count: Option<i64>,
    #[serde(default)]
    pub current_load: Option<String>,
}

/// Completion callback from an agent: releases the device lock, keeps the
/// report row only when the poll errored and feeds the agent's load ring.
pub async fn handle_report(State(state): State<ApiState>, Query(params): Query<ReportParams>) -> StatusCode {
    let uid = &params.request_id;
    let duration = params.poll_duration_ms.unwrap_or(0);
    tracing::debug!("{} - new report received, poll duration={}ms", uid, duration);
    if duration <= 500 {
        // a fast poll can report back before the dispatcher's report
        // insert has committed; give the insert time to land
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    let poll_error = params.poll_error.clone().unwrap_or_default();
    tracing::debug!(
        "report: req_uid={} agent_id={:?} poll_dur={} poll_err={:?} metric_count={:?} curr_load={:?}",
        uid,
        params.agent_id,
        duration,
        poll_error,
        params.metric_count,
        params.current_load
    );

    if let Err(e) = state.store.unlock_device_from_report(uid).await {
        tracing::error!("{} - unlock dev from report: {}", uid, e);
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    let outcome = if poll_error.is_empty() {
        tracing::debug!("{} - removing terminated report entry", uid);
        state.store.delete_report(uid).await.map(|count| {
            tracing::debug!("{} - {} row deleted", uid, count);
        })
    } else {
        tracing::debug!("{} - saving error report entry", uid);
        state.store.update_report(uid, duration, &poll_error).await
    };
    if let Err(e) = outcome {
        tracing::error!("{} - handle report: {}", uid, e);
        return StatusCode::INTERNAL_SERVER_ERROR;
    }

    if let (Some(agent_id), Some(load)) = (params.agent_id, &params.current_load) {
        match load.parse::<f64>() {
            Ok(load) => {
                if let Some(agent) = state.registry.agent_by_id(agent_id).await {
                    agent.set_load(load, state.registry.load_avg_window);
                }
            }
            Err(e) => tracing::warn!("{} - unable to parse current_load: {}", uid, e),
        }
    }
    StatusCode::OK
}
