use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use tokio::task::JoinSet;

use crate::config::DispatcherConfig;
use crate::model::SnmpRequest;

use super::registry::{AgentRecord, AgentRegistry};
use super::store::Store;

/// Retrieves all available snmp polling jobs and sends each of them to
/// the first agent that accepts it, in placement order. A job no agent
/// accepts is unlocked and discarded.
pub async fn send_polling_jobs(
    store: &Store,
    registry: &Arc<AgentRegistry>,
    cfg: &DispatcherConfig,
    shutdown: &AtomicBool,
) {
    if registry.active_count().await == 0 {
        tracing::debug!("no active agent, skipping this round...");
        return;
    }
    let jobs = match store.snmp_jobs().await {
        Ok(jobs) => jobs,
        Err(e) => {
            tracing::error!("snmp jobs: {}", e);
            return;
        }
    };
    if jobs.is_empty() {
        tracing::debug!("no new snmp jobs available");
        return;
    }

    let accepted = Arc::new(AtomicI64::new(0));
    let discarded = Arc::new(AtomicI64::new(0));
    let client = match reqwest::Client::builder().timeout(Duration::from_secs(3)).build() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("build job client: {}", e);
            return;
        }
    };

    let mut tasks = JoinSet::new();
    for (j, device_id) in jobs.iter().enumerate() {
        let device_id = *device_id;
        if shutdown.load(Ordering::SeqCst) {
            tracing::debug!("cancelling all unposted jobs after #{}...", j);
            for id in &jobs[j..] {
                if let Err(e) = store.unlock_device(*id).await {
                    tracing::error!("dev #{}: unlock: {}", id, e);
                }
            }
            break;
        }

        // coarse lock taken before materialisation so a competing
        // dispatcher cannot double-schedule the device
        if let Err(e) = store.lock_device(device_id).await {
            tracing::error!("dev #{}: lock device: {}", device_id, e);
            continue;
        }
        let req = match store.build_request(device_id, &cfg.report_url()).await {
            Ok(req) => req,
            Err(e) => {
                tracing::error!("dev #{}: build request: {}", device_id, e);
                if let Err(e) = store.unlock_device(device_id).await {
                    tracing::error!("dev #{}: unlock: {}", device_id, e);
                }
                continue;
            }
        };
        tracing::debug!("{} - new req for job #{}, device #{}", req.uid, j + 1, device_id);

        if req.scalar_measures.is_empty() && req.indexed_measures.is_empty() {
            tracing::debug!("{} - no measure defined for device, skipping", req.uid);
            if let Err(e) = store.unlock_device(device_id).await {
                tracing::error!("dev #{}: unlock: {}", device_id, e);
            }
            update_last_polled(store, &req).await;
            continue;
        }

        let store = store.clone();
        let registry = Arc::clone(registry);
        let client = client.clone();
        let accepted = Arc::clone(&accepted);
        let discarded = Arc::clone(&discarded);
        tasks.spawn(async move {
            place_request(&store, &registry, &client, req, &accepted, &discarded).await;
        });

        // a few moments between posts, to avoid flooding the agents
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    while tasks.join_next().await.is_some() {}

    let accepted = accepted.load(Ordering::SeqCst);
    let discarded = discarded.load(Ordering::SeqCst);
    tracing::debug!("processed {} job(s): accepted={} discarded={}", jobs.len(), accepted, discarded);
    if discarded > 0 {
        tracing::warn!("not enough snmp workers available for {} jobs", discarded);
    }
}

/// Tries the placement-ordered agents until one accepts the job (202).
/// 429 means the agent is full and 423 that it is terminating; both
/// cascade to the next agent.
async fn place_request(
    store: &Store,
    registry: &Arc<AgentRegistry>,
    client: &reqwest::Client,
    mut req: SnmpRequest,
    accepted: &AtomicI64,
    discarded: &AtomicI64,
) {
    let device_id = req.device.id;
    let agents = registry.agents_for_device(device_id).await;
    for (i, agent) in agents.iter().enumerate() {
        tracing::debug!("{} - try #{}: sending req to agent #{} ({})", req.uid, i, agent.id, agent.name);
        req.agent_id = agent.id;
        let (code, load) = match send_request(client, &req, agent).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!("{} - try #{}: send request: {}", req.uid, i, e);
                continue;
            }
        };
        match code {
            StatusCode::ACCEPTED => {
                if let Err(e) = store.insert_report(&req.uid, device_id, agent.id, "202 Accepted").await {
                    tracing::error!("{} - insert report: {}", req.uid, e);
                }
                update_last_polled(store, &req).await;
                agent.set_load(load, registry.load_avg_window);
                registry.remember_placement(device_id, &agent.name).await;
                accepted.fetch_add(1, Ordering::SeqCst);
                tracing::debug!("{} - request sent to agent #{} (load: {:.4})", req.uid, agent.id, load);
                return;
            }
            StatusCode::TOO_MANY_REQUESTS => {
                tracing::debug!("{} - agent #{} is full", req.uid, agent.id);
                continue;
            }
            StatusCode::LOCKED => {
                tracing::debug!("{} - agent #{} is terminating", req.uid, agent.id);
                continue;
            }
            other => {
                tracing::warn!("{} - agent #{} replied `{}`", req.uid, agent.id, other);
            }
        }
    }
    tracing::warn!("{} - polling job discarded (no worker found)", req.uid);
    discarded.fetch_add(1, Ordering::SeqCst);
    if let Err(e) = store.unlock_device(device_id).await {
        tracing::error!("dev #{}: unlock: {}", device_id, e);
    }
}

/// Posts the request to one agent. Returns the HTTP status and the
/// agent's current load from the reply body.
async fn send_request(
    client: &reqwest::Client,
    req: &SnmpRequest,
    agent: &AgentRecord,
) -> anyhow::Result<(StatusCode, f64)> {
    tracing::debug!("{} - posting request to agent #{} ({})", req.uid, agent.id, agent.name);
    let resp = client.post(&agent.snmp_job_url).json(req).send().await?;
    let code = StatusCode::from_u16(resp.status().as_u16())?;
    let body = resp.text().await.unwrap_or_default();
    let load = body.trim().parse::<f64>().unwrap_or(0.0);
    Ok((code, load))
}

/// Updates the device's last-poll time and upserts the poll time of every
/// metric carrying its own polling frequency.
async fn update_last_polled(store: &Store, req: &SnmpRequest) {
    if let Err(e) = store.set_device_last_polled(req.device.id).await {
        tracing::error!("{} - set last polled: {}", req.uid, e);
    }
    let scalar_metrics = req.scalar_measures.iter().flat_map(|m| m.metrics.iter());
    let indexed_metrics = req.indexed_measures.iter().flat_map(|m| m.metrics.iter());
    for metric in scalar_metrics.chain(indexed_metrics) {
        if metric.polling_frequency > 0 {
            if let Err(e) = store.upsert_metric_poll_time(req.device.id, metric.id).await {
                tracing::error!("{} - metric #{} poll time: {}", req.uid, metric.id, e);
            }
        }
    }
}
