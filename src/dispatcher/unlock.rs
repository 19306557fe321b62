use std::time::Duration;

use crate::config::DispatcherConfig;
use crate::model::OngoingPolls;

use super::registry::AgentRegistry;
use super::store::Store;

/// Reconciles lost device locks: collects the ongoing request UIDs from
/// every working agent and unlocks stale devices whose UID is in no
/// inventory. Idle or dead agents get a direct bulk unlock of their
/// pending reports. Runs periodically on its own task.
pub async fn unlock_devices(store: &Store, registry: &AgentRegistry) {
    let client = match reqwest::Client::builder().timeout(Duration::from_secs(2)).build() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("build unlock client: {}", e);
            return;
        }
    };

    let mut current_reqs: Vec<String> = Vec::new();
    for agent in registry.snapshot().await {
        if !agent.is_alive() || !agent.has_load_samples() {
            // agent is not working, no need to query
            if let Err(e) = store.unlock_devices_from_agent(agent.id).await {
                tracing::error!("agent #{}: unlock from agent: {}", agent.id, e);
            }
            continue;
        }
        tracing::debug!("unlock dev: get ongoing from agent #{} ({})", agent.id, agent.name);
        let resp = match client.get(&agent.ongoing_url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::debug!("agent #{}: get ongoing: {}", agent.id, e);
                continue;
            }
        };
        if !resp.status().is_success() {
            tracing::warn!("agent #{}: get ongoing: {}", agent.id, resp.status());
            continue;
        }
        let ongoing: OngoingPolls = match resp.json().await {
            Ok(ongoing) => ongoing,
            Err(e) => {
                tracing::error!("agent #{}: get ongoing: decode: {}", agent.id, e);
                continue;
            }
        };
        tracing::debug!("agent #{}: {} running jobs", agent.id, ongoing.ongoing.len());
        current_reqs.extend(ongoing.ongoing);
    }

    tracing::debug!("unlocking devices without ongoing poll ({} in flight)", current_reqs.len());
    match store.unlock_devices_not_ongoing(&current_reqs).await {
        Ok(count) if count > 0 => tracing::info!("unlocked {} stale devices", count),
        Ok(_) => {}
        Err(e) => tracing::error!("unlock from ongoing: {}", e),
    }
}

/// Safety net for a total fleet outage: clears any lock whose device was
/// last polled before the configured hard timeout.
pub async fn hard_unlock(store: &Store, cfg: &DispatcherConfig) {
    match store.unlock_devices_older_than(cfg.hard_unlock_after_secs).await {
        Ok(count) if count > 0 => tracing::warn!("hard sweep unlocked {} devices", count),
        Ok(_) => {}
        Err(e) => tracing::error!("hard unlock: {}", e),
    }
}

/// Trims old report rows: errors past their retention and orphan rows
/// that never received a completion.
pub async fn flush_reports(store: &Store, cfg: &DispatcherConfig) {
    tracing::debug!(
        "flushing error reports older than {}h and orphans older than {}h",
        cfg.error_retention_hours,
        cfg.report_flush_freq_hours
    );
    match store.flush_reports(cfg.error_retention_hours, cfg.report_flush_freq_hours).await {
        Ok((errors, orphans)) => {
            if errors + orphans > 0 {
                tracing::debug!("{} old reports flushed ({} errors, {} orphans)", errors + orphans, errors, orphans);
            }
        }
        Err(e) => tracing::error!("flush old reports: {}", e),
    }
}
