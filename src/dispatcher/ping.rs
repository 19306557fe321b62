use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::config::DispatcherConfig;
use crate::model::{PingHost, PingRequest};

use super::registry::{AgentRecord, AgentRegistry};
use super::store::Store;

/// Plans ping batches: selects due hosts, keeps host→agent affinity
/// across rounds and bounds every agent's share of the round.
pub struct PingPlanner {
    /// hostname → agent name affinity memo.
    memo: Mutex<HashMap<String, String>>,
}

impl PingPlanner {
    pub fn new() -> Arc<Self> {
        Arc::new(PingPlanner {
            memo: Mutex::new(HashMap::new()),
        })
    }

    /// Selects due hosts, assigns them to live agents and posts one
    /// request per batch of `ping_batch_count` hosts. Hosts whose post
    /// succeeds get their `last_pinged_at` refreshed.
    pub async fn send_ping_requests(&self, store: &Store, registry: &AgentRegistry, cfg: &DispatcherConfig) {
        let agents: Vec<Arc<AgentRecord>> = registry
            .snapshot()
            .await
            .into_iter()
            .filter(|a| a.is_alive())
            .collect();
        if agents.is_empty() {
            tracing::debug!("no active agent, skipping this round...");
            return;
        }
        let mut hosts = match store.ping_hosts().await {
            Ok(hosts) => hosts,
            Err(e) => {
                tracing::error!("ping hosts: {}", e);
                return;
            }
        };
        if hosts.is_empty() {
            tracing::debug!("no new ping req available");
            return;
        }
        tracing::debug!("got {} ping hosts", hosts.len());
        resolve_missing_ips(&mut hosts).await;
        hosts.retain(|h| !h.ip_address.is_empty());
        if hosts.is_empty() {
            return;
        }

        let assignment = self.assign(&hosts, &agents).await;

        let client = match reqwest::Client::builder().timeout(Duration::from_secs(3)).build() {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("build ping client: {}", e);
                return;
            }
        };
        for (agent_name, agent_hosts) in assignment {
            let Some(agent) = agents.iter().find(|a| a.name == agent_name) else {
                continue;
            };
            for batch in agent_hosts.chunks(cfg.ping_batch_count.max(1)) {
                let req = PingRequest {
                    uid: batch_uid(),
                    hosts: batch.to_vec(),
                    stamp: None,
                };
                if let Err(e) = post_ping_request(&client, &req, agent).await {
                    tracing::error!("{} - post ping request: {}, skipping...", req.uid, e);
                    let mut memo = self.memo.lock().await;
                    for host in batch {
                        memo.remove(&host.hostname);
                    }
                    continue;
                }
                if let Err(e) = store.set_devices_last_pinged(&req.host_ids()).await {
                    tracing::error!("{} - set last pinged: {}", req.uid, e);
                }
            }
        }
    }

    /// Sticky assignment: memoized hosts stay on their agent while it is
    /// alive and under the per-agent bound `ceil(total/alive)`; the rest
    /// go to the agent with the fewest hosts this round.
    async fn assign(&self, hosts: &[PingHost], agents: &[Arc<AgentRecord>]) -> Vec<(String, Vec<PingHost>)> {
        let bound = hosts.len().div_ceil(agents.len());
        let mut memo = self.memo.lock().await;
        let mut by_agent: HashMap<&str, Vec<PingHost>> = agents.iter().map(|a| (a.name.as_str(), Vec::new())).collect();

        for host in hosts {
            let memoized = memo
                .get(&host.hostname)
                .and_then(|name| by_agent.get_key_value(name.as_str()).map(|(k, v)| (*k, v.len())))
                .filter(|(_, count)| *count < bound)
                .map(|(name, _)| name);
            let target = match memoized {
                Some(name) => name,
                None => {
                    // least loaded by host count this round
                    let Some(name) = by_agent
                        .iter()
                        .filter(|(_, v)| v.len() < bound)
                        .min_by_key(|(_, v)| v.len())
                        .map(|(k, _)| *k)
                    else {
                        break;
                    };
                    name
                }
            };
            memo.insert(host.hostname.clone(), target.to_string());
            if let Some(list) = by_agent.get_mut(target) {
                list.push(host.clone());
            }
        }
        by_agent
            .into_iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }
}

/// Resolves hostnames without a stored IP through DNS; failures are
/// logged and the host skipped for this round.
async fn resolve_missing_ips(hosts: &mut [PingHost]) {
    for host in hosts.iter_mut() {
        if !host.ip_address.is_empty() {
            continue;
        }
        match tokio::net::lookup_host((host.hostname.as_str(), 0)).await {
            Ok(mut addrs) => {
                if let Some(addr) = addrs.next() {
                    tracing::debug!("host {} resolved to {}", host.hostname, addr.ip());
                    host.ip_address = addr.ip().to_string();
                }
            }
            Err(e) => {
                tracing::error!("ping: lookup {}: {}", host.hostname, e);
            }
        }
    }
}

/// Posts one batch to one agent; anything but a 202 is an error.
async fn post_ping_request(client: &reqwest::Client, req: &PingRequest, agent: &AgentRecord) -> anyhow::Result<()> {
    tracing::debug!("{} - posting to agent #{} ({}), {} hosts", req.uid, agent.id, agent.name, req.hosts.len());
    let resp = client.post(&agent.ping_job_url).json(req).send().await?;
    if resp.status() != reqwest::StatusCode::ACCEPTED {
        anyhow::bail!("agent #{} ({}) rejected with code {}", agent.id, agent.name, resp.status());
    }
    Ok(())
}

fn batch_uid() -> String {
    let sid = uuid::Uuid::new_v4().simple().to_string();
    sid[..10].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::store::AgentRow;

    fn agent(id: i64, port: u16) -> Arc<AgentRecord> {
        AgentRecord::from_row(&AgentRow {
            id,
            host: "10.0.0.1".into(),
            port,
            is_alive: true,
        })
    }

    fn host(name: &str) -> PingHost {
        PingHost {
            hostname: name.to_string(),
            ip_address: format!("10.1.0.{}", name.len()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_assign_bounded_by_fair_share() {
        let planner = PingPlanner::new();
        let agents = vec![agent(1, 8001), agent(2, 8002)];
        let hosts: Vec<PingHost> = (0..10).map(|i| host(&format!("h{}", i))).collect();
        let assignment = planner.assign(&hosts, &agents).await;
        let total: usize = assignment.iter().map(|(_, v)| v.len()).sum();
        assert_eq!(total, 10);
        for (_, v) in &assignment {
            assert!(v.len() <= 5, "agent got {} hosts, bound is 5", v.len());
        }
    }

    #[tokio::test]
    async fn test_assign_is_sticky_across_rounds() {
        let planner = PingPlanner::new();
        let agents = vec![agent(1, 8001), agent(2, 8002)];
        let hosts: Vec<PingHost> = (0..4).map(|i| host(&format!("h{}", i))).collect();

        let first = planner.assign(&hosts, &agents).await;
        let second = planner.assign(&hosts, &agents).await;
        let lookup = |assignment: &Vec<(String, Vec<PingHost>)>, host: &str| -> String {
            assignment
                .iter()
                .find(|(_, v)| v.iter().any(|h| h.hostname == host))
                .map(|(k, _)| k.clone())
                .unwrap()
        };
        for h in &hosts {
            assert_eq!(lookup(&first, &h.hostname), lookup(&second, &h.hostname));
        }
    }

    #[tokio::test]
    async fn test_assign_reassigns_when_agent_gone() {
        let planner = PingPlanner::new();
        let both = vec![agent(1, 8001), agent(2, 8002)];
        let hosts: Vec<PingHost> = (0..4).map(|i| host(&format!("h{}", i))).collect();
        planner.assign(&hosts, &both).await;

        // second round with only one agent alive: everything lands on it
        let only = vec![agent(1, 8001)];
        let assignment = planner.assign(&hosts, &only).await;
        assert_eq!(assignment.len(), 1);
        assert_eq!(assignment[0].1.len(), 4);
    }
}
