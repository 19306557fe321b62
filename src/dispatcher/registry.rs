use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::model::{CHECK_URI, ONGOING_URI, PING_JOB_URI, SNMP_JOB_URI};

use super::store::{AgentRow, Store};

/// Time-windowed load samples of one agent. Samples older than the
/// window are discarded when the average is refreshed.
#[derive(Debug, Default)]
struct LoadHistory {
    samples: VecDeque<(Instant, f64)>,
    avg: f64,
}

/// One polling agent of the fleet.
pub struct AgentRecord {
    pub id: i64,
    pub host: String,
    pub port: u16,

    /// Unique agent name, `host:port`.
    pub name: String,

    pub snmp_job_url: String,
    pub ping_job_url: String,
    pub check_url: String,
    pub ongoing_url: String,

    alive: AtomicBool,
    loads: Mutex<LoadHistory>,
}

impl AgentRecord {
    pub(crate) fn from_row(row: &AgentRow) -> Arc<Self> {
        let base = format!("http://{}:{}", row.host, row.port);
        Arc::new(AgentRecord {
            id: row.id,
            host: row.host.clone(),
            port: row.port,
            name: format!("{}:{}", row.host, row.port),
            snmp_job_url: format!("{}{}", base, SNMP_JOB_URI),
            ping_job_url: format!("{}{}", base, PING_JOB_URI),
            check_url: format!("{}{}", base, CHECK_URI),
            ongoing_url: format!("{}{}", base, ONGOING_URI),
            alive: AtomicBool::new(row.is_alive),
            loads: Mutex::new(LoadHistory::default()),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    /// Appends an instantaneous load sample and refreshes the windowed
    /// average. A dead agent's history is cleared instead.
    pub fn set_load(&self, load: f64, window: Duration) {
        let mut history = self.loads.lock().unwrap_or_else(|e| e.into_inner());
        if !self.is_alive() {
            history.samples.clear();
            history.avg = 0.0;
            return;
        }
        let now = Instant::now();
        history.samples.push_back((now, load));
        while let Some((stamp, _)) = history.samples.front() {
            if now.duration_since(*stamp) > window {
                history.samples.pop_front();
            } else {
                break;
            }
        }
        let len = history.samples.len();
        history.avg = if len == 0 {
            0.0
        } else {
            history.samples.iter().map(|(_, l)| l).sum::<f64>() / len as f64
        };
    }

    pub fn load_avg(&self) -> f64 {
        self.loads.lock().unwrap_or_else(|e| e.into_inner()).avg
    }

    /// Whether this agent reported at least one load sample recently.
    pub fn has_load_samples(&self) -> bool {
        !self.loads.lock().unwrap_or_else(|e| e.into_inner()).samples.is_empty()
    }

    /// Keep-alive probe: 200 with the current load in body means healthy.
    async fn check(&self, client: &reqwest::Client) -> (bool, f64) {
        tracing::debug!("checking agent #{}", self.id);
        let resp = match client.get(&self.check_url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::debug!("check agent {}: {}", self.name, e);
                return (false, 0.0);
            }
        };
        if !resp.status().is_success() {
            tracing::warn!("agent #{} responded to check with {}", self.id, resp.status());
            return (false, 0.0);
        }
        let body = match resp.text().await {
            Ok(body) => body,
            Err(e) => {
                tracing::error!("agent #{}: read check reply: {}", self.id, e);
                return (false, 0.0);
            }
        };
        match body.trim().parse::<f64>() {
            Ok(load) => (true, load),
            Err(e) => {
                tracing::error!("agent #{}: reply parse: {}", self.id, e);
                (true, 0.0)
            }
        }
    }
}

impl std::fmt::Display for AgentRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Agent<id:{} name:{} load:{:.4}>", self.id, self.name, self.load_avg())
    }
}

/// In-memory fleet state synchronised from the store, plus the
/// device→agent stickiness memo.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<AgentRecord>>>,
    memo: RwLock<HashMap<i64, String>>,
    client: reqwest::Client,

    pub load_avg_window: Duration,
    pub max_load_delta: f64,
}

impl AgentRegistry {
    pub fn new(load_avg_window: Duration, max_load_delta: f64) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap_or_default();
        Arc::new(AgentRegistry {
            agents: RwLock::new(HashMap::new()),
            memo: RwLock::new(HashMap::new()),
            client,
            load_avg_window,
            max_load_delta,
        })
    }

    /// Synchronises the in-memory fleet with the store's active agents:
    /// removed entries are dropped, new ones added, and persisting agents
    /// keep their in-memory liveness and load history.
    pub async fn reload(&self, store: &Store) -> anyhow::Result<()> {
        let rows = store.active_agents().await?;
        tracing::debug!("got {} agents from db", rows.len());
        let mut incoming: HashMap<String, &AgentRow> = rows
            .iter()
            .map(|r| (format!("{}:{}", r.host, r.port), r))
            .collect();
        let mut agents = self.agents.write().await;
        agents.retain(|name, _| incoming.contains_key(name));
        for (name, _) in agents.iter() {
            incoming.remove(name);
        }
        for (name, row) in incoming {
            agents.insert(name, AgentRecord::from_row(row));
        }
        Ok(())
    }

    pub async fn snapshot(&self) -> Vec<Arc<AgentRecord>> {
        self.agents.read().await.values().cloned().collect()
    }

    pub async fn active_count(&self) -> usize {
        self.agents.read().await.values().filter(|a| a.is_alive()).count()
    }

    /// Probes every agent, persists its liveness and load average, and
    /// recovers the devices of agents that just died: their pending
    /// report locks are cleared in bulk and their memo entries dropped.
    pub async fn check_agents(&self, store: &Store) {
        tracing::debug!("start checking agents");
        let agents = self.snapshot().await;
        let mut dead: Vec<String> = Vec::new();
        for agent in &agents {
            let (is_alive, load) = agent.check(&self.client).await;
            agent.set_alive(is_alive);
            agent.set_load(load, self.load_avg_window);
            tracing::debug!(
                "agent #{} ({}): alive={} load={:.2} load_avg={:.2}",
                agent.id,
                agent.name,
                is_alive,
                load,
                agent.load_avg()
            );
            if let Err(e) = store.update_agent_check(agent.id, is_alive, agent.load_avg()).await {
                tracing::error!("agent #{}: persist check: {}", agent.id, e);
            }
            if !is_alive {
                // unlock all devices locked on a failed agent
                if let Err(e) = store.unlock_devices_from_agent(agent.id).await {
                    tracing::error!("agent #{}: unlock devices: {}", agent.id, e);
                }
                dead.push(agent.name.clone());
            }
        }
        if !dead.is_empty() {
            let mut memo = self.memo.write().await;
            memo.retain(|_, name| !dead.contains(name));
        }
        tracing::debug!("done checking agents");
    }

    /// Returns the live agents ordered by placement priority for this
    /// device: sticky as long as the previously used agent's load average
    /// stays within `max_load_delta` of the least loaded one, rebalanced
    /// onto the load-sorted list otherwise.
    pub async fn agents_for_device(&self, device_id: i64) -> Vec<Arc<AgentRecord>> {
        let mut working: Vec<Arc<AgentRecord>> = self
            .agents
            .read()
            .await
            .values()
            .filter(|a| a.is_alive())
            .cloned()
            .collect();
        if working.is_empty() {
            return working;
        }
        working.sort_by(|a, b| a.load_avg().partial_cmp(&b.load_avg()).unwrap_or(std::cmp::Ordering::Equal));

        let prev = self.memo.read().await.get(&device_id).cloned();
        let Some(prev) = prev else {
            tracing::debug!("dev#{}: not in job list, req sent to load sorted agents", device_id);
            return working;
        };
        let Some(index) = working.iter().position(|a| a.name == prev) else {
            return working;
        };
        let delta = working[index].load_avg() - working[0].load_avg();
        if delta <= self.max_load_delta {
            let agent = working.remove(index);
            tracing::debug!("dev#{}: stick to prev ({}), delta={:.2}", device_id, agent.name, delta);
            working.insert(0, agent);
        } else {
            tracing::debug!("dev#{}: rebalancing to load sorted agents, delta={:.2}", device_id, delta);
        }
        working
    }

    /// Records a successful placement; only 202-acked posts update the
    /// stickiness memo.
    pub async fn remember_placement(&self, device_id: i64, agent_name: &str) {
        self.memo.write().await.insert(device_id, agent_name.to_string());
    }

    pub async fn agent_by_id(&self, id: i64) -> Option<Arc<AgentRecord>> {
        self.agents.read().await.values().find(|a| a.id == id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64, port: u16, load: f64) -> Arc<AgentRecord> {
        let rec = AgentRecord::from_row(&AgentRow {
            id,
            host: "10.0.0.1".into(),
            port,
            is_alive: true,
        });
        rec.set_load(load, Duration::from_secs(30));
        rec
    }

    async fn registry_with(agents: Vec<Arc<AgentRecord>>) -> Arc<AgentRegistry> {
        let reg = AgentRegistry::new(Duration::from_secs(30), 0.1);
        {
            let mut map = reg.agents.write().await;
            for a in agents {
                map.insert(a.name.clone(), a);
            }
        }
        reg
    }

    #[tokio::test]
    async fn test_sticky_under_balanced_load() {
        // loads [0.10, 0.15, 0.12], previous agent at 0.15: delta 0.05 <= 0.1
        let a1 = record(1, 8001, 0.10);
        let a2 = record(2, 8002, 0.15);
        let a3 = record(3, 8003, 0.12);
        let reg = registry_with(vec![a1, a2.clone(), a3]).await;
        reg.remember_placement(42, &a2.name).await;

        let ordered = reg.agents_for_device(42).await;
        let loads: Vec<f64> = ordered.iter().map(|a| a.load_avg()).collect();
        assert_eq!(loads, vec![0.15, 0.10, 0.12]);
    }

    #[tokio::test]
    async fn test_rebalance_above_threshold() {
        // loads [0.10, 0.30, 0.12], previous at 0.30: delta 0.2 > 0.1
        let a1 = record(1, 8001, 0.10);
        let a2 = record(2, 8002, 0.30);
        let a3 = record(3, 8003, 0.12);
        let reg = registry_with(vec![a1, a2.clone(), a3]).await;
        reg.remember_placement(42, &a2.name).await;

        let ordered = reg.agents_for_device(42).await;
        let loads: Vec<f64> = ordered.iter().map(|a| a.load_avg()).collect();
        assert_eq!(loads, vec![0.10, 0.12, 0.30]);
    }

    #[tokio::test]
    async fn test_unmemoized_device_gets_load_sorted_list() {
        let a1 = record(1, 8001, 0.20);
        let a2 = record(2, 8002, 0.05);
        let reg = registry_with(vec![a1, a2]).await;
        let ordered = reg.agents_for_device(7).await;
        let loads: Vec<f64> = ordered.iter().map(|a| a.load_avg()).collect();
        assert_eq!(loads, vec![0.05, 0.20]);
    }

    #[tokio::test]
    async fn test_dead_agents_excluded() {
        let a1 = record(1, 8001, 0.10);
        let a2 = record(2, 8002, 0.05);
        a2.set_alive(false);
        let reg = registry_with(vec![a1, a2]).await;
        let ordered = reg.agents_for_device(7).await;
        assert_eq!(ordered.len(), 1);
        assert_eq!(ordered[0].id, 1);
    }

    #[test]
    fn test_load_history_window() {
        let rec = record(1, 8001, 0.4);
        rec.set_load(0.2, Duration::from_secs(30));
        assert!((rec.load_avg() - 0.3).abs() < 1e-9);

        // dead agents lose their history
        rec.set_alive(false);
        rec.set_load(0.9, Duration::from_secs(30));
        assert_eq!(rec.load_avg(), 0.0);
        assert!(!rec.has_load_samples());
    }
}
