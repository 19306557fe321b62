pub mod api;
pub mod executor;
pub mod influx;
pub mod kafka;
pub mod nats;
pub mod ping;
pub mod prom;
pub mod report;
pub mod result;
pub mod snmp;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, OwnedSemaphorePermit, RwLock, Semaphore};

use crate::config::AgentConfig;
use crate::model::{PingRequest, SnmpRequest};

use self::result::PollResult;

/// Connected result sinks; each poll result is fanned out to every one
/// that is configured.
#[derive(Default)]
pub struct Sinks {
    pub snmp_collector: Option<Arc<prom::SnmpCollector>>,
    pub ping_collector: Option<Arc<prom::PingCollector>>,
    pub influx: Option<Arc<influx::InfluxClient>>,
    pub kafka: Option<Arc<kafka::KafkaClient>>,
    pub nats: Option<Arc<nats::NatsClient>>,
}

/// Process-wide agent state: bounded job queues, the in-flight request
/// set and the graceful-quit flag. Only the intake inserts into the
/// ongoing set and only the results handler removes from it.
pub struct AgentState {
    pub cfg: AgentConfig,

    snmp_queue: mpsc::Sender<(SnmpRequest, OwnedSemaphorePermit)>,
    snmp_slots: Arc<Semaphore>,

    ping_queue: mpsc::Sender<(PingRequest, OwnedSemaphorePermit)>,
    ping_slots: Arc<Semaphore>,

    /// Requests dequeued but not yet executing, for the stats log.
    waiting: AtomicI64,

    ongoing: RwLock<HashSet<String>>,

    graceful_quit: AtomicBool,

    results: mpsc::Sender<PollResult>,

    pub sinks: Sinks,
}

impl AgentState {
    /// Builds the state and starts the snmp dispatcher loop, the ping
    /// dispatcher loop and the results handler.
    pub fn new(cfg: AgentConfig, sinks: Sinks) -> Arc<Self> {
        let capacity = cfg.max_snmp_requests.max(1);
        let ping_capacity = cfg.max_ping_procs.max(1);
        let (snmp_tx, snmp_rx) = mpsc::channel(capacity);
        let (ping_tx, ping_rx) = mpsc::channel(ping_capacity);
        let (results_tx, results_rx) = mpsc::channel(capacity);

        let state = Arc::new(AgentState {
            cfg,
            snmp_queue: snmp_tx,
            snmp_slots: Arc::new(Semaphore::new(capacity)),
            ping_queue: ping_tx,
            ping_slots: Arc::new(Semaphore::new(ping_capacity)),
            waiting: AtomicI64::new(0),
            ongoing: RwLock::new(HashSet::new()),
            graceful_quit: AtomicBool::new(false),
            results: results_tx,
            sinks,
        });

        tracing::info!("initializing {} snmp workers", state.cfg.max_snmp_requests);
        tokio::spawn(dispatch_snmp(Arc::clone(&state), snmp_rx));
        tokio::spawn(handle_poll_results(Arc::clone(&state), results_rx));
        if state.cfg.max_ping_procs > 0 {
            tokio::spawn(ping::dispatch(Arc::clone(&state), ping_rx));
        }
        if state.cfg.stats_freq_secs > 0 {
            tokio::spawn(update_stats(Arc::clone(&state)));
        }
        state
    }

    /// Queues an snmp request, acquiring a worker slot atomically.
    /// Returns false when the queue is full; the slot is held until the
    /// poll result has been handed to the sinks.
    pub fn add_snmp_request(&self, req: SnmpRequest) -> bool {
        match Arc::clone(&self.snmp_slots).try_acquire_owned() {
            Ok(permit) => {
                tracing::debug!("got worker, adding snmp req {}", req.uid);
                self.snmp_queue.try_send((req, permit)).is_ok()
            }
            Err(_) => {
                tracing::debug!("snmp work queue full");
                false
            }
        }
    }

    /// Queues a ping batch. Returns false when all fping slots are busy.
    pub fn add_ping_request(&self, req: PingRequest) -> bool {
        match Arc::clone(&self.ping_slots).try_acquire_owned() {
            Ok(permit) => {
                tracing::debug!("adding ping req {}", req.uid);
                self.ping_queue.try_send((req, permit)).is_ok()
            }
            Err(_) => {
                tracing::debug!("ping work queue full");
                false
            }
        }
    }

    /// Current snmp load: `(queued + waiting + ongoing) / capacity`.
    /// A worker slot is held from intake through result handling, so the
    /// taken-permit count is exactly that sum.
    pub fn current_load(&self) -> f64 {
        let capacity = self.cfg.max_snmp_requests.max(1);
        let taken = capacity - self.snmp_slots.available_permits();
        taken as f64 / capacity as f64
    }

    /// In-flight request UIDs.
    pub async fn ongoing_uids(&self) -> Vec<String> {
        self.ongoing.read().await.iter().cloned().collect()
    }

    pub fn begin_graceful_quit(&self) {
        self.graceful_quit.store(true, Ordering::SeqCst);
    }

    pub fn is_graceful_quit(&self) -> bool {
        self.graceful_quit.load(Ordering::SeqCst)
    }

    /// Scrape count of the snmp collector, used by the graceful-quit
    /// final-scrape wait.
    pub fn snmp_scrape_count(&self) -> u64 {
        self.sinks
            .snmp_collector
            .as_ref()
            .map(|c| c.cache.scrape_count())
            .unwrap_or(0)
    }
}

/// Dequeues snmp requests, enforces the inter-poll spacing and spawns one
/// executor task per request.
async fn dispatch_snmp(state: Arc<AgentState>, mut rx: mpsc::Receiver<(SnmpRequest, OwnedSemaphorePermit)>) {
    let delay = Duration::from_millis(state.cfg.inter_poll_delay_ms);
    let mut prev_poll = Instant::now();
    while let Some((req, permit)) = rx.recv().await {
        tracing::debug!("{} - new request from queue", req.uid);
        state.waiting.fetch_add(1, Ordering::SeqCst);
        let since_prev = prev_poll.elapsed();
        if since_prev < delay {
            tracing::debug!("{} - waiting before poll", req.uid);
            tokio::time::sleep(delay - since_prev).await;
        }
        prev_poll = Instant::now();
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let uid = req.uid.clone();
            tracing::debug!("{} - start polling", uid);
            state.ongoing.write().await.insert(uid.clone());
            state.waiting.fetch_sub(1, Ordering::SeqCst);
            let res = executor::poll(req, state.cfg.mock_snmp).await;
            if state.results.send(res).await.is_err() {
                tracing::error!("{} - results channel closed", uid);
            }
            tracing::debug!("{} - done polling", uid);
            drop(permit);
        });
    }
    tracing::debug!("snmp dispatch loop terminated");
}

/// Stamps each new result, removes it from the ongoing set and fans it
/// out to every configured sink. The completion report is posted on its
/// own task with the load measured after the slot release.
async fn handle_poll_results(state: Arc<AgentState>, mut rx: mpsc::Receiver<PollResult>) {
    while let Some(mut res) = rx.recv().await {
        res.stamp = Some(Utc::now());
        state.ongoing.write().await.remove(&res.request_id);
        if !res.poll_error.is_empty() {
            tracing::debug!("{} - poll failed: {}, partial result? {}", res.request_id, res.poll_error, res.is_partial);
        }
        res.metric_count = res.count_metrics();

        if let Some(collector) = &state.sinks.snmp_collector {
            let collector = Arc::clone(collector);
            let copy = res.clone();
            tokio::spawn(async move { collector.push(&copy).await });
        }
        if let Some(influx) = &state.sinks.influx {
            let influx = Arc::clone(influx);
            let copy = res.clone();
            tokio::spawn(async move { influx.push(copy).await });
        }
        if let Some(kafka) = &state.sinks.kafka {
            let kafka = Arc::clone(kafka);
            let copy = res.clone();
            tokio::spawn(async move { kafka.push(copy).await });
        }
        if let Some(nats) = &state.sinks.nats {
            let nats = Arc::clone(nats);
            let copy = res.clone();
            tokio::spawn(async move { nats.push(copy).await });
        }

        let load = state.current_load();
        tokio::spawn(async move { report::send(&res, load).await });
    }
}

/// Periodically refreshes the internal gauges and logs a summary line.
async fn update_stats(state: Arc<AgentState>) {
    let mut tick = tokio::time::interval(Duration::from_secs(state.cfg.stats_freq_secs));
    loop {
        tick.tick().await;
        let ongoing = state.ongoing.read().await.len();
        let samples = state
            .sinks
            .snmp_collector
            .as_ref()
            .map(|c| c.cache.sample_count())
            .unwrap_or(0);
        let (scrapes, scrape_dur) = state
            .sinks
            .snmp_collector
            .as_ref()
            .map(|c| (c.cache.scrape_count(), c.cache.scrape_duration()))
            .unwrap_or((0, Duration::ZERO));
        prom::WORKERS_COUNT.set(state.cfg.max_snmp_requests as f64);
        prom::ONGOING_POLL_COUNT.set(ongoing as f64);
        prom::CURR_SAMPLE_COUNT.set(samples as f64);
        prom::SNMP_SCRAPES.set(scrapes as f64);
        prom::SNMP_SCRAPE_DURATION.set(scrape_dur.as_secs_f64());
        tracing::debug!(
            "ongoing={} waiting={} prom_samples={} scrape_count={} scrape_dur={:?} load={:.4}",
            ongoing,
            state.waiting.load(Ordering::SeqCst),
            samples,
            scrapes,
            scrape_dur,
            state.current_load()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_request(uid: &str) -> SnmpRequest {
        let mut req: SnmpRequest = serde_json::from_str(&format!(
            r#"{{
                "uid": "{}",
                "device": {{
                    "id": 9, "hostname": "h", "to_prometheus": true,
                    "ip_address": "127.0.0.1", "snmp_community": "public",
                    "category": "c", "vendor": "v", "model": "m"
                }}
            }}"#,
            uid
        ))
        .unwrap();
        req.prepare().unwrap();
        req
    }

    fn test_state(capacity: usize) -> Arc<AgentState> {
        let mut cfg = AgentConfig::load();
        cfg.max_snmp_requests = capacity;
        cfg.max_ping_procs = 1;
        cfg.stats_freq_secs = 0;
        cfg.mock_snmp = true;
        AgentState::new(cfg, Sinks::default())
    }

    #[tokio::test]
    async fn test_queue_rejects_when_full() {
        let state = test_state(2);
        assert!(state.add_snmp_request(test_request("a@1")));
        assert!(state.add_snmp_request(test_request("b@2")));
        // both slots taken and not yet released
        assert!(!state.add_snmp_request(test_request("c@3")));
    }

    #[tokio::test]
    async fn test_load_monotonic_with_pending_work() {
        let state = test_state(4);
        assert_eq!(state.current_load(), 0.0);
        state.add_snmp_request(test_request("a@1"));
        let l1 = state.current_load();
        state.add_snmp_request(test_request("b@2"));
        let l2 = state.current_load();
        assert!(l1 > 0.0 && l2 > l1 && l2 <= 1.0);
    }

    #[tokio::test]
    async fn test_graceful_quit_flag() {
        let state = test_state(1);
        assert!(!state.is_graceful_quit());
        state.begin_graceful_quit();
        assert!(state.is_graceful_quit());
    }
}
