use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use prometheus::proto::{LabelPair, Metric, MetricFamily, MetricType, Untyped};
use prometheus::{Encoder, Gauge, TextEncoder};
use protobuf::RepeatedField;
use tokio::sync::Mutex;

use super::ping::PingMeasure;
use super::result::{ErrorKind, PollResult};

lazy_static! {
    pub static ref WORKERS_COUNT: Gauge = prometheus::register_gauge!(
        "agent_worker_count",
        "Number of max workers for this agent."
    )
    .unwrap();
    pub static ref CURR_SAMPLE_COUNT: Gauge = prometheus::register_gauge!(
        "agent_sample_count",
        "Number of prom samples currently in memory of the agent."
    )
    .unwrap();
    pub static ref ONGOING_POLL_COUNT: Gauge = prometheus::register_gauge!(
        "agent_snmp_poll_count",
        "Number of currently ongoing snmp polls on this agent."
    )
    .unwrap();
    pub static ref SNMP_SCRAPES: Gauge = prometheus::register_gauge!(
        "agent_snmp_scrape_total",
        "Number of total prometheus snmp scrapes count."
    )
    .unwrap();
    pub static ref SNMP_SCRAPE_DURATION: Gauge = prometheus::register_gauge!(
        "agent_snmp_scrape_duration_seconds",
        "snmp scrape duration."
    )
    .unwrap();
}

/// Internal process metrics exposed on `/metrics`.
pub fn internal_metrics() -> String {
    let families = prometheus::gather();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buf) {
        tracing::error!("encode internal metrics: {}", e);
    }
    String::from_utf8(buf).unwrap_or_default()
}

/// One sample kept in the scrape cache.
#[derive(Debug, Clone)]
pub struct PromSample {
    /// Metric name, `<measure name>_<metric name>` for poll results.
    pub name: String,

    /// Help text, usually the snmp oid.
    pub desc: String,

    pub value: f64,

    pub labels: HashMap<String, String>,

    /// Poll start time; scraped samples carry this as their timestamp.
    pub stamp: DateTime<Utc>,
}

/// Bounded-memory sample cache. Samples are keyed by an FNV-1a hash of
/// (name, sorted label pairs) so a fresh poll overwrites the previous
/// sample of the same series; a sweeper evicts samples older than
/// `max_age`.
pub struct PromCache {
    samples: Mutex<HashMap<u64, PromSample>>,
    max_age: Duration,
    sweep_freq: Duration,
    scrapes: AtomicU64,
    scrape_duration_ns: AtomicU64,
    sample_count: AtomicU64,
}

impl PromCache {
    pub fn new(max_age_secs: u64, sweep_freq_secs: u64) -> anyhow::Result<Arc<Self>> {
        if max_age_secs == 0 || sweep_freq_secs == 0 {
            anyhow::bail!("max_result_age or sweep_frequency must be set");
        }
        let cache = Arc::new(PromCache {
            samples: Mutex::new(HashMap::new()),
            max_age: Duration::from_secs(max_age_secs),
            sweep_freq: Duration::from_secs(sweep_freq_secs),
            scrapes: AtomicU64::new(0),
            scrape_duration_ns: AtomicU64::new(0),
            sample_count: AtomicU64::new(0),
        });
        tokio::spawn(sweep_loop(Arc::clone(&cache)));
        Ok(cache)
    }

    pub async fn push(&self, sample: PromSample) {
        let key = sample_key(&sample);
        let mut samples = self.samples.lock().await;
        samples.insert(key, sample);
        self.sample_count.store(samples.len() as u64, Ordering::Relaxed);
    }

    /// Evicts samples older than `max_age`. The map is reallocated when it
    /// empties to release its capacity.
    pub async fn sweep(&self) {
        let min_stamp = Utc::now() - self.max_age;
        let mut samples = self.samples.lock().await;
        let before = samples.len();
        samples.retain(|_, s| s.stamp >= min_stamp);
        if samples.is_empty() {
            *samples = HashMap::new();
        }
        self.sample_count.store(samples.len() as u64, Ordering::Relaxed);
        tracing::debug!("{} prom samples after cleanup, {} outdated samples deleted", samples.len(), before - samples.len());
    }

    /// Materialises the cache into prometheus exposition text. A snapshot
    /// is taken under the lock, then released before serialisation; every
    /// sample is encoded as an untyped metric stamped with its own
    /// timestamp.
    pub async fn scrape(&self) -> String {
        let start = std::time::Instant::now();
        let snapshot: Vec<PromSample> = {
            let samples = self.samples.lock().await;
            samples.values().cloned().collect()
        };

        let mut by_name: BTreeMap<String, Vec<&PromSample>> = BTreeMap::new();
        for s in &snapshot {
            by_name.entry(s.name.clone()).or_default().push(s);
        }

        let mut families = Vec::with_capacity(by_name.len());
        for (name, group) in by_name {
            let mut fam = MetricFamily::default();
            fam.set_name(name);
            fam.set_help(group[0].desc.clone());
            fam.set_field_type(MetricType::UNTYPED);
            let metrics: Vec<Metric> = group
                .iter()
                .map(|s| {
                    let mut labels: Vec<(&String, &String)> = s.labels.iter().collect();
                    labels.sort();
                    let pairs: Vec<LabelPair> = labels
                        .into_iter()
                        .map(|(k, v)| {
                            let mut lp = LabelPair::default();
                            lp.set_name(k.clone());
                            lp.set_value(v.clone());
                            lp
                        })
                        .collect();
                    let mut untyped = Untyped::default();
                    untyped.set_value(s.value);
                    let mut m = Metric::default();
                    m.set_label(RepeatedField::from_vec(pairs));
                    m.set_untyped(untyped);
                    m.set_timestamp_ms(s.stamp.timestamp_millis());
                    m
                })
                .collect();
            fam.set_metric(RepeatedField::from_vec(metrics));
            families.push(fam);
        }

        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        if let Err(e) = encoder.encode(&families, &mut buf) {
            tracing::error!("scrape encode: {}", e);
        }
        self.scrapes.fetch_add(1, Ordering::SeqCst);
        self.scrape_duration_ns.store(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
        tracing::debug!("scrape done in {:?} ({} samples)", start.elapsed(), snapshot.len());
        String::from_utf8(buf).unwrap_or_default()
    }

    pub fn scrape_count(&self) -> u64 {
        self.scrapes.load(Ordering::SeqCst)
    }

    pub fn scrape_duration(&self) -> Duration {
        Duration::from_nanos(self.scrape_duration_ns.load(Ordering::Relaxed))
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count.load(Ordering::Relaxed)
    }
}

async fn sweep_loop(cache: Arc<PromCache>) {
    let mut tick = tokio::time::interval(cache.sweep_freq);
    tick.tick().await; // immediate first tick
    loop {
        tick.tick().await;
        cache.sweep().await;
    }
}

/// Consistent 64-bit FNV-1a hash of the sample's name and sorted
/// label=value pairs, used as the cache key.
fn sample_key(sample: &PromSample) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut names: Vec<&String> = sample.labels.keys().collect();
    names.sort();
    let mut id = sample.name.clone();
    for label in names {
        id.push_str(label);
        id.push_str(&sample.labels[label]);
    }
    let mut hash = FNV_OFFSET;
    for b in id.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Prometheus sink for snmp poll results.
pub struct SnmpCollector {
    pub cache: Arc<PromCache>,
}

impl SnmpCollector {
    /// Converts a poll result to samples: four operational samples tagged
    /// with the device tag map, then one sample per exported metric.
    pub async fn push(&self, res: &PollResult) {
        let stamp = res.stamp.unwrap_or(res.poll_start);
        let mut operational = vec![
            PromSample {
                name: "snmp_poll_timeout_count".into(),
                desc: "current snmp poll failed due to timeout".into(),
                value: if res.err_kind == ErrorKind::Timeout { 1.0 } else { 0.0 },
                labels: res.tags.clone(),
                stamp,
            },
            PromSample {
                name: "snmp_poll_refused_count".into(),
                desc: "current snmp poll failed due to connection refused".into(),
                value: if res.err_kind == ErrorKind::Refused { 1.0 } else { 0.0 },
                labels: res.tags.clone(),
                stamp,
            },
            PromSample {
                name: "snmp_poll_duration_ms".into(),
                desc: "snmp polling duration".into(),
                value: res.duration_ms as f64,
                labels: res.tags.clone(),
                stamp,
            },
            PromSample {
                name: "snmp_poll_metric_count".into(),
                desc: "number of snmp metrics in poll result".into(),
                value: res.metric_count as f64,
                labels: res.tags.clone(),
                stamp,
            },
        ];
        for sample in operational.drain(..) {
            self.cache.push(sample).await;
        }

        for scalar in &res.scalar_measures {
            for r in &scalar.results {
                if !r.to_prom {
                    continue;
                }
                let mut labels = res.tags.clone();
                labels.insert("oid".into(), r.oid.clone());
                let sample = if r.as_label {
                    labels.insert(r.name.clone(), r.value.to_string());
                    PromSample {
                        name: format!("{}_{}", scalar.name, r.name),
                        desc: r.description.clone(),
                        value: 1.0,
                        labels,
                        stamp,
                    }
                } else {
                    let Some(value) = r.value.as_f64() else { continue };
                    PromSample {
                        name: format!("{}_{}", scalar.name, r.name),
                        desc: r.description.clone(),
                        value,
                        labels,
                        stamp,
                    }
                };
                self.cache.push(sample).await;
            }
        }

        for indexed in &res.indexed_measures {
            for row in &indexed.results {
                let mut row_labels: HashMap<String, String> = HashMap::new();
                let mut index = String::new();
                for r in row {
                    if r.to_prom && r.as_label {
                        row_labels.insert(r.name.clone(), r.value.to_string());
                    }
                    if index.is_empty() && !r.index.is_empty() {
                        index = r.index.clone();
                    }
                }
                let mut emitted = false;
                for r in row {
                    if !r.to_prom || r.as_label {
                        continue;
                    }
                    let Some(value) = r.value.as_f64() else { continue };
                    let mut labels = res.tags.clone();
                    labels.extend(row_labels.clone());
                    labels.insert("oid".into(), r.oid.clone());
                    labels.insert("index".into(), r.index.clone());
                    self.cache
                        .push(PromSample {
                            name: format!("{}_{}", indexed.name, r.name),
                            desc: r.description.clone(),
                            value,
                            labels,
                            stamp,
                        })
                        .await;
                    emitted = true;
                }
                if !emitted && indexed.labels_only && !row_labels.is_empty() {
                    // label-carrier row: one synthetic sample holding the labels
                    let mut labels = res.tags.clone();
                    labels.extend(row_labels);
                    labels.insert("index".into(), index);
                    self.cache
                        .push(PromSample {
                            name: indexed.name.clone(),
                            desc: "labels-only indexed row".into(),
                            value: 1.0,
                            labels,
                            stamp,
                        })
                        .await;
                }
            }
        }
    }
}

/// Prometheus sink for ping results.
pub struct PingCollector {
    pub cache: Arc<PromCache>,
}

impl PingCollector {
    pub async fn push(&self, meas: &PingMeasure) {
        let host_id: String = meas.hostname.chars().take(4).collect();
        let labels: HashMap<String, String> = [
            ("id".to_string(), host_id),
            ("host".to_string(), meas.hostname.clone()),
            ("ip_address".to_string(), meas.ip_addr.clone()),
            ("device_type".to_string(), meas.category.clone()),
            ("device_vendor".to_string(), meas.vendor.clone()),
            ("device_model".to_string(), meas.model.clone()),
        ]
        .into_iter()
        .collect();
        let samples = [
            ("ping_min_duration_seconds", "min ping RTT time on this measure", meas.min),
            ("ping_max_duration_seconds", "max ping RTT time on this measure", meas.max),
            ("ping_avg_duration_seconds", "average ping RTT time on this measure", meas.avg),
            ("ping_loss_ratio", "ping packet loss ratio on this measure", meas.loss),
        ];
        for (name, desc, value) in samples {
            self.cache
                .push(PromSample {
                    name: name.into(),
                    desc: desc.into(),
                    value,
                    labels: labels.clone(),
                    stamp: meas.stamp,
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::result::{IndexedResults, MetricResult, ResultValue, ScalarResults};

    fn sample(name: &str, labels: &[(&str, &str)]) -> PromSample {
        PromSample {
            name: name.into(),
            desc: "d".into(),
            value: 1.0,
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            stamp: Utc::now(),
        }
    }

    #[test]
    fn test_sample_key_label_order_independent() {
        let a = sample("m", &[("x", "1"), ("y", "2")]);
        let b = sample("m", &[("y", "2"), ("x", "1")]);
        assert_eq!(sample_key(&a), sample_key(&b));
        let c = sample("m", &[("x", "1"), ("y", "3")]);
        assert_ne!(sample_key(&a), sample_key(&c));
        let d = sample("m2", &[("x", "1"), ("y", "2")]);
        assert_ne!(sample_key(&a), sample_key(&d));
    }

    #[tokio::test]
    async fn test_push_overwrites_same_series() {
        let cache = PromCache::new(300, 120).unwrap();
        cache.push(sample("m", &[("id", "1")])).await;
        let mut newer = sample("m", &[("id", "1")]);
        newer.value = 5.0;
        cache.push(newer).await;
        assert_eq!(cache.sample_count(), 1);
        let text = cache.scrape().await;
        assert!(text.contains("m{id=\"1\"} 5"), "unexpected scrape: {}", text);
        assert_eq!(cache.scrape_count(), 1);
    }

    #[tokio::test]
    async fn test_sweep_evicts_old_samples() {
        let cache = PromCache::new(60, 120).unwrap();
        let mut old = sample("m", &[("id", "1")]);
        old.stamp = Utc::now() - chrono::Duration::seconds(120);
        cache.push(old).await;
        cache.push(sample("m", &[("id", "2")])).await;
        assert_eq!(cache.sample_count(), 2);
        cache.sweep().await;
        assert_eq!(cache.sample_count(), 1);
    }

    #[tokio::test]
    async fn test_scrape_carries_timestamps() {
        let cache = PromCache::new(300, 120).unwrap();
        let s = sample("m", &[("id", "1")]);
        let ts = s.stamp.timestamp_millis();
        cache.push(s).await;
        let text = cache.scrape().await;
        assert!(text.contains(&ts.to_string()), "timestamp missing in: {}", text);
    }

    fn poll_result() -> PollResult {
        let mut res = PollResult::default();
        res.request_id = "t@1".into();
        res.stamp = Some(Utc::now());
        res.tags = [("id".to_string(), "1".to_string())].into_iter().collect();
        res
    }

    #[tokio::test]
    async fn test_snmp_push_operational_samples() {
        let cache = PromCache::new(300, 120).unwrap();
        let collector = SnmpCollector { cache: Arc::clone(&cache) };
        let mut res = poll_result();
        res.poll_error = "request timeout".into();
        res.err_kind = ErrorKind::Timeout;
        res.duration_ms = 250;
        collector.push(&res).await;
        let text = cache.scrape().await;
        assert!(text.contains("snmp_poll_timeout_count{id=\"1\"} 1"));
        assert!(text.contains("snmp_poll_refused_count{id=\"1\"} 0"));
        assert!(text.contains("snmp_poll_duration_ms{id=\"1\"} 250"));
        assert!(text.contains("snmp_poll_metric_count{id=\"1\"} 0"));
    }

    #[tokio::test]
    async fn test_snmp_push_scalar_and_label() {
        let cache = PromCache::new(300, 120).unwrap();
        let collector = SnmpCollector { cache: Arc::clone(&cache) };
        let mut res = poll_result();
        res.scalar_measures = vec![ScalarResults {
            name: "sys".into(),
            results: vec![
                MetricResult {
                    name: "upTime".into(),
                    oid: ".1.3".into(),
                    value: ResultValue::Uint(42),
                    to_prom: true,
                    ..Default::default()
                },
                MetricResult {
                    name: "sysName".into(),
                    oid: ".1.5".into(),
                    value: ResultValue::Text("sw1".into()),
                    to_prom: true,
                    as_label: true,
                    ..Default::default()
                },
                MetricResult {
                    name: "descr".into(),
                    oid: ".1.1".into(),
                    value: ResultValue::Text("not numeric".into()),
                    to_prom: true,
                    ..Default::default()
                },
            ],
        }];
        collector.push(&res).await;
        let text = cache.scrape().await;
        assert!(text.contains("sys_upTime"));
        assert!(text.contains("sys_sysName"));
        assert!(text.contains("sysName=\"sw1\""));
        // non-numeric non-label values are dropped
        assert!(!text.contains("sys_descr"));
    }

    #[tokio::test]
    async fn test_snmp_push_labels_only_row() {
        let cache = PromCache::new(300, 120).unwrap();
        let collector = SnmpCollector { cache: Arc::clone(&cache) };
        let mut res = poll_result();
        res.indexed_measures = vec![IndexedResults {
            name: "ifInfo".into(),
            labels_only: true,
            results: vec![vec![MetricResult {
                name: "ifName".into(),
                oid: ".1.3".into(),
                index: "7".into(),
                value: ResultValue::Text("eth0".into()),
                to_prom: true,
                as_label: true,
                ..Default::default()
            }]],
        }];
        collector.push(&res).await;
        let text = cache.scrape().await;
        assert!(text.contains("ifInfo{"));
        assert!(text.contains("ifName=\"eth0\""));
        assert!(text.contains("index=\"7\""));
    }
}
