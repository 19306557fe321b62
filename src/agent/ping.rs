use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::process::Command;
use tokio::sync::{mpsc, OwnedSemaphorePermit};

use crate::model::PingRequest;

use super::AgentState;

/// Ping statistics of one host, ready for export.
#[derive(Debug, Clone)]
pub struct PingMeasure {
    pub hostname: String,
    pub ip_addr: String,
    pub category: String,
    pub vendor: String,
    pub model: String,

    /// Min/max/avg RTT in seconds.
    pub min: f64,
    pub max: f64,
    pub avg: f64,

    /// Packet loss ratio in [0,1].
    pub loss: f64,

    pub stamp: DateTime<Utc>,
}

impl Default for PingMeasure {
    fn default() -> Self {
        PingMeasure {
            hostname: String::new(),
            ip_addr: String::new(),
            category: String::new(),
            vendor: String::new(),
            model: String::new(),
            min: 0.0,
            max: 0.0,
            avg: 0.0,
            loss: 0.0,
            stamp: Utc::now(),
        }
    }
}

/// Dequeues ping batches and runs one fping process per batch. The worker
/// slot is held for the whole process lifetime.
pub async fn dispatch(state: Arc<AgentState>, mut rx: mpsc::Receiver<(PingRequest, OwnedSemaphorePermit)>) {
    while let Some((req, permit)) = rx.recv().await {
        tracing::debug!("{} - new ping request from queue", req.uid);
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            run(&state, req).await;
            drop(permit);
        });
    }
    tracing::debug!("ping dispatch loop terminated");
}

/// Launches fping on the batch and pushes the parsed measures to the
/// ping collector.
async fn run(state: &AgentState, mut req: PingRequest) {
    tracing::debug!("{} - start pinging {} hosts", req.uid, req.hosts.len());
    req.stamp = Some(Utc::now());
    let mut args = vec![
        "-q".to_string(),
        "-p".to_string(),
        "50".to_string(),
        "-i".to_string(),
        "10".to_string(),
        "-t".to_string(),
        "100".to_string(),
        "-C".to_string(),
        state.cfg.fping_packet_count.to_string(),
    ];
    for host in &req.hosts {
        args.push(host.ip_address.clone());
    }
    tracing::debug!("{} - launching {} {:?}", req.uid, state.cfg.fping_path, args);
    let output = match Command::new(&state.cfg.fping_path).args(&args).output().await {
        Ok(out) => out,
        Err(e) => {
            tracing::error!("{} - fping spawn: {}", req.uid, e);
            return;
        }
    };
    // fping exits 1 when some hosts are unreachable
    if let Some(code) = output.status.code() {
        if code > 1 {
            tracing::warn!("{} - fping failed with status {}", req.uid, code);
        }
    }
    // per-host RTT summaries land on stderr
    let stderr = String::from_utf8_lossy(&output.stderr);
    let measures = process_output(&req, &stderr);
    tracing::debug!("{} - ping completed, {} measures", req.uid, measures.len());
    if let Some(collector) = &state.sinks.ping_collector {
        for m in &measures {
            collector.push(m).await;
        }
    }
}

/// Parses fping's per-host output lines, e.g.
/// `10.2.7.26 : 17.82 17.73 - 17.78` (RTTs in ms, `-` for a lost packet)
/// and `ICMP Time Exceeded from 172.2.5.70 for ICMP Echo sent to 10.2.5.104`
/// which is accounted as 100% loss for the echo target.
pub fn process_output(req: &PingRequest, output: &str) -> Vec<PingMeasure> {
    let stamp = req.stamp.unwrap_or_else(Utc::now);
    let mut metrics: HashMap<String, Vec<f64>> = HashMap::new();
    for line in output.trim_end_matches('\n').lines() {
        if line.is_empty() {
            continue;
        }
        if line.starts_with("ICMP Time Exceeded from") {
            if let Some(ip_addr) = line.split_whitespace().last() {
                metrics.insert(ip_addr.to_string(), vec![0.0, 0.0]);
            }
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 3 || tokens[1] != ":" {
            tracing::error!("parse fping output: invalid line `{}`", line);
            continue;
        }
        let ip_addr = tokens[0];
        let samples = metrics.entry(ip_addr.to_string()).or_default();
        for tok in &tokens[2..] {
            if *tok == "-" {
                samples.push(0.0);
            } else {
                samples.push(tok.parse().unwrap_or(0.0));
            }
        }
    }

    let mut res = Vec::with_capacity(metrics.len());
    for (ip_addr, samples) in metrics {
        let (min, max, avg, loss) = compute_stats(&samples);
        tracing::debug!("{}: min={:.2} max={:.2} avg={:.2} loss={:.2}%", ip_addr, min, max, avg, 100.0 * loss);
        let mut meas = PingMeasure {
            ip_addr: ip_addr.clone(),
            min: min / 1000.0,
            max: max / 1000.0,
            avg: avg / 1000.0,
            loss,
            stamp,
            ..Default::default()
        };
        if let Some(host) = req.hosts.iter().find(|h| h.ip_address == ip_addr) {
            meas.hostname = host.hostname.clone();
            meas.category = host.category.clone();
            meas.vendor = host.vendor.clone();
            meas.model = host.model.clone();
        }
        res.push(meas);
    }
    res
}

/// Min, max and average RTT in ms plus the loss ratio of one sample line.
/// Lost packets are the zero samples; with no positive sample at all the
/// loss is total.
pub fn compute_stats(samples: &[f64]) -> (f64, f64, f64, f64) {
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let mut sum = 0.0;
    let mut min = 0.0;
    let mut first_positive = None;
    for (i, rtt) in sorted.iter().enumerate() {
        sum += rtt;
        if *rtt > 0.0 && first_positive.is_none() {
            min = *rtt;
            first_positive = Some(i);
        }
    }
    let Some(first_positive) = first_positive else {
        return (0.0, 0.0, 0.0, 1.0);
    };
    let max = sorted[sorted.len() - 1];
    let loss = first_positive as f64 / sorted.len() as f64;
    let avg = sum / (sorted.len() - first_positive) as f64;
    (min, max, avg, loss)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PingHost;

    #[test]
    fn test_compute_stats() {
        let (min, max, avg, loss) = compute_stats(&[8.0, 10.0, 12.0, 10.0]);
        assert_eq!(min, 8.0);
        assert_eq!(max, 12.0);
        assert_eq!(avg, 10.0);
        assert_eq!(loss, 0.0);
    }

    #[test]
    fn test_compute_stats_with_losses() {
        let (min, max, _avg, loss) = compute_stats(&[0.0, 10.0, 0.0, 14.0]);
        assert_eq!(min, 10.0);
        assert_eq!(max, 14.0);
        assert_eq!(loss, 0.5);
    }

    #[test]
    fn test_compute_stats_total_loss() {
        let (min, max, avg, loss) = compute_stats(&[0.0, 0.0]);
        assert_eq!((min, max, avg), (0.0, 0.0, 0.0));
        assert_eq!(loss, 1.0);
    }

    fn req(hosts: &[(&str, &str)]) -> PingRequest {
        PingRequest {
            uid: "p1".into(),
            hosts: hosts
                .iter()
                .map(|(name, ip)| PingHost {
                    hostname: name.to_string(),
                    ip_address: ip.to_string(),
                    category: "switch".into(),
                    vendor: "acme".into(),
                    model: "mx".into(),
                    ..Default::default()
                })
                .collect(),
            stamp: Some(Utc::now()),
        }
    }

    #[test]
    fn test_process_output_rtt_lines() {
        let r = req(&[("sw1", "10.2.7.26"), ("sw2", "10.2.1.49")]);
        let out = "10.2.7.26 : 17.82 17.73 17.67\n10.2.1.49 : 8.14 - 8.10\n";
        let mut measures = process_output(&r, out);
        measures.sort_by(|a, b| a.ip_addr.cmp(&b.ip_addr));
        assert_eq!(measures.len(), 2);

        let sw2 = &measures[0];
        assert_eq!(sw2.ip_addr, "10.2.1.49");
        assert_eq!(sw2.hostname, "sw2");
        assert!((sw2.loss - 1.0 / 3.0).abs() < 1e-9);
        // RTTs are exported in seconds
        assert!((sw2.min - 0.00810).abs() < 1e-9);

        let sw1 = &measures[1];
        assert_eq!(sw1.hostname, "sw1");
        assert_eq!(sw1.loss, 0.0);
        assert_eq!(sw1.category, "switch");
    }

    #[test]
    fn test_process_output_time_exceeded_is_total_loss() {
        let r = req(&[("sw1", "10.2.5.104")]);
        let out = "ICMP Time Exceeded from 172.2.5.70 for ICMP Echo sent to 10.2.5.104\n";
        let measures = process_output(&r, out);
        assert_eq!(measures.len(), 1);
        assert_eq!(measures[0].loss, 1.0);
        assert_eq!(measures[0].min, 0.0);
    }

    #[test]
    fn test_process_output_skips_garbage() {
        let r = req(&[("sw1", "10.0.0.1")]);
        let out = "garbage\n10.0.0.1 : 1.0\n";
        let measures = process_output(&r, out);
        assert_eq!(measures.len(), 1);
    }
}
