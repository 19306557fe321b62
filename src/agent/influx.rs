use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::stream;
use influxdb2::models::DataPoint;
use influxdb2::Client;
use tokio::sync::mpsc;

use crate::config::AgentConfig;

use super::result::{PollResult, ResultValue};

struct Batch {
    req_id: String,
    points: Vec<DataPoint>,
}

/// InfluxDB result pusher. Conversion happens on the caller's task; a
/// single writer task consumes the batch channel and retries failed
/// writes with exponential backoff.
pub struct InfluxClient {
    bucket: String,
    write_retries: u32,
    batches: mpsc::Sender<Batch>,
}

impl InfluxClient {
    /// Connects to the influx server and verifies it is ready before
    /// starting the writer.
    pub async fn connect(cfg: &AgentConfig) -> anyhow::Result<Arc<Self>> {
        if cfg.influx_url.is_empty() || cfg.influx_org.is_empty() || cfg.influx_bucket.is_empty() || cfg.influx_token.is_empty() {
            anyhow::bail!("influx url, org, bucket and token must all be defined");
        }
        tracing::debug!("connecting to influx {:?}", cfg.influx_url);
        let client = Client::new(&cfg.influx_url, &cfg.influx_org, &cfg.influx_token);
        tokio::time::timeout(Duration::from_secs(cfg.influx_timeout_secs), client.health())
            .await
            .context("influx health check timed out")?
            .context("influx health")?;
        tracing::debug!("connected to influx {:?}", cfg.influx_url);

        let (tx, rx) = mpsc::channel(16);
        let pusher = Arc::new(InfluxClient {
            bucket: cfg.influx_bucket.clone(),
            write_retries: cfg.influx_write_retries,
            batches: tx,
        });
        tokio::spawn(send_loop(client, pusher.bucket.clone(), pusher.write_retries, rx));
        Ok(pusher)
    }

    /// Converts the result to batch points and hands them to the writer.
    pub async fn push(&self, res: PollResult) {
        let points = match make_points(&res) {
            Ok(points) => points,
            Err(e) => {
                tracing::error!("influx make batch point: {}, skipping", e);
                return;
            }
        };
        if points.is_empty() {
            return;
        }
        tracing::debug!("{} - pushing {} points to influx queue", res.request_id, points.len());
        if self
            .batches
            .send(Batch {
                req_id: res.request_id.clone(),
                points,
            })
            .await
            .is_err()
        {
            tracing::error!("{} - influx writer gone", res.request_id);
        }
    }
}

/// Single writer: consumes batches and writes them, retrying up to
/// `write_retries` times with exponential wait starting at 1s. A partial
/// write means some points were already stored, so the batch is dropped
/// rather than re-sent.
async fn send_loop(client: Client, bucket: String, write_retries: u32, mut rx: mpsc::Receiver<Batch>) {
    while let Some(batch) = rx.recv().await {
        let start = std::time::Instant::now();
        for attempt in 0..=write_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1 << (attempt - 1))).await;
            }
            tracing::debug!("{} - try #{}/{}: writing to influx", batch.req_id, attempt + 1, write_retries + 1);
            match client.write(&bucket, stream::iter(batch.points.clone())).await {
                Ok(()) => {
                    tracing::debug!("{} - influx write done in {:?}", batch.req_id, start.elapsed());
                    break;
                }
                Err(e) => {
                    let msg = e.to_string();
                    tracing::error!("{} - try #{}/{}: influx write: {}", batch.req_id, attempt + 1, write_retries + 1, msg);
                    if msg.contains("partial write") {
                        tracing::warn!("{} - partial write, dropping batch", batch.req_id);
                        break;
                    }
                }
            }
        }
    }
    tracing::info!("influx writer terminated");
}

/// One point per scalar measure and one per indexed row; label results
/// become tags, the rest become fields.
fn make_points(res: &PollResult) -> anyhow::Result<Vec<DataPoint>> {
    let stamp_ns = res
        .poll_start
        .timestamp_nanos_opt()
        .unwrap_or_else(|| res.poll_start.timestamp_millis() * 1_000_000);
    let mut points = Vec::new();

    for scalar in &res.scalar_measures {
        let mut builder = DataPoint::builder(&scalar.name).timestamp(stamp_ns);
        for (k, v) in &res.tags {
            builder = builder.tag(k, v);
        }
        let mut has_field = false;
        for r in &scalar.results {
            if !r.to_influx {
                continue;
            }
            builder = add_field(builder, &r.name, &r.value);
            has_field = true;
        }
        if has_field {
            points.push(builder.build().map_err(|e| anyhow::anyhow!("scalar res {}: {}", scalar.name, e))?);
        }
    }

    for indexed in &res.indexed_measures {
        for row in &indexed.results {
            let mut builder = DataPoint::builder(&indexed.name).timestamp(stamp_ns);
            for (k, v) in &res.tags {
                builder = builder.tag(k, v);
            }
            let mut has_field = false;
            for r in row {
                if !r.to_influx {
                    continue;
                }
                if r.as_label {
                    builder = builder.tag(&r.name, r.value.to_string());
                } else {
                    builder = add_field(builder, &r.name, &r.value);
                    has_field = true;
                }
            }
            if has_field {
                points.push(builder.build().map_err(|e| anyhow::anyhow!("indexed res {}: {}", indexed.name, e))?);
            }
        }
    }
    Ok(points)
}

fn add_field(builder: influxdb2::models::data_point::DataPointBuilder, name: &str, value: &ResultValue) -> influxdb2::models::data_point::DataPointBuilder {
    match value {
        ResultValue::Float(v) => builder.field(name, *v),
        ResultValue::Int(v) => builder.field(name, *v),
        ResultValue::Uint(v) => builder.field(name, *v as i64),
        ResultValue::Bool(v) => builder.field(name, *v),
        ResultValue::Text(v) => builder.field(name, v.as_str()),
        ResultValue::Null => builder,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::result::{IndexedResults, MetricResult, ScalarResults};
    use chrono::Utc;

    #[test]
    fn test_make_points_scalar_and_indexed() {
        let mut res = PollResult::default();
        res.poll_start = Utc::now();
        res.tags = [("host".to_string(), "sw1".to_string())].into_iter().collect();
        res.scalar_measures = vec![ScalarResults {
            name: "sys".into(),
            results: vec![MetricResult {
                name: "upTime".into(),
                value: ResultValue::Uint(42),
                to_influx: true,
                ..Default::default()
            }],
        }];
        res.indexed_measures = vec![IndexedResults {
            name: "ifs".into(),
            labels_only: false,
            results: vec![vec![
                MetricResult {
                    name: "ifName".into(),
                    value: ResultValue::Text("eth0".into()),
                    to_influx: true,
                    as_label: true,
                    ..Default::default()
                },
                MetricResult {
                    name: "ifInOctets".into(),
                    value: ResultValue::Float(1.5),
                    to_influx: true,
                    ..Default::default()
                },
            ]],
        }];
        let points = make_points(&res).unwrap();
        assert_eq!(points.len(), 2);
    }

    #[test]
    fn test_make_points_skips_unflagged() {
        let mut res = PollResult::default();
        res.poll_start = Utc::now();
        res.scalar_measures = vec![ScalarResults {
            name: "sys".into(),
            results: vec![MetricResult {
                name: "upTime".into(),
                value: ResultValue::Uint(42),
                to_influx: false,
                ..Default::default()
            }],
        }];
        assert!(make_points(&res).unwrap().is_empty());
    }
}
