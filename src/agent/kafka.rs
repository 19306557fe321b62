use std::sync::Arc;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};

use crate::config::AgentConfig;

use super::result::PollResult;

/// Kafka producer sink for snmp results. Payloads are pruned to the
/// metrics flagged for kafka, deduplicated and published as JSON keyed by
/// the request UID.
pub struct KafkaClient {
    producer: FutureProducer,
    topic: String,
}

impl KafkaClient {
    pub fn connect(cfg: &AgentConfig) -> anyhow::Result<Arc<Self>> {
        if cfg.kafka_brokers.is_empty() || cfg.kafka_topic.is_empty() {
            anyhow::bail!("kafka brokers and topic must all be defined");
        }
        tracing::debug!("connecting to kafka {:?}", cfg.kafka_brokers);
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &cfg.kafka_brokers)
            .set("client.id", format!("netpulse-agent[{}]", std::process::id()))
            .set("compression.type", "gzip")
            .set("acks", "1")
            .create()
            .map_err(|e| anyhow::anyhow!("kafka producer: {}", e))?;
        tracing::debug!("connected to kafka {:?}", cfg.kafka_brokers);
        Ok(Arc::new(KafkaClient {
            producer,
            topic: cfg.kafka_topic.clone(),
        }))
    }

    pub async fn push(&self, mut res: PollResult) {
        res.prune_for_kafka();
        for indexed in &mut res.indexed_measures {
            indexed.dedup_desc();
        }
        let payload = match serde_json::to_vec(&res) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!("{}: poll result marshal: {}", res.request_id, e);
                return;
            }
        };
        let start = std::time::Instant::now();
        tracing::debug!("{}: writing to kafka, payload of {} bytes", res.request_id, payload.len());
        let record = FutureRecord::to(&self.topic).key(&res.request_id).payload(&payload);
        match self.producer.send(record, Duration::from_secs(5)).await {
            Ok(_) => {
                tracing::debug!("{}: kafka write done in {:?}", res.request_id, start.elapsed());
            }
            Err((e, _)) => {
                tracing::error!("{}: kafka write: {}", res.request_id, e);
            }
        }
    }
}
