use std::sync::Arc;

use async_nats::{Client, ConnectOptions};

use crate::config::AgentConfig;

use super::result::PollResult;

/// Optional NATS publisher sink: JSON-encoded results on one subject.
pub struct NatsClient {
    client: Client,
    subject: String,
}

impl NatsClient {
    pub async fn connect(cfg: &AgentConfig) -> anyhow::Result<Arc<Self>> {
        if cfg.nats_urls.is_empty() || cfg.nats_subject.is_empty() {
            anyhow::bail!("nats urls and subject must all be defined");
        }
        tracing::debug!("connecting to nats {:?}", cfg.nats_urls);
        let opts = ConnectOptions::new().name(format!("netpulse-agent[{}]", std::process::id()));
        let client = opts
            .connect(&cfg.nats_urls)
            .await
            .map_err(|e| anyhow::anyhow!("nats dial: {}", e))?;
        tracing::info!("connected to nats at {}", cfg.nats_urls);
        Ok(Arc::new(NatsClient {
            client,
            subject: cfg.nats_subject.clone(),
        }))
    }

    pub async fn push(&self, res: PollResult) {
        let payload = match serde_json::to_vec(&res) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!("{}: poll result marshal: {}", res.request_id, e);
                return;
            }
        };
        let start = std::time::Instant::now();
        if let Err(e) = self.client.publish(self.subject.clone(), payload.into()).await {
            tracing::error!("{}: nats publish: {}", res.request_id, e);
            return;
        }
        if let Err(e) = self.client.flush().await {
            tracing::error!("nats queue flush: {}", e);
            return;
        }
        tracing::debug!("nats publish req {} done in {:?}", res.request_id, start.elapsed());
    }
}
