use std::sync::Arc;

use netpulse::agent::api::{self, ApiState};
use netpulse::agent::{influx, kafka, nats, prom, AgentState, Sinks};
use netpulse::config::AgentConfig;
use netpulse::{logging, shutdown_signal};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let debug = logging::init();
    let cfg = AgentConfig::load();
    cfg.validate()?;
    tracing::info!("Starting netpulse agent");
    tracing::info!("Listen: {}", cfg.listen_addr);

    if cfg.max_ping_procs > 0 && !std::path::Path::new(&cfg.fping_path).exists() {
        anyhow::bail!("fping binary not found at {}", cfg.fping_path);
    }

    let mut sinks = Sinks::default();
    if cfg.prom_max_age_secs > 0 {
        let snmp_cache = prom::PromCache::new(cfg.prom_max_age_secs, cfg.prom_sweep_freq_secs)?;
        let ping_cache = prom::PromCache::new(cfg.prom_max_age_secs, cfg.prom_sweep_freq_secs)?;
        sinks.snmp_collector = Some(Arc::new(prom::SnmpCollector { cache: snmp_cache }));
        sinks.ping_collector = Some(Arc::new(prom::PingCollector { cache: ping_cache }));
        prom::WORKERS_COUNT.set(cfg.max_snmp_requests as f64);
    }
    if !cfg.influx_url.is_empty() {
        sinks.influx = Some(influx::InfluxClient::connect(&cfg).await?);
    }
    if !cfg.kafka_brokers.is_empty() {
        sinks.kafka = Some(kafka::KafkaClient::connect(&cfg)?);
    }
    if !cfg.nats_urls.is_empty() {
        sinks.nats = Some(nats::NatsClient::connect(&cfg).await?);
    }

    let listen_addr = cfg.listen_addr.clone();
    let agent = AgentState::new(cfg, sinks);

    let app = api::router(ApiState { agent, debug });
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!("agent listening on {}", listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_signal().await;
            tracing::warn!("interrupt received, canceling all requests");
            // give outstanding job reports a moment to drain
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        })
        .await?;

    tracing::info!("agent shutting down");
    Ok(())
}
