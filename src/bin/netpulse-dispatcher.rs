use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use netpulse::config::DispatcherConfig;
use netpulse::dispatcher::ping::PingPlanner;
use netpulse::dispatcher::registry::AgentRegistry;
use netpulse::dispatcher::server::{self, ApiState};
use netpulse::dispatcher::store::Store;
use netpulse::dispatcher::{poll, unlock};
use netpulse::{logging, shutdown_signal};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let debug = logging::init();
    let cfg = DispatcherConfig::load();
    tracing::info!("Starting netpulse dispatcher");
    tracing::info!("Database: {}", cfg.database_url);
    tracing::info!("Listen: {}", cfg.listen_addr);

    let store = Store::connect(&cfg.database_url).await?;
    if cfg.advisory_lock_id > 0 {
        store.acquire_leader_lock(cfg.advisory_lock_id).await?;
    }

    let registry = AgentRegistry::new(Duration::from_secs(cfg.load_avg_window_secs), cfg.max_load_delta);
    registry.reload(&store).await?;

    let shutting_down = Arc::new(AtomicBool::new(false));

    // agent keep-alive prober; the fleet list is refreshed from the
    // store every 10 keep-alives
    if cfg.keepalive_freq_secs > 0 {
        let store = store.clone();
        let registry = Arc::clone(&registry);
        let freq = cfg.keepalive_freq_secs;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(freq));
            tick.tick().await;
            let mut loops = 0u64;
            loop {
                tick.tick().await;
                loops += 1;
                if loops % 10 == 0 {
                    if let Err(e) = registry.reload(&store).await {
                        tracing::error!("reload agents: {}", e);
                    }
                }
                registry.check_agents(&store).await;
            }
        });
    }

    // snmp job selector
    if cfg.snmp_job_freq_secs > 0 {
        let store = store.clone();
        let registry = Arc::clone(&registry);
        let job_cfg = cfg.clone();
        let shutdown = Arc::clone(&shutting_down);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(job_cfg.snmp_job_freq_secs));
            loop {
                tick.tick().await;
                if shutdown.load(Ordering::SeqCst) {
                    return;
                }
                poll::send_polling_jobs(&store, &registry, &job_cfg, &shutdown).await;
            }
        });
    } else {
        tracing::info!("snmp requests disabled");
    }

    // ping planner
    if cfg.ping_job_freq_secs > 0 {
        let store = store.clone();
        let registry = Arc::clone(&registry);
        let ping_cfg = cfg.clone();
        let planner = PingPlanner::new();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(ping_cfg.ping_job_freq_secs));
            loop {
                tick.tick().await;
                planner.send_ping_requests(&store, &registry, &ping_cfg).await;
            }
        });
    } else {
        tracing::info!("ping requests disabled");
    }

    // periodic device unlocker and hard sweep
    if cfg.unlock_freq_secs > 0 {
        let store = store.clone();
        let registry = Arc::clone(&registry);
        let unlock_cfg = cfg.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(unlock_cfg.unlock_freq_secs));
            tick.tick().await;
            loop {
                tick.tick().await;
                unlock::unlock_devices(&store, &registry).await;
                unlock::hard_unlock(&store, &unlock_cfg).await;
            }
        });
    }

    // report flusher
    if cfg.error_retention_hours > 0 {
        let store = store.clone();
        let flush_cfg = cfg.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(flush_cfg.report_flush_freq_hours * 3600));
            tick.tick().await;
            loop {
                tick.tick().await;
                unlock::flush_reports(&store, &flush_cfg).await;
            }
        });
    }

    let state = ApiState {
        store,
        registry,
        debug,
    };
    let app = server::router(state);
    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr).await?;
    tracing::info!("dispatcher listening on {}", cfg.listen_addr);

    let shutdown = Arc::clone(&shutting_down);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.store(true, Ordering::SeqCst);
            // let in-flight selector rounds unlock their devices
            tokio::time::sleep(Duration::from_millis(500)).await;
        })
        .await?;

    tracing::info!("dispatcher shutting down");
    Ok(())
}
