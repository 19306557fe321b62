use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Handle used by the debug endpoints to change verbosity at runtime.
#[derive(Clone)]
pub struct LevelHandle {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl LevelHandle {
    /// Maps the wire debug level onto tracing filters:
    /// 0 = info, 1 = debug, 2..3 = trace.
    pub fn set_level(&self, level: u8) -> anyhow::Result<()> {
        let filter = match level {
            0 => "netpulse=info,tower_http=info",
            1 => "netpulse=debug,tower_http=debug",
            _ => "netpulse=trace,tower_http=debug",
        };
        self.handle
            .reload(EnvFilter::new(filter))
            .map_err(|e| anyhow::anyhow!("reload filter: {}", e))
    }
}

/// Initialises the tracing subscriber with an env-derived filter and
/// returns the reload handle for the `/-/debug` endpoints.
pub fn init() -> LevelHandle {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("netpulse=info,tower_http=debug"));
    let (filter, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
    LevelHandle { handle }
}
