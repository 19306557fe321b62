use std::env;

/// Dispatcher process configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub database_url: String,
    pub listen_addr: String,
    /// IP advertised in report callback URLs; defaults to the listen address host.
    pub local_ip: String,
    /// Postgres advisory lock id for leader election (0 disables).
    pub advisory_lock_id: i64,
    pub keepalive_freq_secs: u64,
    pub snmp_job_freq_secs: u64,
    pub ping_job_freq_secs: u64,
    pub ping_batch_count: usize,
    pub unlock_freq_secs: u64,
    /// Safety-net sweep: unlock any device last polled before this long ago.
    pub hard_unlock_after_secs: u64,
    pub report_flush_freq_hours: u64,
    pub error_retention_hours: u64,
    pub load_avg_window_secs: u64,
    pub max_load_delta: f64,
}

impl DispatcherConfig {
    pub fn load() -> Self {
        Self {
            database_url: get_env("DATABASE_URL", "postgres://localhost/netpulse"),
            listen_addr: get_env("LISTEN_ADDR", "0.0.0.0:8080"),
            local_ip: get_env("LOCAL_IP", ""),
            advisory_lock_id: parse_env("ADVISORY_LOCK_ID", 0),
            keepalive_freq_secs: parse_env("KEEPALIVE_FREQ_SECS", 30),
            snmp_job_freq_secs: parse_env("SNMP_JOB_FREQ_SECS", 30),
            ping_job_freq_secs: parse_env("PING_JOB_FREQ_SECS", 10),
            ping_batch_count: parse_env("PING_BATCH_COUNT", 100),
            unlock_freq_secs: parse_env("UNLOCK_FREQ_SECS", 600),
            hard_unlock_after_secs: parse_env("HARD_UNLOCK_AFTER_SECS", 3600),
            report_flush_freq_hours: parse_env("REPORT_FLUSH_FREQ_HOURS", 2),
            error_retention_hours: parse_env("ERROR_RETENTION_HOURS", 4),
            load_avg_window_secs: parse_env("LOAD_AVG_WINDOW_SECS", 30),
            max_load_delta: parse_env("MAX_LOAD_DELTA", 0.1),
        }
    }

    /// Report callback URL advertised to agents.
    pub fn report_url(&self) -> String {
        let host = if self.local_ip.is_empty() {
            self.listen_addr.clone()
        } else {
            let port = self.listen_addr.rsplit(':').next().unwrap_or("8080");
            format!("{}:{}", self.local_ip, port)
        };
        format!("http://{}{}", host, crate::model::REPORT_URI)
    }
}

/// Agent process configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub listen_addr: String,
    /// Agent id as registered in the store; sent back in reports.
    pub agent_id: i64,
    pub max_snmp_requests: usize,
    pub inter_poll_delay_ms: u64,
    pub stats_freq_secs: u64,
    /// Mock mode: fabricate poll results instead of dialing devices.
    pub mock_snmp: bool,

    // prometheus
    pub prom_max_age_secs: u64,
    pub prom_sweep_freq_secs: u64,

    // influx
    pub influx_url: String,
    pub influx_org: String,
    pub influx_bucket: String,
    pub influx_token: String,
    pub influx_timeout_secs: u64,
    pub influx_write_retries: u32,

    // kafka
    pub kafka_brokers: String,
    pub kafka_topic: String,

    // nats
    pub nats_urls: String,
    pub nats_subject: String,

    // fping
    pub fping_path: String,
    pub fping_packet_count: u32,
    pub max_ping_procs: usize,
}

impl AgentConfig {
    pub fn load() -> Self {
        Self {
            listen_addr: get_env("LISTEN_ADDR", "0.0.0.0:8080"),
            agent_id: parse_env("AGENT_ID", 0),
            max_snmp_requests: parse_env("MAX_SNMP_REQUESTS", 1),
            inter_poll_delay_ms: parse_env("INTER_POLL_DELAY_MS", 100),
            stats_freq_secs: parse_env("STATS_FREQ_SECS", 0),
            mock_snmp: get_env("MOCK_SNMP", "") == "1",
            prom_max_age_secs: parse_env("PROM_MAX_AGE_SECS", 0),
            prom_sweep_freq_secs: parse_env("PROM_SWEEP_FREQ_SECS", 120),
            influx_url: get_env("INFLUX_URL", ""),
            influx_org: get_env("INFLUX_ORG", ""),
            influx_bucket: get_env("INFLUX_BUCKET", ""),
            influx_token: get_env("INFLUX_TOKEN", ""),
            influx_timeout_secs: parse_env("INFLUX_TIMEOUT_SECS", 5),
            influx_write_retries: parse_env("INFLUX_WRITE_RETRIES", 2),
            kafka_brokers: get_env("KAFKA_BROKERS", ""),
            kafka_topic: get_env("KAFKA_TOPIC", ""),
            nats_urls: get_env("NATS_URLS", ""),
            nats_subject: get_env("NATS_SUBJECT", ""),
            fping_path: get_env("FPING_PATH", "/usr/bin/fping"),
            fping_packet_count: parse_env("FPING_PACKET_COUNT", 15),
            max_ping_procs: parse_env("MAX_PING_PROCS", 5),
        }
    }

    /// An agent with no sink at all would poll into the void.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.prom_max_age_secs == 0 && self.influx_url.is_empty() && self.kafka_brokers.is_empty() {
            anyhow::bail!("either PROM_MAX_AGE_SECS or INFLUX_URL or KAFKA_BROKERS must be set");
        }
        if self.max_ping_procs > 0 && self.fping_packet_count == 0 {
            anyhow::bail!("FPING_PACKET_COUNT cannot be zero");
        }
        Ok(())
    }
}

fn get_env(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_validate_requires_a_sink() {
        let mut cfg = AgentConfig::load();
        cfg.prom_max_age_secs = 0;
        cfg.influx_url = String::new();
        cfg.kafka_brokers = String::new();
        assert!(cfg.validate().is_err());
        cfg.prom_max_age_secs = 300;
        cfg.fping_packet_count = 15;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_report_url_uses_local_ip() {
        let mut cfg = DispatcherConfig::load();
        cfg.listen_addr = "0.0.0.0:9090".into();
        cfg.local_ip = "10.0.0.5".into();
        assert_eq!(cfg.report_url(), "http://10.0.0.5:9090/r/report");
    }
}
