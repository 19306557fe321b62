use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::device::Device;
use super::measure::{IndexedMeasure, ScalarMeasure};

/// Agent endpoint for snmp poll requests.
pub const SNMP_JOB_URI: &str = "/r/poll";

/// Agent keep-alive endpoint.
pub const CHECK_URI: &str = "/r/check";

/// Agent endpoint for ping jobs.
pub const PING_JOB_URI: &str = "/r/ping";

/// Agent endpoint listing in-flight request UIDs.
pub const ONGOING_URI: &str = "/r/ongoing";

/// Dispatcher report callback endpoint.
pub const REPORT_URI: &str = "/r/report";

/// A serialized snmp polling job sent from the dispatcher to an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnmpRequest {
    /// Unique id, `<shortid>@<device_id>`.
    pub uid: String,

    #[serde(default)]
    pub agent_id: i64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scalar_measures: Vec<ScalarMeasure>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexed_measures: Vec<IndexedMeasure>,

    /// Callback URL where the completion report is posted.
    #[serde(default)]
    pub report_url: String,

    pub device: Device,
}

impl SnmpRequest {
    /// Validates the decoded request, applies device defaults, prunes
    /// inactive metrics and compiles all patterns. Must be called right
    /// after deserialisation, before the request is queued.
    pub fn prepare(&mut self) -> anyhow::Result<()> {
        if self.uid.is_empty() {
            anyhow::bail!("invalid request: request_id cannot be empty");
        }
        if self.device.id == 0 {
            anyhow::bail!("invalid request: missing device");
        }
        if !self.report_url.is_empty()
            && !self.report_url.starts_with("http://")
            && !self.report_url.starts_with("https://")
        {
            self.report_url = format!("http://{}", self.report_url);
        }
        self.device.normalize()?;
        for scalar in &mut self.scalar_measures {
            scalar.prepare()?;
        }
        for indexed in &mut self.indexed_measures {
            indexed.prepare()?;
        }
        Ok(())
    }
}

/// A host to ping, with its profile attributes for labelling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingHost {
    pub hostname: String,

    #[serde(default)]
    pub ip_address: String,

    #[serde(default, skip_serializing)]
    pub id: i64,

    #[serde(default)]
    pub category: String,

    #[serde(default)]
    pub vendor: String,

    #[serde(default)]
    pub model: String,
}

/// A batched ping job sent to an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingRequest {
    pub uid: String,

    pub hosts: Vec<PingHost>,

    #[serde(skip)]
    pub stamp: Option<DateTime<Utc>>,
}

impl PingRequest {
    /// Target ip addresses of this request.
    pub fn targets(&self) -> Vec<&str> {
        self.hosts.iter().map(|h| h.ip_address.as_str()).collect()
    }

    /// Device ids of the batched hosts.
    pub fn host_ids(&self) -> Vec<i64> {
        self.hosts.iter().map(|h| h.id).collect()
    }
}

/// Reply to the ongoing-polls inventory endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OngoingPolls {
    #[serde(default)]
    pub ongoing: Vec<String>,

    #[serde(default)]
    pub load: f64,
}

/// Short unique request id suffixed with the device id, so the device
/// can be recovered from the UID alone.
pub fn request_uid(device_id: i64) -> String {
    let sid = uuid::Uuid::new_v4().simple().to_string();
    format!("{}@{}", &sid[..10], device_id)
}

/// Device id encoded in a request UID, if any.
pub fn device_id_of(uid: &str) -> Option<i64> {
    uid.rsplit_once('@').and_then(|(_, id)| id.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQ: &str = r#"{
        "uid": "000@1500",
        "agent_id": 1,
        "report_url": "localhost:8080/r/report",
        "device": {
            "id": 1500,
            "hostname": "dsl1500.example.net",
            "polling_frequency": 300,
            "category": "dslam",
            "vendor": "acme",
            "model": "mx-5",
            "ip_address": "10.2.0.9",
            "snmp_timeout": 20,
            "snmp_version": "2c",
            "snmp_community": "secret9",
            "to_kafka": true
        },
        "scalar_measures": [
            {"name": "sysUsage", "polling_frequency": 300, "metrics": [
                {"name": "sysName", "oid": ".1.3.6.1.2.1.1.5.0", "active": true}
            ]}
        ],
        "indexed_measures": [
            {"name": "ifStatus", "index_metric_id": 8, "metrics": [
                {"id": 8, "name": "ifIndex", "oid": "1.3.6.1.2.1.2.2.1.1", "active": true, "export_as_label": true}
            ]}
        ]
    }"#;

    #[test]
    fn test_decode_and_prepare() {
        let mut req: SnmpRequest = serde_json::from_str(REQ).unwrap();
        req.prepare().unwrap();
        assert_eq!(req.uid, "000@1500");
        assert_eq!(req.report_url, "http://localhost:8080/r/report");
        assert_eq!(req.device.snmp.snmp_port, 161);
        assert_eq!(req.device.snmp.snmp_timeout, 20);
        assert_eq!(req.device.snmp.snmp_retries, 1);
        assert_eq!(req.device.snmp.snmp_connection_count, 1);
        assert_eq!(req.scalar_measures[0].metrics[0].name, "sysName");
        // ingested oid is normalised to leading-dot form
        assert_eq!(req.indexed_measures[0].metrics[0].oid.as_str(), ".1.3.6.1.2.1.2.2.1.1");
        assert_eq!(req.indexed_measures[0].index_pos, 0);
    }

    #[test]
    fn test_round_trip() {
        let mut req: SnmpRequest = serde_json::from_str(REQ).unwrap();
        req.prepare().unwrap();
        let encoded = serde_json::to_string(&req).unwrap();
        let mut again: SnmpRequest = serde_json::from_str(&encoded).unwrap();
        again.prepare().unwrap();
        assert_eq!(serde_json::to_value(&req).unwrap(), serde_json::to_value(&again).unwrap());
    }

    #[test]
    fn test_prepare_rejects_empty_uid_or_device() {
        let mut req = SnmpRequest::default();
        assert!(req.prepare().is_err());
        req.uid = "x@1".into();
        assert!(req.prepare().is_err());
    }

    #[test]
    fn test_request_uid_suffix() {
        let uid = request_uid(42);
        assert!(uid.ends_with("@42"));
        assert_eq!(device_id_of(&uid), Some(42));
        assert_eq!(device_id_of("nodevice"), None);
    }
}
