use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// SNMP protocol versions accepted in the inventory.
pub mod snmp_version {
    pub const V1: &str = "1";
    pub const V2C: &str = "2c";
    pub const V3: &str = "3";
}

/// SNMPv3 security levels.
pub mod sec_level {
    pub const NO_AUTH_NO_PRIV: &str = "NoAuthNoPriv";
    pub const AUTH_NO_PRIV: &str = "AuthNoPriv";
    pub const AUTH_PRIV: &str = "AuthPriv";
}

/// Connection parameters for polling a device over SNMP.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnmpParams {
    pub ip_address: String,

    #[serde(default)]
    pub snmp_port: u16,

    #[serde(default)]
    pub snmp_version: String,

    #[serde(default)]
    pub snmp_community: String,

    /// Alternate community used by measures flagged `use_alternate_community`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub snmp_alternate_community: String,

    /// Query timeout in seconds (default 10).
    #[serde(default)]
    pub snmp_timeout: u64,

    /// Retries on timeout (default 1).
    #[serde(default)]
    pub snmp_retries: u32,

    /// Disables getbulk walks (forced for v1).
    #[serde(default)]
    pub snmp_disable_bulk: bool,

    /// Number of parallel SNMP sessions opened to the device (default 1).
    #[serde(default)]
    pub snmp_connection_count: usize,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub snmpv3_security_level: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub snmpv3_auth_user: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub snmpv3_auth_proto: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub snmpv3_auth_passwd: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub snmpv3_privacy_proto: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub snmpv3_privacy_passwd: String,
}

impl SnmpParams {
    /// Applies defaults and validates the parameter set.
    pub fn normalize(&mut self) -> anyhow::Result<()> {
        if self.ip_address.is_empty() {
            anyhow::bail!("invalid snmp params: ip_address cannot be empty");
        }
        if self.snmp_port == 0 {
            self.snmp_port = 161;
        }
        if self.snmp_version.is_empty() {
            self.snmp_version = snmp_version::V2C.to_string();
        }
        match self.snmp_version.as_str() {
            snmp_version::V1 => self.snmp_disable_bulk = true,
            snmp_version::V2C => {}
            snmp_version::V3 => {}
            other => anyhow::bail!("invalid version {}: must be either `1`, or `2c`, or `3`", other),
        }
        if self.snmp_version != snmp_version::V3 && self.snmp_community.is_empty() {
            anyhow::bail!("invalid snmp params: community cannot be empty");
        }
        if self.snmp_timeout == 0 {
            self.snmp_timeout = 10;
        }
        if self.snmp_retries == 0 {
            self.snmp_retries = 1;
        }
        if self.snmp_connection_count == 0 {
            self.snmp_connection_count = 1;
        }
        if self.snmp_version == snmp_version::V3 {
            match self.snmpv3_security_level.as_str() {
                sec_level::NO_AUTH_NO_PRIV => {}
                sec_level::AUTH_NO_PRIV | sec_level::AUTH_PRIV => {
                    if self.snmpv3_auth_user.is_empty() {
                        anyhow::bail!("invalid snmp params: snmpv3_auth_user cannot be empty with this security level");
                    }
                }
                _ => anyhow::bail!("invalid snmp params: snmpv3_security_level must be either NoAuthNoPriv, AuthNoPriv or AuthPriv"),
            }
            if !matches!(self.snmpv3_auth_proto.as_str(), "" | "MD5" | "SHA") {
                anyhow::bail!("invalid snmp params: snmpv3_auth_proto must be either empty, MD5 or SHA");
            }
            if !matches!(self.snmpv3_privacy_proto.as_str(), "" | "DES" | "AES") {
                anyhow::bail!("invalid snmp params: snmpv3_privacy_proto must be either empty, DES or AES");
            }
        }
        Ok(())
    }
}

/// A device profile: unique (category, vendor, model) tuple with measures
/// attached through the store's profile_measures relation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default, skip_serializing)]
    pub profile_id: i64,

    #[serde(default)]
    pub category: String,

    #[serde(default)]
    pub vendor: String,

    #[serde(default)]
    pub model: String,
}

impl Profile {
    pub fn normalize(&mut self) -> anyhow::Result<()> {
        self.category = self.category.trim().to_string();
        self.vendor = self.vendor.trim().to_string();
        self.model = self.model.trim().to_string();
        if self.category.is_empty() || self.vendor.is_empty() || self.model.is_empty() {
            anyhow::bail!("invalid profile: category, vendor and model are required");
        }
        Ok(())
    }
}

/// A network device from the inventory, snapshotted into each request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,

    #[serde(default)]
    pub active: bool,

    pub hostname: String,

    #[serde(default)]
    pub polling_frequency: i64,

    #[serde(default)]
    pub ping_frequency: i64,

    /// Free-form JSON map added as influx tags / prometheus labels.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tags: String,

    #[serde(default)]
    pub to_influx: bool,

    #[serde(default)]
    pub to_kafka: bool,

    #[serde(default)]
    pub to_prometheus: bool,

    #[serde(flatten)]
    pub snmp: SnmpParams,

    #[serde(flatten)]
    pub profile: Profile,
}

impl Device {
    /// Validates the device snapshot and applies parameter defaults.
    /// A device exporting to no sink at all is rejected at ingress.
    pub fn normalize(&mut self) -> anyhow::Result<()> {
        if self.id == 0 {
            anyhow::bail!("invalid device: id cannot be empty");
        }
        if self.hostname.is_empty() {
            anyhow::bail!("invalid device: hostname cannot be empty");
        }
        if !self.to_prometheus && !self.to_influx && !self.to_kafka {
            anyhow::bail!("invalid device: either to_kafka or to_influx or to_prometheus must be set");
        }
        if self.tags.is_empty() {
            self.tags = "{}".to_string();
        }
        if serde_json::from_str::<HashMap<String, serde_json::Value>>(&self.tags).is_err() {
            anyhow::bail!("invalid device: tags must be a valid json map");
        }
        self.profile.normalize()?;
        self.snmp.normalize()?;
        Ok(())
    }

    /// Tag map for exported samples: id/host/profile triple plus the
    /// device's own JSON tags.
    pub fn tag_map(&self) -> HashMap<String, String> {
        let mut tags = HashMap::new();
        tags.insert("id".to_string(), self.id.to_string());
        tags.insert("host".to_string(), self.hostname.clone());
        tags.insert("vendor".to_string(), self.profile.vendor.clone());
        tags.insert("model".to_string(), self.profile.model.clone());
        tags.insert("category".to_string(), self.profile.category.clone());
        if !self.tags.is_empty() {
            match serde_json::from_str::<HashMap<String, serde_json::Value>>(&self.tags) {
                Ok(extra) => {
                    for (k, v) in extra {
                        let val = match v {
                            serde_json::Value::String(s) => s,
                            other => other.to_string(),
                        };
                        tags.insert(k, val);
                    }
                }
                Err(e) => tracing::error!("json tag unmarshal: {}", e),
            }
        }
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_device() -> Device {
        Device {
            id: 1500,
            hostname: "dsl1500.example.net".into(),
            polling_frequency: 300,
            to_kafka: true,
            snmp: SnmpParams {
                ip_address: "10.2.0.9".into(),
                snmp_community: "public".into(),
                ..Default::default()
            },
            profile: Profile {
                category: "dslam".into(),
                vendor: "acme".into(),
                model: "mx-5".into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_normalize_applies_defaults() {
        let mut d = valid_device();
        d.normalize().unwrap();
        assert_eq!(d.snmp.snmp_port, 161);
        assert_eq!(d.snmp.snmp_version, "2c");
        assert_eq!(d.snmp.snmp_timeout, 10);
        assert_eq!(d.snmp.snmp_retries, 1);
        assert_eq!(d.snmp.snmp_connection_count, 1);
        assert_eq!(d.tags, "{}");
    }

    #[test]
    fn test_normalize_rejects_no_sink() {
        let mut d = valid_device();
        d.to_kafka = false;
        assert!(d.normalize().is_err());
    }

    #[test]
    fn test_normalize_rejects_missing_hostname() {
        let mut d = valid_device();
        d.hostname = String::new();
        assert!(d.normalize().is_err());
    }

    #[test]
    fn test_normalize_forces_disable_bulk_for_v1() {
        let mut d = valid_device();
        d.snmp.snmp_version = "1".into();
        d.normalize().unwrap();
        assert!(d.snmp.snmp_disable_bulk);
    }

    #[test]
    fn test_normalize_v3_requires_user() {
        let mut d = valid_device();
        d.snmp.snmp_version = "3".into();
        d.snmp.snmpv3_security_level = "AuthNoPriv".into();
        assert!(d.normalize().is_err());

        d.snmp.snmpv3_auth_user = "monitor".into();
        d.snmp.snmpv3_auth_proto = "SHA".into();
        d.normalize().unwrap();
    }

    #[test]
    fn test_normalize_rejects_bad_tags() {
        let mut d = valid_device();
        d.tags = "[1,2]".into();
        assert!(d.normalize().is_err());
    }

    #[test]
    fn test_tag_map_merges_device_tags() {
        let mut d = valid_device();
        d.tags = r#"{"site":"par-3","rack":7}"#.into();
        d.normalize().unwrap();
        let tags = d.tag_map();
        assert_eq!(tags["id"], "1500");
        assert_eq!(tags["host"], "dsl1500.example.net");
        assert_eq!(tags["site"], "par-3");
        assert_eq!(tags["rack"], "7");
    }
}
