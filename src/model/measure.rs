use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use super::metric::{names, Metric};

/// A group of scalar metrics polled together (sysInfo, sysUsage, ...).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScalarMeasure {
    #[serde(default)]
    pub id: i64,

    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub metrics: Vec<Metric>,

    /// Poll all metrics of this measure with the device's alternate community.
    #[serde(default)]
    pub use_alternate_community: bool,

    /// Per-measure polling frequency in seconds; 0 follows the device default.
    #[serde(default)]
    pub polling_frequency: i64,

    #[serde(default)]
    pub to_kafka: bool,

    #[serde(default)]
    pub to_prometheus: bool,

    #[serde(default)]
    pub to_influx: bool,
}

impl ScalarMeasure {
    /// Drops inactive metrics and compiles the remaining ones.
    pub fn prepare(&mut self) -> anyhow::Result<()> {
        self.metrics.retain(|m| m.active);
        for m in &mut self.metrics {
            m.compile()?;
        }
        tracing::trace!(measure = %self.name, metrics = ?names(&self.metrics), "scalar measure prepared");
        Ok(())
    }
}

/// A group of tabular metrics correlated row-by-row via a designated
/// index metric, optionally filtered by a regex on a filter metric.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexedMeasure {
    #[serde(default)]
    pub id: i64,

    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub metrics: Vec<Metric>,

    /// Id of the metric whose walk results provide the row indices.
    pub index_metric_id: i64,

    /// Position of the index metric in `metrics`, resolved by `prepare`.
    #[serde(skip, default = "default_pos")]
    pub index_pos: i64,

    /// Regex applied to the filter metric's value to prune rows.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filter_pattern: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_metric_id: Option<i64>,

    /// Position of the filter metric in `metrics`, resolved by `prepare`.
    #[serde(skip, default = "default_pos")]
    pub filter_pos: i64,

    #[serde(default)]
    pub invert_filter_match: bool,

    #[serde(skip)]
    pub filter_regex: Option<Regex>,

    #[serde(default)]
    pub use_alternate_community: bool,

    /// Export rows made only of label metrics as a single value-1 sample.
    #[serde(default)]
    pub labels_only: bool,

    #[serde(default)]
    pub polling_frequency: i64,

    #[serde(default)]
    pub to_kafka: bool,

    #[serde(default)]
    pub to_prometheus: bool,

    #[serde(default)]
    pub to_influx: bool,
}

fn default_pos() -> i64 {
    -1
}

impl IndexedMeasure {
    /// Drops inactive metrics, resolves index/filter positions and compiles
    /// patterns. The index metric must survive the inactive pruning.
    pub fn prepare(&mut self) -> anyhow::Result<()> {
        self.metrics.retain(|m| m.active);
        for m in &mut self.metrics {
            m.compile()?;
        }
        self.index_pos = self
            .metrics
            .iter()
            .position(|m| m.id == self.index_metric_id)
            .map(|p| p as i64)
            .unwrap_or(-1);
        if self.index_pos == -1 {
            anyhow::bail!(
                "indexed measure {}: index_metric_id {} not found in metric list",
                self.name,
                self.index_metric_id
            );
        }
        if !self.filter_pattern.is_empty() && self.filter_metric_id.is_none() {
            anyhow::bail!("indexed measure {}: filter_metric_id cannot be null when filter_pattern is defined", self.name);
        }
        if self.filter_pattern.is_empty() && self.filter_metric_id.is_some() {
            anyhow::bail!("indexed measure {}: filter_pattern cannot be empty when filter_metric_id is defined", self.name);
        }
        self.filter_pos = -1;
        if let Some(filter_id) = self.filter_metric_id {
            self.filter_pos = self
                .metrics
                .iter()
                .position(|m| m.id == filter_id)
                .map(|p| p as i64)
                .unwrap_or(-1);
            if self.filter_pos == -1 {
                anyhow::bail!("indexed measure {}: invalid filter_metric_id {}, not in metric list", self.name, filter_id);
            }
            self.filter_regex = Some(
                Regex::new(&self.filter_pattern).map_err(|e| anyhow::anyhow!("invalid filter regexp: {}", e))?,
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::oid::Oid;

    fn metric(id: i64, name: &str, oid: &str, active: bool) -> Metric {
        Metric {
            id,
            name: name.to_string(),
            oid: Oid::parse(oid).unwrap(),
            active,
            ..Default::default()
        }
    }

    #[test]
    fn test_prepare_resolves_index_pos() {
        let mut meas = IndexedMeasure {
            name: "ifStatus".into(),
            metrics: vec![
                metric(4, "ifDescr", ".1.3.6.1.2.1.2.2.1.2", true),
                metric(8, "ifIndex", ".1.3.6.1.2.1.2.2.1.1", true),
            ],
            index_metric_id: 8,
            ..Default::default()
        };
        meas.prepare().unwrap();
        assert_eq!(meas.index_pos, 1);
        assert_eq!(meas.filter_pos, -1);
    }

    #[test]
    fn test_prepare_recomputes_pos_after_inactive_pruning() {
        let mut meas = IndexedMeasure {
            name: "ifStatus".into(),
            metrics: vec![
                metric(4, "ifDescr", ".1.3.6.1.2.1.2.2.1.2", false),
                metric(8, "ifIndex", ".1.3.6.1.2.1.2.2.1.1", true),
            ],
            index_metric_id: 8,
            ..Default::default()
        };
        meas.prepare().unwrap();
        assert_eq!(meas.metrics.len(), 1);
        assert_eq!(meas.index_pos, 0);
    }

    #[test]
    fn test_prepare_rejects_missing_index_metric() {
        let mut meas = IndexedMeasure {
            name: "bad".into(),
            metrics: vec![metric(4, "ifDescr", ".1.3.6.1.2.1.2.2.1.2", true)],
            index_metric_id: 8,
            ..Default::default()
        };
        assert!(meas.prepare().is_err());
    }

    #[test]
    fn test_prepare_filter_consistency() {
        let mut meas = IndexedMeasure {
            name: "f".into(),
            metrics: vec![metric(1, "ifName", ".1.3.6.1.2.1.31.1.1.1.1", true)],
            index_metric_id: 1,
            filter_pattern: "^eth".into(),
            filter_metric_id: None,
            ..Default::default()
        };
        assert!(meas.prepare().is_err());

        meas.filter_metric_id = Some(1);
        meas.prepare().unwrap();
        assert_eq!(meas.filter_pos, 0);
        assert!(meas.filter_regex.is_some());
    }

    #[test]
    fn test_scalar_prepare_drops_inactive() {
        let mut meas = ScalarMeasure {
            name: "sysInfo".into(),
            metrics: vec![
                metric(1, "sysName", ".1.3.6.1.2.1.1.5.0", true),
                metric(2, "sysDescr", ".1.3.6.1.2.1.1.1.0", false),
            ],
            ..Default::default()
        };
        meas.prepare().unwrap();
        assert_eq!(meas.metrics.len(), 1);
        assert_eq!(meas.metrics[0].name, "sysName");
    }
}
