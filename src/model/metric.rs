use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use super::oid::Oid;

/// A single OID to poll, with its export flags and post-processing chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metric {
    #[serde(default)]
    pub id: i64,

    pub name: String,

    pub oid: Oid,

    #[serde(default)]
    pub description: String,

    /// Inactive metrics are dropped at request decode.
    #[serde(default)]
    pub active: bool,

    /// Exported as a prometheus label instead of a value.
    #[serde(default)]
    pub export_as_label: bool,

    #[serde(default)]
    pub to_kafka: bool,

    #[serde(default)]
    pub to_prometheus: bool,

    #[serde(default)]
    pub to_influx: bool,

    /// Only poll this metric on operational interfaces (schema flag,
    /// carried through for tagging purposes).
    #[serde(default)]
    pub running_if_only: bool,

    /// Per-metric polling frequency in seconds; 0 follows the device default.
    #[serde(default)]
    pub polling_frequency: i64,

    /// Ordered post-processors applied to octet-string values:
    /// `parse-hex-be`, `parse-hex-le`, `parse-int`, `to-string`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_processors: Vec<String>,

    /// Regex with capture groups used to extract a composite index from
    /// walked OIDs. Must start with the metric OID.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub index_pattern: String,

    #[serde(skip)]
    pub index_regex: Option<Regex>,
}

impl Metric {
    /// Validate the metric and compile its index pattern. Called after
    /// deserialisation, request-build time.
    pub fn compile(&mut self) -> anyhow::Result<()> {
        if !self.index_pattern.is_empty() {
            let escaped_oid = self.oid.as_str().replace('.', r"\.");
            // normalise unescaped dots so a pattern can be written either way
            let escaped = self.index_pattern.replace('.', r"\.").replace(r"\\.", r"\.");
            self.index_pattern = escaped;
            if !self.index_pattern.starts_with(&escaped_oid) {
                anyhow::bail!("index_pattern `{}` must start with oid `{}`", self.index_pattern, self.oid);
            }
            let re = Regex::new(&self.index_pattern)
                .map_err(|e| anyhow::anyhow!("invalid index pattern: {}", e))?;
            if re.captures_len() < 2 {
                anyhow::bail!("index_pattern `{}` must contain at least one capture group for the index", self.index_pattern);
            }
            self.index_regex = Some(re);
        }
        for pp in &self.post_processors {
            match pp.as_str() {
                "parse-hex-be" | "parse-hex-le" | "parse-int" | "to-string" | "trim" => {}
                other => anyhow::bail!("{}: invalid post-processor `{}`", self.name, other),
            }
        }
        Ok(())
    }
}

/// Names of the given metrics, for logging.
pub fn names(metrics: &[Metric]) -> Vec<&str> {
    metrics.iter().map(|m| m.name.as_str()).collect()
}

/// Groups metrics sharing the same base OID, preserving first-seen order.
/// Metrics with the same OID but different index patterns are walked once
/// and extracted together.
pub fn group_by_oid(metrics: &[Metric]) -> Vec<Vec<Metric>> {
    let mut res: Vec<Vec<Metric>> = Vec::new();
    for m in metrics {
        match res.iter_mut().find(|g| g[0].oid == m.oid) {
            Some(group) => group.push(m.clone()),
            None => res.push(vec![m.clone()]),
        }
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(name: &str, oid: &str) -> Metric {
        Metric {
            name: name.to_string(),
            oid: Oid::parse(oid).unwrap(),
            active: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_compile_index_pattern() {
        let mut m = metric("dot1dTpFdbPort", ".1.3.6.1.2.1.17.4.3.1.2");
        m.index_pattern = r"\.1\.3\.6\.1\.2\.1\.17\.4\.3\.1\.2\.(\d+)\.(\d+)".to_string();
        m.compile().unwrap();
        assert!(m.index_regex.is_some());
    }

    #[test]
    fn test_compile_rejects_foreign_prefix() {
        let mut m = metric("m", ".1.3.6.1.2.1.2.2.1.8");
        m.index_pattern = r"\.1\.3\.9\.(\d+)".to_string();
        assert!(m.compile().is_err());
    }

    #[test]
    fn test_compile_requires_capture_group() {
        let mut m = metric("m", ".1.3.6.1.2.1.2.2.1.8");
        m.index_pattern = r"\.1\.3\.6\.1\.2\.1\.2\.2\.1\.8\.\d+".to_string();
        assert!(m.compile().is_err());
    }

    #[test]
    fn test_compile_rejects_unknown_processor() {
        let mut m = metric("m", ".1.3.6.1.2.1.1.5.0");
        m.post_processors = vec!["parse-hex-be".into(), "reverse".into()];
        assert!(m.compile().is_err());
    }

    #[test]
    fn test_group_by_oid_keeps_order() {
        let a = metric("a", ".1.3.6.1.2.1.2.2.1.2");
        let b = metric("b", ".1.3.6.1.2.1.2.2.1.8");
        let mut a2 = metric("a2", ".1.3.6.1.2.1.2.2.1.2");
        a2.index_pattern = String::new();
        let groups = group_by_oid(&[a.clone(), b.clone(), a2.clone()]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 2);
        assert_eq!(groups[0][0].name, "a");
        assert_eq!(groups[0][1].name, "a2");
        assert_eq!(groups[1][0].name, "b");
    }
}
