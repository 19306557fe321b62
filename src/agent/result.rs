use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{IndexedMeasure, Metric, SnmpRequest};

use super::snmp::Pdu;

/// A converted metric value. Conversion from wire types is centralised in
/// `MetricResult::from_pdu` so the accepted set stays pinned by tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultValue {
    Float(f64),
    Int(i64),
    Uint(u64),
    Bool(bool),
    Text(String),
    Null,
}

impl Default for ResultValue {
    fn default() -> Self {
        ResultValue::Null
    }
}

impl ResultValue {
    /// Numeric coercion used by the prometheus and influx sinks.
    /// Text and null values have no numeric form and are dropped there.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ResultValue::Float(v) => Some(*v),
            ResultValue::Int(v) => Some(*v as f64),
            ResultValue::Uint(v) => Some(*v as f64),
            ResultValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            ResultValue::Text(_) | ResultValue::Null => None,
        }
    }
}

impl fmt::Display for ResultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultValue::Float(v) => write!(f, "{}", v),
            ResultValue::Int(v) => write!(f, "{}", v),
            ResultValue::Uint(v) => write!(f, "{}", v),
            ResultValue::Bool(v) => write!(f, "{}", v),
            ResultValue::Text(v) => f.write_str(v),
            ResultValue::Null => Ok(()),
        }
    }
}

/// A single converted snmp result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricResult {
    pub oid: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    pub value: ResultValue,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub as_label: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub to_influx: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub to_kafka: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub to_prom: bool,

    /// Row index for results of indexed measures.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub index: String,

    /// Sub-OID of the reply past the metric's base OID.
    #[serde(skip)]
    pub suffix: String,

    /// ASN.1 type name as reported by the snmp library.
    #[serde(skip)]
    pub snmp_type: &'static str,
}

impl MetricResult {
    /// Converts a PDU to a typed result. Counter64 values are wrapped to
    /// 2^53 so they survive the IEEE-754 double round-trip; octet strings
    /// run the metric's post-processor chain (default `to-string`).
    pub fn from_pdu(pdu: &Pdu, metric: &Metric) -> anyhow::Result<Self> {
        use super::snmp::PduValue;

        let mut res = MetricResult {
            oid: metric.oid.as_str().to_string(),
            name: metric.name.clone(),
            description: metric.description.clone(),
            as_label: metric.export_as_label,
            to_influx: metric.to_influx,
            to_kafka: metric.to_kafka,
            to_prom: metric.to_prometheus,
            suffix: metric.oid.suffix_of(&pdu.name).to_string(),
            snmp_type: pdu.value.type_name(),
            ..Default::default()
        };
        res.value = match &pdu.value {
            PduValue::NoSuchObject | PduValue::NoSuchInstance | PduValue::EndOfMib => {
                anyhow::bail!("oid {}: NoSuchObject", pdu.name)
            }
            PduValue::Null => anyhow::bail!("oid {}: nil value", pdu.name),
            PduValue::OctetString(bytes) => {
                // no processor declared: default to to-string
                let mut value = ResultValue::Text(String::from_utf8_lossy(bytes).trim().to_string());
                for pp in &metric.post_processors {
                    value = match pp.as_str() {
                        "parse-hex-be" => {
                            let n = big_endian_uint(bytes).map_err(|e| anyhow::anyhow!("parse `{:?}`: {}", bytes, e))?;
                            ResultValue::Float(n as f64)
                        }
                        "parse-hex-le" => {
                            let n = little_endian_uint(bytes).map_err(|e| anyhow::anyhow!("parse `{:?}`: {}", bytes, e))?;
                            ResultValue::Float(n as f64)
                        }
                        "parse-int" => {
                            let text = String::from_utf8_lossy(bytes);
                            let text = text.trim();
                            let v: i64 = text
                                .parse()
                                .map_err(|e| anyhow::anyhow!("{}: invalid int value {}: {}", metric.name, text, e))?;
                            ResultValue::Float(v as f64)
                        }
                        "to-string" | "trim" => ResultValue::Text(String::from_utf8_lossy(bytes).trim().to_string()),
                        other => anyhow::bail!("{}: invalid post-processor {}", metric.name, other),
                    };
                }
                value
            }
            PduValue::Counter64(v) => ResultValue::Float((v % (1u64 << 53)) as f64),
            PduValue::OpaqueFloat(v) => ResultValue::Float(*v as f64),
            PduValue::OpaqueDouble(v) => ResultValue::Float(*v),
            PduValue::Int(v) => ResultValue::Int(*v),
            PduValue::Uint(v) => ResultValue::Uint(*v as u64),
            PduValue::Bool(v) => ResultValue::Bool(*v),
            PduValue::Oid(s) | PduValue::IpAddr(s) => ResultValue::Text(s.clone()),
        };
        Ok(res)
    }
}

/// Walk results of one OID group, keyed by the extracted row index.
pub type TabularResults = HashMap<String, Vec<MetricResult>>;

/// Results of one scalar measure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScalarResults {
    pub name: String,

    #[serde(rename = "metrics")]
    pub results: Vec<MetricResult>,
}

/// Results of one indexed measure: one inner vector per correlated row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexedResults {
    pub name: String,

    #[serde(rename = "metrics")]
    pub results: Vec<Vec<MetricResult>>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub labels_only: bool,
}

impl IndexedResults {
    /// Strips repeated `description` fields beyond the first occurrence per
    /// metric name, shrinking the payload pushed to kafka.
    pub fn dedup_desc(&mut self) {
        let mut seen: HashMap<String, bool> = HashMap::new();
        for row in &mut self.results {
            for res in row {
                if seen.contains_key(&res.name) {
                    res.description = String::new();
                } else {
                    seen.insert(res.name.clone(), true);
                }
            }
        }
    }

    /// Applies the measure's filter regex to each row, keeping rows whose
    /// filter-metric value matches (or doesn't, when inverted).
    pub fn filter(self, meas: &IndexedMeasure) -> IndexedResults {
        if meas.filter_pos < 0 {
            return self;
        }
        let Some(re) = &meas.filter_regex else {
            tracing::error!("filter (pos={}): nil regexp", meas.filter_pos);
            return self;
        };
        let filter_name = &meas.metrics[meas.filter_pos as usize].name;
        let mut filtered = Vec::new();
        for row in self.results {
            let value = row
                .iter()
                .find(|r| &r.name == filter_name)
                .map(|r| r.value.to_string())
                .unwrap_or_default();
            let matched = re.is_match(&value);
            if matched != meas.invert_filter_match {
                filtered.push(row);
            }
        }
        if filtered.is_empty() {
            tracing::warn!("filter: empty indexed result after filtering...");
        }
        IndexedResults {
            name: self.name,
            results: filtered,
            labels_only: self.labels_only,
        }
    }
}

/// Assembles the indexed rows of a measure out of its per-group walk
/// results. Rows are built by iterating the indices of the index metric's
/// group; composite indices are correlated by walking progressively shorter
/// prefixes (`i.s1.s2`, `i.s1`, `i`), so a metric keyed on `i` joins rows
/// keyed on `i.s1` and deeper. Rows with nothing but the index entry are
/// dropped unless the measure is labels-only.
pub fn make_indexed(uid: &str, meas: &IndexedMeasure, tab_results: &[TabularResults]) -> IndexedResults {
    let mut indexed = IndexedResults {
        name: meas.name.clone(),
        labels_only: meas.labels_only,
        ..Default::default()
    };
    if tab_results.is_empty() {
        tracing::error!("{} - make indexed: measure {}: result list empty...", uid, meas.name);
        return indexed;
    }
    if meas.index_pos < 0 || meas.index_pos as usize >= tab_results.len() {
        tracing::error!("{} - make indexed: measure {} index #{} out of walk results", uid, meas.name, meas.index_pos);
        return indexed;
    }
    let index_pos = meas.index_pos as usize;
    let mut indices: Vec<&String> = tab_results[index_pos].keys().collect();
    indices.sort();
    for index in indices {
        let mut row: Vec<MetricResult> = Vec::new();
        let mut prefix = index.as_str();
        loop {
            for tab in tab_results {
                if let Some(results) = tab.get(prefix) {
                    row.extend(results.iter().cloned());
                }
            }
            match prefix.rfind('.') {
                Some(pos) if pos > 0 => prefix = &prefix[..pos],
                _ => break,
            }
        }
        let keep = if meas.labels_only { !row.is_empty() } else { row.len() > 1 };
        if keep {
            indexed.results.push(row);
        }
    }
    indexed
}

/// Broad classification of a poll error, kept out of the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorKind {
    #[default]
    None,
    Timeout,
    Refused,
    Other,
}

/// The complete result set of one polling job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollResult {
    pub request_id: String,

    pub agent_id: i64,

    #[serde(rename = "device_ipaddr")]
    pub ip_addr: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scalar_measures: Vec<ScalarResults>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexed_measures: Vec<IndexedResults>,

    pub poll_start: DateTime<Utc>,

    /// Total polling duration in ms.
    #[serde(rename = "poll_duration")]
    pub duration_ms: i64,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub poll_error: String,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,

    /// True when an snmp timeout interrupted the poll mid-request but some
    /// measures already succeeded.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_partial: bool,

    #[serde(skip)]
    pub stamp: Option<DateTime<Utc>>,

    #[serde(skip)]
    pub report_url: String,

    #[serde(skip)]
    pub metric_count: usize,

    #[serde(skip)]
    pub err_kind: ErrorKind,
}

impl PollResult {
    /// Seeds a result from the request: identifiers, device tags, report URL.
    pub fn from_request(req: &SnmpRequest) -> Self {
        PollResult {
            request_id: req.uid.clone(),
            agent_id: req.agent_id,
            ip_addr: req.device.snmp.ip_address.clone(),
            poll_start: Utc::now(),
            tags: req.device.tag_map(),
            report_url: req.report_url.clone(),
            ..Default::default()
        }
    }

    /// Total number of converted results carried by this poll.
    pub fn count_metrics(&self) -> usize {
        let scalar: usize = self.scalar_measures.iter().map(|s| s.results.len()).sum();
        let indexed: usize = self
            .indexed_measures
            .iter()
            .map(|x| x.results.iter().map(|r| r.len()).sum::<usize>())
            .sum();
        scalar + indexed
    }

    /// Prunes the result to keep only metrics flagged for kafka export.
    /// Scalar groups left empty are removed entirely.
    pub fn prune_for_kafka(&mut self) {
        self.scalar_measures.retain_mut(|s| {
            s.results.retain(|r| r.to_kafka);
            !s.results.is_empty()
        });
        for indexed in &mut self.indexed_measures {
            for row in &mut indexed.results {
                row.retain(|r| r.to_kafka);
            }
        }
    }
}

/// Interprets a byte slice as a big-endian unsigned integer.
/// Only lengths 0, 2, 4 and 8 are defined.
pub fn big_endian_uint(b: &[u8]) -> anyhow::Result<u64> {
    Ok(match b.len() {
        8 => u64::from_be_bytes(b.try_into().unwrap()),
        4 => u32::from_be_bytes(b.try_into().unwrap()) as u64,
        2 => u16::from_be_bytes(b.try_into().unwrap()) as u64,
        0 => 0,
        n => anyhow::bail!("big_endian_uint: invalid slice size {}", n),
    })
}

/// Interprets a byte slice as a little-endian unsigned integer.
/// Only lengths 0, 2, 4 and 8 are defined.
pub fn little_endian_uint(b: &[u8]) -> anyhow::Result<u64> {
    Ok(match b.len() {
        8 => u64::from_le_bytes(b.try_into().unwrap()),
        4 => u32::from_le_bytes(b.try_into().unwrap()) as u64,
        2 => u16::from_le_bytes(b.try_into().unwrap()) as u64,
        0 => 0,
        n => anyhow::bail!("little_endian_uint: invalid slice size {}", n),
    })
}

/// Tells whether the error message denotes an snmp timeout.
pub fn err_is_timeout(msg: &str) -> bool {
    msg.contains("timeout") || msg.contains("timed out")
}

/// Tells whether the error message denotes a connection-refused failure.
pub fn err_is_refused(msg: &str) -> bool {
    msg.contains("connection refused") || msg.contains("refused")
}

/// Timeouts and connection-refused both mean the device is unreachable
/// and stop the current poll.
pub fn err_is_unreachable(msg: &str) -> bool {
    err_is_timeout(msg) || err_is_refused(msg)
}

/// Classifies an error message for the operational counters.
pub fn classify_error(msg: &str) -> ErrorKind {
    if msg.is_empty() {
        ErrorKind::None
    } else if err_is_timeout(msg) {
        ErrorKind::Timeout
    } else if err_is_refused(msg) {
        ErrorKind::Refused
    } else {
        ErrorKind::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::snmp::PduValue;
    use crate::model::Oid;

    fn metric(name: &str, oid: &str) -> Metric {
        Metric {
            name: name.to_string(),
            oid: Oid::parse(oid).unwrap(),
            active: true,
            ..Default::default()
        }
    }

    fn pdu(name: &str, value: PduValue) -> Pdu {
        Pdu {
            name: name.to_string(),
            value,
        }
    }

    #[test]
    fn test_endian_helpers_defined_sizes() {
        assert_eq!(big_endian_uint(&[]).unwrap(), 0);
        assert_eq!(big_endian_uint(&[0x01, 0x02]).unwrap(), 0x0102);
        assert_eq!(big_endian_uint(&[0, 0, 0x01, 0x02]).unwrap(), 0x0102);
        assert_eq!(big_endian_uint(&[0, 0, 0, 0, 0, 0, 0x01, 0x02]).unwrap(), 0x0102);
        assert_eq!(little_endian_uint(&[0x01, 0x02]).unwrap(), 0x0201);
        assert_eq!(little_endian_uint(&[0x01, 0x02, 0, 0]).unwrap(), 0x0201);
        assert!(big_endian_uint(&[1]).is_err());
        assert!(big_endian_uint(&[1, 2, 3]).is_err());
        assert!(little_endian_uint(&[1, 2, 3, 4, 5]).is_err());
    }

    #[test]
    fn test_counter64_wraps_to_2_pow_53() {
        let m = metric("ifHCInOctets", ".1.3.6.1.2.1.31.1.1.1.6");
        let res = MetricResult::from_pdu(&pdu(".1.3.6.1.2.1.31.1.1.1.6.1", PduValue::Counter64(9_007_199_254_740_993)), &m).unwrap();
        assert_eq!(res.value, ResultValue::Float(1.0));
    }

    #[test]
    fn test_octet_string_defaults_to_trimmed_text() {
        let m = metric("sysName", ".1.3.6.1.2.1.1.5.0");
        let res = MetricResult::from_pdu(&pdu(".1.3.6.1.2.1.1.5.0", PduValue::OctetString(b"  core-sw1 \n".to_vec())), &m).unwrap();
        assert_eq!(res.value, ResultValue::Text("core-sw1".into()));
    }

    #[test]
    fn test_post_processors() {
        let mut m = metric("power", ".1.3.6.1.4.1.9.9.1");
        m.post_processors = vec!["parse-hex-be".into()];
        let res = MetricResult::from_pdu(&pdu(".1.3.6.1.4.1.9.9.1.0", PduValue::OctetString(vec![0x01, 0x00])), &m).unwrap();
        assert_eq!(res.value, ResultValue::Float(256.0));

        m.post_processors = vec!["parse-hex-le".into()];
        let res = MetricResult::from_pdu(&pdu(".1.3.6.1.4.1.9.9.1.0", PduValue::OctetString(vec![0x01, 0x00])), &m).unwrap();
        assert_eq!(res.value, ResultValue::Float(1.0));

        m.post_processors = vec!["parse-int".into()];
        let res = MetricResult::from_pdu(&pdu(".1.3.6.1.4.1.9.9.1.0", PduValue::OctetString(b" 42 ".to_vec())), &m).unwrap();
        assert_eq!(res.value, ResultValue::Float(42.0));

        m.post_processors = vec!["parse-int".into()];
        assert!(MetricResult::from_pdu(&pdu(".1.3.6.1.4.1.9.9.1.0", PduValue::OctetString(b"x".to_vec())), &m).is_err());

        m.post_processors = vec!["parse-hex-be".into()];
        assert!(MetricResult::from_pdu(&pdu(".1.3.6.1.4.1.9.9.1.0", PduValue::OctetString(vec![1, 2, 3])), &m).is_err());
    }

    #[test]
    fn test_no_such_object_and_nil_are_errors() {
        let m = metric("sysName", ".1.3.6.1.2.1.1.5.0");
        assert!(MetricResult::from_pdu(&pdu(".1.3.6.1.2.1.1.5.0", PduValue::NoSuchObject), &m).is_err());
        assert!(MetricResult::from_pdu(&pdu(".1.3.6.1.2.1.1.5.0", PduValue::Null), &m).is_err());
    }

    #[test]
    fn test_suffix_extraction() {
        let m = metric("ifOperStatus", ".1.3.6.1.2.1.2.2.1.8");
        let res = MetricResult::from_pdu(&pdu(".1.3.6.1.2.1.2.2.1.8.42", PduValue::Int(1)), &m).unwrap();
        assert_eq!(res.suffix, "42");
        assert_eq!(res.value, ResultValue::Int(1));
    }

    #[test]
    fn test_value_coercion_set() {
        assert_eq!(ResultValue::Float(1.5).as_f64(), Some(1.5));
        assert_eq!(ResultValue::Int(-3).as_f64(), Some(-3.0));
        assert_eq!(ResultValue::Uint(7).as_f64(), Some(7.0));
        assert_eq!(ResultValue::Bool(true).as_f64(), Some(1.0));
        assert_eq!(ResultValue::Bool(false).as_f64(), Some(0.0));
        assert_eq!(ResultValue::Text("up".into()).as_f64(), None);
        assert_eq!(ResultValue::Null.as_f64(), None);
    }

    fn named_result(name: &str, idx: &str) -> MetricResult {
        MetricResult {
            name: name.to_string(),
            oid: ".1.2.3".into(),
            value: ResultValue::Int(1),
            index: idx.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_make_indexed_composite_assembly() {
        // walks: oid1 indexed on "3", oid2 on "3.1"/"3.2", oid3 on "3.1.7"
        let mut oid1 = TabularResults::new();
        oid1.insert("3".into(), vec![named_result("r1", "3")]);
        let mut oid2 = TabularResults::new();
        oid2.insert("3.1".into(), vec![named_result("r2", "3.1")]);
        oid2.insert("3.2".into(), vec![named_result("r2", "3.2")]);
        let mut oid3 = TabularResults::new();
        oid3.insert("3.1.7".into(), vec![named_result("r3", "3.1.7")]);

        let mut meas = IndexedMeasure {
            name: "composite".into(),
            index_metric_id: 1,
            ..Default::default()
        };
        meas.index_pos = 1; // index metric group is oid2

        let indexed = make_indexed("t@1", &meas, &[oid1.clone(), oid2.clone(), oid3.clone()]);
        // row for "3.1" correlates r2(3.1) with the shorter-prefix r1(3)
        let row31 = indexed
            .results
            .iter()
            .find(|row| row.iter().any(|r| r.index == "3.1"))
            .unwrap();
        let names: Vec<&str> = row31.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["r2", "r1"]);

        // with oid3 as index group, "3.1.7" picks up every prefix level
        meas.index_pos = 2;
        let indexed = make_indexed("t@1", &meas, &[oid1, oid2, oid3]);
        let row317 = &indexed.results[0];
        let names: Vec<&str> = row317.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["r3", "r2", "r1"]);
    }

    #[test]
    fn test_make_indexed_drops_single_entry_rows() {
        let mut only_index = TabularResults::new();
        only_index.insert("1".into(), vec![named_result("ifIndex", "1")]);
        let meas = IndexedMeasure {
            name: "bare".into(),
            index_metric_id: 1,
            ..Default::default()
        };
        let indexed = make_indexed("t@1", &meas, &[only_index.clone()]);
        assert!(indexed.results.is_empty());

        // labels-only measures keep those rows
        let meas = IndexedMeasure {
            name: "bare".into(),
            index_metric_id: 1,
            labels_only: true,
            ..Default::default()
        };
        let indexed = make_indexed("t@1", &meas, &[only_index]);
        assert_eq!(indexed.results.len(), 1);
        assert!(indexed.labels_only);
    }

    #[test]
    fn test_filter_rows() {
        let mut meas = IndexedMeasure {
            name: "ifs".into(),
            index_metric_id: 1,
            metrics: vec![
                Metric {
                    id: 1,
                    name: "ifName".into(),
                    oid: Oid::parse(".1.3.6.1.2.1.31.1.1.1.1").unwrap(),
                    active: true,
                    ..Default::default()
                },
            ],
            filter_pattern: "^eth".into(),
            filter_metric_id: Some(1),
            ..Default::default()
        };
        meas.prepare().unwrap();

        let mk_row = |name: &str| {
            vec![MetricResult {
                name: "ifName".into(),
                value: ResultValue::Text(name.into()),
                ..Default::default()
            }]
        };
        let indexed = IndexedResults {
            name: "ifs".into(),
            results: vec![mk_row("eth0"), mk_row("lo"), mk_row("eth1")],
            labels_only: false,
        };
        let kept = indexed.clone().filter(&meas);
        assert_eq!(kept.results.len(), 2);

        meas.invert_filter_match = true;
        let kept = indexed.filter(&meas);
        assert_eq!(kept.results.len(), 1);
    }

    #[test]
    fn test_dedup_desc() {
        let mk = |name: &str, desc: &str| MetricResult {
            name: name.into(),
            description: desc.into(),
            ..Default::default()
        };
        let mut indexed = IndexedResults {
            name: "x".into(),
            results: vec![
                vec![mk("a", "da"), mk("b", "db")],
                vec![mk("a", "da"), mk("b", "db")],
            ],
            labels_only: false,
        };
        indexed.dedup_desc();
        assert_eq!(indexed.results[0][0].description, "da");
        assert_eq!(indexed.results[1][0].description, "");
        assert_eq!(indexed.results[1][1].description, "");
    }

    #[test]
    fn test_prune_for_kafka() {
        let mut res = PollResult::default();
        res.scalar_measures = vec![ScalarResults {
            name: "sys".into(),
            results: vec![
                MetricResult {
                    name: "keep".into(),
                    to_kafka: true,
                    ..Default::default()
                },
                MetricResult {
                    name: "drop".into(),
                    ..Default::default()
                },
            ],
        }];
        res.indexed_measures = vec![IndexedResults {
            name: "ifs".into(),
            results: vec![vec![MetricResult {
                name: "drop".into(),
                ..Default::default()
            }]],
            labels_only: false,
        }];
        res.prune_for_kafka();
        assert_eq!(res.scalar_measures[0].results.len(), 1);
        assert_eq!(res.scalar_measures[0].results[0].name, "keep");
        assert!(res.indexed_measures[0].results[0].is_empty());
    }

    #[test]
    fn test_count_metrics() {
        let mut res = PollResult::default();
        res.scalar_measures = vec![ScalarResults {
            name: "s".into(),
            results: vec![MetricResult::default(), MetricResult::default()],
        }];
        res.indexed_measures = vec![IndexedResults {
            name: "x".into(),
            results: vec![vec![MetricResult::default()], vec![MetricResult::default(), MetricResult::default()]],
            labels_only: false,
        }];
        assert_eq!(res.count_metrics(), 5);
    }

    #[test]
    fn test_error_classification() {
        assert!(err_is_unreachable("request timeout (after 2 retries)"));
        assert!(err_is_unreachable("connect: connection refused"));
        assert!(!err_is_unreachable("NoSuchObject"));
        assert_eq!(classify_error(""), ErrorKind::None);
        assert_eq!(classify_error("request timeout"), ErrorKind::Timeout);
        assert_eq!(classify_error("connection refused"), ErrorKind::Refused);
        assert_eq!(classify_error("bad pdu"), ErrorKind::Other);
    }
}
