use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::model::{group_by_oid, IndexedMeasure, Metric, ScalarMeasure, SnmpRequest};

use super::result::{
    classify_error, err_is_unreachable, make_indexed, IndexedResults, MetricResult, PollResult,
    ScalarResults, TabularResults,
};
use super::snmp::{Pdu, PduValue, SnmpConn};

/// Walk results cached for the lifetime of one request, keyed by
/// `base_oid@community_flag`. Only single-metric, no-index-regex walks are
/// cached: those are the lookup oids shared between composite measures.
type WalkCache = Arc<Mutex<HashMap<String, TabularResults>>>;

/// Polls one device for one request: dials the device's connection count
/// in parallel, runs all scalar measures then all indexed measures, and
/// assembles the final result.
pub async fn poll(req: SnmpRequest, mock: bool) -> PollResult {
    let mut res = PollResult::from_request(&req);
    if mock {
        return mock_poll(req, res);
    }

    let conns = match dial_all(&req).await {
        Ok(conns) => conns,
        Err(e) => {
            tracing::error!("{} - unable to connect to snmp device: {}", req.uid, e);
            res.poll_error = format!("dial: {}", e);
            res.err_kind = classify_error(&res.poll_error);
            res.duration_ms = (Utc::now() - res.poll_start).num_milliseconds();
            return res;
        }
    };

    let cache: WalkCache = Arc::new(Mutex::new(HashMap::new()));
    let mut last_err: Option<anyhow::Error> = None;

    // scalar pass: an unreachable device stops the poll before any walk
    let (conns, unreachable) = get_all(&req, conns, &mut res, &mut last_err).await;
    if unreachable {
        res.poll_error = last_err.map(|e| e.to_string()).unwrap_or_default();
        res.err_kind = classify_error(&res.poll_error);
        res.is_partial = !res.scalar_measures.is_empty();
        res.duration_ms = (Utc::now() - res.poll_start).num_milliseconds();
        tracing::warn!("{} - poll: {}", req.uid, res.poll_error);
        return res;
    }

    walk_all(&req, conns, &cache, &mut res, &mut last_err).await;

    res.duration_ms = (Utc::now() - res.poll_start).num_milliseconds();
    if let Some(e) = last_err {
        res.poll_error = e.to_string();
        res.err_kind = classify_error(&res.poll_error);
        res.is_partial = !res.scalar_measures.is_empty() || !res.indexed_measures.is_empty();
        tracing::warn!("{} - poll: {}", req.uid, res.poll_error);
    }
    res
}

/// Dials all sessions in parallel. The request fails only when every dial
/// fails; partial connectivity polls with what succeeded.
async fn dial_all(req: &SnmpRequest) -> anyhow::Result<Vec<SnmpConn>> {
    let count = req.device.snmp.snmp_connection_count;
    let mut handles: Vec<JoinHandle<anyhow::Result<SnmpConn>>> = Vec::with_capacity(count);
    for i in 0..count {
        let params = req.device.snmp.clone();
        handles.push(tokio::task::spawn_blocking(move || SnmpConn::dial(&params, i)));
    }
    let mut conns = Vec::new();
    let mut last_err = None;
    for handle in handles {
        match handle.await {
            Ok(Ok(conn)) => conns.push(conn),
            Ok(Err(e)) => {
                tracing::warn!("{} - dial: {}", req.uid, e);
                last_err = Some(e);
            }
            Err(e) => last_err = Some(anyhow::anyhow!("dial task: {}", e)),
        }
    }
    if conns.is_empty() {
        return Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no snmp connection")));
    }
    Ok(conns)
}

enum GetOutcome {
    Ok(Metric, Vec<Pdu>),
    Err(Metric, anyhow::Error),
}

/// Runs all scalar measures sequentially. Returns the connections and
/// whether an unreachable error interrupted the pass.
async fn get_all(
    req: &SnmpRequest,
    mut conns: Vec<SnmpConn>,
    res: &mut PollResult,
    last_err: &mut Option<anyhow::Error>,
) -> (Vec<SnmpConn>, bool) {
    for meas in &req.scalar_measures {
        tracing::debug!("{} - polling scalar measure {}", req.uid, meas.name);
        let (returned, results, err) = get_measure(req, conns, meas).await;
        conns = returned;
        let unreachable = err.as_ref().map(|e| err_is_unreachable(&e.to_string())).unwrap_or(false);
        if let Some(e) = err {
            if unreachable {
                tracing::error!("{} - get {}: device unreachable ({}), stopping poll", req.uid, meas.name, e);
                *last_err = Some(e);
                return (conns, true);
            }
            tracing::warn!("{} - get {}: {}", req.uid, meas.name, e);
            *last_err = Some(e);
        }
        if !results.is_empty() {
            res.scalar_measures.push(ScalarResults {
                name: meas.name.clone(),
                results,
            });
        }
    }
    (conns, false)
}

/// Fetches one scalar measure using all connections simultaneously. Each
/// metric is a separate single-OID GET so one bad OID cannot poison a
/// batch; connections consume the metric stream round-robin.
async fn get_measure(
    req: &SnmpRequest,
    conns: Vec<SnmpConn>,
    meas: &ScalarMeasure,
) -> (Vec<SnmpConn>, Vec<MetricResult>, Option<anyhow::Error>) {
    let use_alt = meas.use_alternate_community && !req.device.snmp.snmp_alternate_community.is_empty();

    let (metric_tx, metric_rx) = mpsc::channel::<Metric>(meas.metrics.len().max(1));
    for metric in &meas.metrics {
        let _ = metric_tx.send(metric.clone()).await;
    }
    drop(metric_tx);
    let metric_rx = Arc::new(Mutex::new(metric_rx));

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<GetOutcome>();
    let mut handles: Vec<JoinHandle<Option<SnmpConn>>> = Vec::with_capacity(conns.len());
    for mut conn in conns {
        let rx = Arc::clone(&metric_rx);
        let tx = out_tx.clone();
        let uid = req.uid.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let metric = {
                    let mut rx = rx.lock().await;
                    rx.recv().await
                };
                let Some(metric) = metric else { break };
                tracing::debug!("{} - con#{}: getting scalar oid {} ({})", uid, conn.index, metric.oid, metric.name);
                let joined = tokio::task::spawn_blocking(move || {
                    let r = conn.get_one(&metric.oid, use_alt);
                    (conn, (metric, r))
                })
                .await;
                let (returned, outcome) = match joined {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::error!("{} - snmp get task: {}", uid, e);
                        return None;
                    }
                };
                conn = returned;
                let (metric, result) = outcome;
                let unreachable = result
                    .as_ref()
                    .err()
                    .map(|e| err_is_unreachable(&e.to_string()))
                    .unwrap_or(false);
                let _ = tx.send(match result {
                    Ok(pdus) => GetOutcome::Ok(metric, pdus),
                    Err(e) => GetOutcome::Err(metric, e),
                });
                if unreachable {
                    break;
                }
            }
            Some(conn)
        }));
    }
    drop(out_tx);

    let mut results = Vec::new();
    let mut snmp_err: Option<anyhow::Error> = None;
    let mut unreachable = false;
    while let Some(outcome) = out_rx.recv().await {
        match outcome {
            GetOutcome::Ok(metric, pdus) => {
                for pdu in &pdus {
                    match MetricResult::from_pdu(pdu, &metric) {
                        Ok(r) => results.push(r),
                        Err(e) => tracing::warn!("{} - get {}: make result: {}", req.uid, metric.name, e),
                    }
                }
            }
            GetOutcome::Err(metric, e) => {
                if err_is_unreachable(&e.to_string()) {
                    unreachable = true;
                }
                snmp_err = Some(anyhow::anyhow!("get {}: {}", metric.name, e));
                if unreachable {
                    break;
                }
            }
        }
    }

    let mut conns = Vec::with_capacity(handles.len());
    for handle in handles {
        if let Ok(Some(conn)) = handle.await {
            conns.push(conn);
        }
    }
    (conns, results, snmp_err)
}

struct WalkOutcome {
    group_pos: usize,
    tab: TabularResults,
    err: Option<anyhow::Error>,
}

/// Runs all indexed measures sequentially, each fanning its OID groups
/// out over the connections.
async fn walk_all(
    req: &SnmpRequest,
    mut conns: Vec<SnmpConn>,
    cache: &WalkCache,
    res: &mut PollResult,
    last_err: &mut Option<anyhow::Error>,
) {
    for meas in &req.indexed_measures {
        let (returned, indexed, err) = walk_measure(req, conns, cache, meas).await;
        conns = returned;
        if let Some(e) = err {
            tracing::error!("{} - walk {}: {}", req.uid, meas.name, e);
            *last_err = Some(e);
        }
        if indexed.results.is_empty() {
            tracing::debug!("{} - skipping indexed measure {} with no result", req.uid, meas.name);
            continue;
        }
        res.indexed_measures.push(indexed);
    }
}

/// Queries one indexed measure: walks each base-OID group on the next free
/// connection, then assembles and filters the indexed rows.
async fn walk_measure(
    req: &SnmpRequest,
    conns: Vec<SnmpConn>,
    cache: &WalkCache,
    meas: &IndexedMeasure,
) -> (Vec<SnmpConn>, IndexedResults, Option<anyhow::Error>) {
    if meas.metrics.is_empty() {
        tracing::error!("{} - walk indexed: measure {}: metric list empty", req.uid, meas.name);
        return (conns, IndexedResults::default(), None);
    }
    let use_alt = meas.use_alternate_community && !req.device.snmp.snmp_alternate_community.is_empty();
    let groups = group_by_oid(&meas.metrics);

    let (group_tx, group_rx) = mpsc::channel::<(usize, Vec<Metric>)>(groups.len().max(1));
    for (pos, group) in groups.iter().enumerate() {
        let _ = group_tx.send((pos, group.clone())).await;
    }
    drop(group_tx);
    let group_rx = Arc::new(Mutex::new(group_rx));

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WalkOutcome>();
    let mut handles: Vec<JoinHandle<Option<SnmpConn>>> = Vec::with_capacity(conns.len());
    for mut conn in conns {
        let rx = Arc::clone(&group_rx);
        let tx = out_tx.clone();
        let uid = req.uid.clone();
        let cache = Arc::clone(cache);
        handles.push(tokio::spawn(async move {
            loop {
                let next = {
                    let mut rx = rx.lock().await;
                    rx.recv().await
                };
                let Some((group_pos, group)) = next else { break };
                let start = std::time::Instant::now();
                tracing::debug!("{} - con#{}: start walking indexed oid {} [{}], {} metric(s)",
                    uid, conn.index, group[0].oid, group[0].name, group.len());
                let (returned, outcome) = match walk_group(conn, group, use_alt, &cache).await {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::error!("{} - snmp walk task: {}", uid, e);
                        return None;
                    }
                };
                conn = returned;
                tracing::debug!("{} - con#{}: done walking indexed oid: took {:?}", uid, conn.index, start.elapsed());
                let _ = tx.send(WalkOutcome {
                    group_pos,
                    tab: outcome.0,
                    err: outcome.1,
                });
            }
            Some(conn)
        }));
    }
    drop(out_tx);

    let mut by_group: Vec<Option<TabularResults>> = vec![None; groups.len()];
    let mut walk_err: Option<anyhow::Error> = None;
    while let Some(outcome) = out_rx.recv().await {
        if let Some(e) = outcome.err {
            walk_err = Some(anyhow::anyhow!("walk oid {}: {}", groups[outcome.group_pos][0].oid, e));
            continue;
        }
        by_group[outcome.group_pos] = Some(outcome.tab);
    }

    let mut conns = Vec::with_capacity(handles.len());
    for handle in handles {
        if let Ok(Some(conn)) = handle.await {
            conns.push(conn);
        }
    }

    // keep group order, skip empty groups, recompute the index position
    let mut tab_results: Vec<TabularResults> = Vec::new();
    let mut prepared = meas.clone();
    prepared.index_pos = -1;
    for (pos, tab) in by_group.into_iter().enumerate() {
        let Some(tab) = tab else { continue };
        if tab.is_empty() {
            tracing::debug!("{} - walk {}: skipping empty tabular result", req.uid, groups[pos][0].oid);
            continue;
        }
        if groups[pos].iter().any(|m| m.id == meas.index_metric_id) {
            prepared.index_pos = tab_results.len() as i64;
        }
        tab_results.push(tab);
    }

    let indexed = make_indexed(&req.uid, &prepared, &tab_results);
    tracing::debug!("{} - walk measure {}: full index results count: {}", req.uid, meas.name, indexed.results.len());
    let indexed = indexed.filter(&prepared);
    (conns, indexed, walk_err)
}

/// Walks one base-OID group on one connection and extracts every metric of
/// the group from the walked PDUs. Single-metric groups without an index
/// regex come from (and feed) the per-request cache.
async fn walk_group(
    conn: SnmpConn,
    group: Vec<Metric>,
    use_alt: bool,
    cache: &WalkCache,
) -> anyhow::Result<(SnmpConn, (TabularResults, Option<anyhow::Error>))> {
    let base = group[0].oid.clone();
    let cacheable = group.len() == 1 && group[0].index_regex.is_none();
    if cacheable {
        let cached = cache.lock().await.get(&base.cache_key(use_alt)).cloned();
        if let Some(tab) = cached {
            tracing::debug!("con#{}: returning cached res map for oid {}", conn.index, base);
            return Ok((conn, (tab, None)));
        }
    }

    let (conn, walked) = {
        let mut conn = conn;
        tokio::task::spawn_blocking(move || {
            let r = conn.walk(&base, use_alt);
            (conn, r)
        })
        .await
        .map_err(|e| anyhow::anyhow!("walk task join: {}", e))?
    };

    let pdus = match walked {
        Ok(pdus) => pdus,
        Err(e) => return Ok((conn, (TabularResults::new(), Some(e)))),
    };

    let mut tab = TabularResults::new();
    for pdu in &pdus {
        if matches!(pdu.value, PduValue::Null) {
            continue;
        }
        for metric in &group {
            if let Some(res) = extract_indexed(pdu, metric) {
                tab.entry(res.index.clone()).or_default().push(res);
            }
        }
    }

    if cacheable && !tab.is_empty() {
        let mut cache = cache.lock().await;
        cache.entry(group[0].oid.cache_key(use_alt)).or_insert_with(|| tab.clone());
    }
    Ok((conn, (tab, None)))
}

/// Converts one walked PDU for one metric of the group, deriving the row
/// index from the OID suffix or the metric's index regex. A non-matching
/// regex means the PDU belongs to another metric of the group.
fn extract_indexed(pdu: &Pdu, metric: &Metric) -> Option<MetricResult> {
    if !metric.oid.contains(&pdu.name) {
        tracing::warn!("walk {}: child oid {} smaller than base oid", metric.name, pdu.name);
        return None;
    }
    let mut idx = metric.oid.suffix_of(&pdu.name).to_string();
    if let Some(re) = &metric.index_regex {
        let caps = re.captures(&pdu.name)?;
        let mut parts = Vec::with_capacity(caps.len() - 1);
        for i in 1..caps.len() {
            if let Some(m) = caps.get(i) {
                parts.push(m.as_str());
            }
        }
        idx = parts.join(".");
    }
    match MetricResult::from_pdu(pdu, metric) {
        Ok(mut res) => {
            res.index = idx;
            Some(res)
        }
        Err(e) => {
            tracing::warn!("walk {}: make result: {}", metric.name, e);
            None
        }
    }
}

/// Mock poll used when the agent runs with `MOCK_SNMP=1`: fabricates one
/// value-1 result per requested metric without touching the network.
fn mock_poll(req: SnmpRequest, mut res: PollResult) -> PollResult {
    for meas in &req.scalar_measures {
        let results = meas
            .metrics
            .iter()
            .filter_map(|m| {
                MetricResult::from_pdu(
                    &Pdu {
                        name: format!("{}.0", m.oid),
                        value: PduValue::Uint(1),
                    },
                    m,
                )
                .ok()
            })
            .collect();
        res.scalar_measures.push(ScalarResults {
            name: meas.name.clone(),
            results,
        });
    }
    for meas in &req.indexed_measures {
        let row: Vec<MetricResult> = meas
            .metrics
            .iter()
            .filter_map(|m| {
                let mut r = MetricResult::from_pdu(
                    &Pdu {
                        name: format!("{}.1", m.oid),
                        value: PduValue::Uint(1),
                    },
                    m,
                )
                .ok()?;
                r.index = "1".to_string();
                Some(r)
            })
            .collect();
        res.indexed_measures.push(IndexedResults {
            name: meas.name.clone(),
            results: vec![row],
            labels_only: meas.labels_only,
        });
    }
    res.duration_ms = (Utc::now() - res.poll_start).num_milliseconds();
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Oid;

    fn metric(id: i64, name: &str, oid: &str) -> Metric {
        Metric {
            id,
            name: name.to_string(),
            oid: Oid::parse(oid).unwrap(),
            active: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_extract_indexed_suffix() {
        let m = metric(1, "ifOperStatus", ".1.3.6.1.2.1.2.2.1.8");
        let pdu = Pdu {
            name: ".1.3.6.1.2.1.2.2.1.8.4.2".into(),
            value: PduValue::Int(1),
        };
        let res = extract_indexed(&pdu, &m).unwrap();
        assert_eq!(res.index, "4.2");
    }

    #[test]
    fn test_extract_indexed_regex() {
        let mut m = metric(1, "fdbPort", ".1.3.6.1.2.1.17.4.3.1.2");
        m.index_pattern = r"\.1\.3\.6\.1\.2\.1\.17\.4\.3\.1\.2\.(\d+)\.(\d+)\.\d+".to_string();
        m.compile().unwrap();
        let pdu = Pdu {
            name: ".1.3.6.1.2.1.17.4.3.1.2.17.32.5".into(),
            value: PduValue::Int(3),
        };
        let res = extract_indexed(&pdu, &m).unwrap();
        assert_eq!(res.index, "17.32");

        // non-matching pdu is skipped for this metric
        let pdu = Pdu {
            name: ".1.3.6.1.2.1.17.4.3.1.2.17".into(),
            value: PduValue::Int(3),
        };
        assert!(extract_indexed(&pdu, &m).is_none());
    }

    #[test]
    fn test_extract_indexed_rejects_foreign_oid() {
        let m = metric(1, "x", ".1.3.6.1.2.1.2.2.1.8");
        let pdu = Pdu {
            name: ".1.3.6.1.9.9".into(),
            value: PduValue::Int(1),
        };
        assert!(extract_indexed(&pdu, &m).is_none());
    }

    #[tokio::test]
    async fn test_mock_poll_counts() {
        let req: SnmpRequest = serde_json::from_str(
            r#"{
                "uid": "m@7",
                "device": {
                    "id": 7, "hostname": "h", "to_prometheus": true,
                    "ip_address": "127.0.0.1", "snmp_community": "public",
                    "category": "c", "vendor": "v", "model": "m"
                },
                "scalar_measures": [
                    {"name": "sys", "metrics": [
                        {"name": "sysName", "oid": ".1.3.6.1.2.1.1.5.0", "active": true},
                        {"name": "sysUpTime", "oid": ".1.3.6.1.2.1.1.3.0", "active": true}
                    ]}
                ],
                "indexed_measures": [
                    {"name": "ifs", "index_metric_id": 8, "metrics": [
                        {"id": 8, "name": "ifIndex", "oid": ".1.3.6.1.2.1.2.2.1.1", "active": true}
                    ]}
                ]
            }"#,
        )
        .map(|mut r: SnmpRequest| {
            r.prepare().unwrap();
            r
        })
        .unwrap();

        let res = poll(req, true).await;
        assert_eq!(res.count_metrics(), 3);
        assert!(res.poll_error.is_empty());
    }
}
