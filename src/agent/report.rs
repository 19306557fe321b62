use std::time::Duration;

use super::result::PollResult;

/// Posts the completion report to the dispatcher's callback URL.
/// Up to 3 attempts with 3/6/12s backoff; after that the periodic
/// unlocker on the dispatcher reconciles the device lock.
pub async fn send(res: &PollResult, current_load: f64) {
    tracing::debug!(
        "report: id={} agent_id={} poll_err={:?} poll_dur={}ms metric_count={}",
        res.request_id,
        res.agent_id,
        res.poll_error,
        res.duration_ms,
        res.metric_count
    );
    if res.report_url.is_empty() {
        tracing::warn!("no report url for req {}", res.request_id);
        return;
    }
    let client = match reqwest::Client::builder().timeout(Duration::from_secs(3)).build() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("send report: build client: {}", e);
            return;
        }
    };
    let params = [
        ("request_id", res.request_id.clone()),
        ("agent_id", res.agent_id.to_string()),
        ("poll_duration_ms", res.duration_ms.to_string()),
        ("poll_error", res.poll_error.clone()),
        ("metric_count", res.metric_count.to_string()),
        ("current_load", format!("{:.4}", current_load)),
    ];
    for attempt in 0..3u32 {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_secs(3 * (1 << (attempt - 1)))).await;
        }
        tracing::debug!("{} - posting report, try #{}/3", res.request_id, attempt + 1);
        match client.get(&res.report_url).query(&params).send().await {
            Ok(resp) => {
                tracing::debug!("{} - report posted at try #{}/3, status: {}", res.request_id, attempt + 1, resp.status());
                return;
            }
            Err(e) => {
                tracing::error!("send report, try #{}/3: {}", attempt + 1, e);
            }
        }
    }
}
