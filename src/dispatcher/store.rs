use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::model::{
    request_uid, Device, IndexedMeasure, Metric, Oid, PingHost, Profile, ScalarMeasure, SnmpParams,
    SnmpRequest,
};

/// An agent row from the store.
#[derive(Debug, Clone)]
pub struct AgentRow {
    pub id: i64,
    pub host: String,
    pub port: u16,
    pub is_alive: bool,
}

/// Store handles all dispatcher database operations.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;
        Ok(Store { pool })
    }

    /// Takes the Postgres advisory lock enforcing the single-leader
    /// guarantee, on a connection dedicated to it. A pinger exercises the
    /// connection every 10s and exits the process when it is lost, so the
    /// supervisor can restart us into a clean election.
    pub async fn acquire_leader_lock(&self, lock_id: i64) -> Result<()> {
        let mut conn = self.pool.acquire().await.context("db conn")?;
        tracing::info!("querying advisory lock from pg...");
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(lock_id)
            .execute(&mut *conn)
            .await
            .context("select pg_advisory_lock")?;
        tracing::info!("lock granted, running as master!");
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(10));
            tick.tick().await;
            loop {
                tick.tick().await;
                if let Err(e) = sqlx::query("SELECT 1").execute(&mut *conn).await {
                    tracing::error!("db lock conn ping: {}", e);
                    std::process::exit(1);
                }
            }
        });
        Ok(())
    }

    // ========== Device locks ==========

    pub async fn lock_device(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE devices SET is_polling = true WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn unlock_device(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE devices SET is_polling = false WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Safety-net sweep clearing every device whose last poll predates a
    /// long timeout, whatever its lock state claims.
    pub async fn unlock_devices_older_than(&self, secs: u64) -> Result<u64> {
        let rs = sqlx::query(
            r#"UPDATE devices
                  SET is_polling = false
                WHERE last_polled_at < NOW() - ($1::TEXT || ' seconds')::INTERVAL
                  AND is_polling = true"#,
        )
        .bind(secs as i64)
        .execute(&self.pool)
        .await?;
        Ok(rs.rows_affected())
    }

    /// Unlocks the device attached to a request UID via its report row.
    pub async fn unlock_device_from_report(&self, uid: &str) -> Result<()> {
        sqlx::query(
            r#"UPDATE devices
                  SET is_polling = false
                WHERE id = (SELECT device_id FROM reports WHERE uuid = $1)"#,
        )
        .bind(uid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Bulk unlock of every device with an unanswered report on the given
    /// agent within the recovery window.
    pub async fn unlock_devices_from_agent(&self, agent_id: i64) -> Result<()> {
        sqlx::query(
            r#"UPDATE devices
                  SET is_polling = false
                WHERE id IN (SELECT device_id
                               FROM reports
                              WHERE agent_id = $1
                                AND report_received_at IS NULL
                                AND requested_at >= NOW() - INTERVAL '15 minutes')"#,
        )
        .bind(agent_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Unlocks stale devices whose UID is not part of any agent's ongoing
    /// inventory.
    pub async fn unlock_devices_not_ongoing(&self, ongoing_uids: &[String]) -> Result<u64> {
        let rs = sqlx::query(
            r#"UPDATE devices
                  SET is_polling = false
                WHERE is_polling = true
                  AND last_polled_at < NOW() - (polling_frequency::TEXT || ' seconds')::INTERVAL
                  AND id NOT IN (SELECT device_id FROM reports WHERE uuid = ANY($1))"#,
        )
        .bind(ongoing_uids)
        .execute(&self.pool)
        .await?;
        Ok(rs.rows_affected())
    }

    // ========== Poll bookkeeping ==========

    pub async fn set_device_last_polled(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE devices SET last_polled_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_devices_last_pinged(&self, ids: &[i64]) -> Result<()> {
        sqlx::query("UPDATE devices SET last_pinged_at = NOW() WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn upsert_metric_poll_time(&self, device_id: i64, metric_id: i64) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO metric_poll_times (device_id, metric_id, last_polled_at)
                    VALUES ($1, $2, NOW())
               ON CONFLICT (device_id, metric_id)
             DO UPDATE SET last_polled_at = NOW()"#,
        )
        .bind(device_id)
        .bind(metric_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ========== Reports ==========

    pub async fn insert_report(&self, uid: &str, device_id: i64, agent_id: i64, status: &str) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO reports (uuid, device_id, agent_id, post_status, requested_at)
                    VALUES ($1, $2, $3, $4, NOW())"#,
        )
        .bind(uid)
        .bind(device_id)
        .bind(agent_id)
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Marks the report received with its duration and error text.
    /// Only error reports are kept; successes are deleted instead.
    pub async fn update_report(&self, uid: &str, duration_ms: i64, error: &str) -> Result<()> {
        sqlx::query(
            r#"UPDATE reports
                  SET report_received_at = NOW(),
                      poll_duration_ms = $2,
                      poll_error = $3
                WHERE uuid = $1"#,
        )
        .bind(uid)
        .bind(duration_ms)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_report(&self, uid: &str) -> Result<u64> {
        let rs = sqlx::query("DELETE FROM reports WHERE uuid = $1")
            .bind(uid)
            .execute(&self.pool)
            .await?;
        Ok(rs.rows_affected())
    }

    /// Trims error rows past the retention and never-received orphans
    /// past the (shorter) flush window.
    pub async fn flush_reports(&self, error_retention_hours: u64, orphan_hours: u64) -> Result<(u64, u64)> {
        let errors = sqlx::query(
            r#"DELETE FROM reports
                WHERE report_received_at IS NOT NULL
                  AND requested_at <= NOW() - ($1::TEXT || ' hours')::INTERVAL"#,
        )
        .bind(error_retention_hours as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();
        let orphans = sqlx::query(
            r#"DELETE FROM reports
                WHERE report_received_at IS NULL
                  AND requested_at <= NOW() - ($1::TEXT || ' hours')::INTERVAL"#,
        )
        .bind(orphan_hours as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok((errors, orphans))
    }

    /// Device id attached to a report UID.
    pub async fn report_device_id(&self, uid: &str) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT device_id FROM reports WHERE uuid = $1")
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("device_id")))
    }

    // ========== Agents ==========

    pub async fn active_agents(&self) -> Result<Vec<AgentRow>> {
        let rows = sqlx::query(
            r#"SELECT id, ip_address, port, is_alive
                 FROM agents
                WHERE active = true
             ORDER BY load"#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| AgentRow {
                id: r.get::<i64, _>("id"),
                host: r.get::<String, _>("ip_address"),
                port: r.get::<i32, _>("port") as u16,
                is_alive: r.get::<bool, _>("is_alive"),
            })
            .collect())
    }

    pub async fn update_agent_check(&self, id: i64, is_alive: bool, load_avg: f64) -> Result<()> {
        sqlx::query(
            r#"UPDATE agents
                  SET last_checked_at = NOW(), is_alive = $2, load = $3
                WHERE id = $1"#,
        )
        .bind(id)
        .bind(is_alive)
        .bind(load_avg)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ========== Job selection ==========

    /// Pollable device ids: active, unlocked, past their polling interval.
    pub async fn snmp_jobs(&self) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            r#"SELECT id
                 FROM devices
                WHERE active = true
                  AND polling_frequency > 0
                  AND is_polling = false
                  AND (last_polled_at IS NULL
                       OR EXTRACT(EPOCH FROM CURRENT_TIMESTAMP - last_polled_at) >= polling_frequency)
             ORDER BY last_polled_at NULLS FIRST, id"#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get::<i64, _>("id")).collect())
    }

    /// Hosts to ping: active, past their ping interval.
    pub async fn ping_hosts(&self) -> Result<Vec<PingHost>> {
        let rows = sqlx::query(
            r#"SELECT d.id, d.hostname,
                      COALESCE(d.ip_address, '') AS ip_address,
                      p.category, p.vendor, p.model
                 FROM devices d, profiles p
                WHERE d.active = true
                  AND d.ping_frequency > 0
                  AND (d.last_pinged_at IS NULL
                       OR EXTRACT(EPOCH FROM CURRENT_TIMESTAMP - d.last_pinged_at) >= d.ping_frequency)
                  AND d.profile_id = p.id
             ORDER BY d.last_pinged_at NULLS FIRST"#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| PingHost {
                id: r.get::<i64, _>("id"),
                hostname: r.get::<String, _>("hostname"),
                ip_address: r.get::<String, _>("ip_address"),
                category: r.get::<String, _>("category"),
                vendor: r.get::<String, _>("vendor"),
                model: r.get::<String, _>("model"),
            })
            .collect())
    }

    // ========== Request materialisation ==========

    /// Builds the full polling request for a device: the device snapshot,
    /// its profile's measures and their due metrics. Metrics with their
    /// own polling frequency are pruned server-side when not yet due.
    pub async fn build_request(&self, device_id: i64, report_url: &str) -> Result<SnmpRequest> {
        let device = self.device_snapshot(device_id).await?;
        let mut req = SnmpRequest {
            uid: request_uid(device_id),
            device,
            report_url: report_url.to_string(),
            ..Default::default()
        };

        let scalar_rows = sqlx::query(
            r#"SELECT m.id, m.name, m.description, m.polling_frequency,
                      m.use_alternate_community, m.to_influx, m.to_kafka, m.to_prometheus
                 FROM measures m, devices d, profile_measures pm
                WHERE m.is_indexed = false
                  AND d.profile_id = pm.profile_id
                  AND m.id = pm.measure_id
                  AND m.polling_frequency >= 0
                  AND d.id = $1
             ORDER BY m.id"#,
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await
        .context("select scalar measures")?;
        for row in &scalar_rows {
            let mut meas = ScalarMeasure {
                id: row.get("id"),
                name: row.get("name"),
                description: row.get::<Option<String>, _>("description").unwrap_or_default(),
                polling_frequency: row.get::<Option<i64>, _>("polling_frequency").unwrap_or(0),
                use_alternate_community: row.get("use_alternate_community"),
                to_influx: row.get("to_influx"),
                to_kafka: row.get("to_kafka"),
                to_prometheus: row.get("to_prometheus"),
                ..Default::default()
            };
            meas.metrics = self.due_metrics(device_id, meas.id).await?;
            req.scalar_measures.push(meas);
        }

        let indexed_rows = sqlx::query(
            r#"SELECT m.id, m.name, m.description, m.polling_frequency, m.index_metric_id,
                      m.filter_metric_id, m.filter_pattern, m.invert_filter_match,
                      m.use_alternate_community, m.labels_only,
                      m.to_influx, m.to_kafka, m.to_prometheus
                 FROM measures m, devices d, profile_measures pm
                WHERE m.is_indexed = true
                  AND d.profile_id = pm.profile_id
                  AND m.id = pm.measure_id
                  AND m.polling_frequency >= 0
                  AND d.id = $1
             ORDER BY m.id"#,
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await
        .context("select indexed measures")?;
        for row in &indexed_rows {
            let mut meas = IndexedMeasure {
                id: row.get("id"),
                name: row.get("name"),
                description: row.get::<Option<String>, _>("description").unwrap_or_default(),
                polling_frequency: row.get::<Option<i64>, _>("polling_frequency").unwrap_or(0),
                index_metric_id: row.get::<Option<i64>, _>("index_metric_id").unwrap_or(0),
                filter_metric_id: row.get("filter_metric_id"),
                filter_pattern: row.get::<Option<String>, _>("filter_pattern").unwrap_or_default(),
                invert_filter_match: row.get("invert_filter_match"),
                use_alternate_community: row.get("use_alternate_community"),
                labels_only: row.get("labels_only"),
                to_influx: row.get("to_influx"),
                to_kafka: row.get("to_kafka"),
                to_prometheus: row.get("to_prometheus"),
                ..Default::default()
            };
            meas.metrics = self.due_metrics(device_id, meas.id).await?;
            req.indexed_measures.push(meas);
        }

        // measures with no due metric left have nothing to poll
        req.scalar_measures.retain(|m| !m.metrics.is_empty());
        req.indexed_measures.retain(|m| !m.metrics.is_empty());
        Ok(req)
    }

    async fn device_snapshot(&self, device_id: i64) -> Result<Device> {
        let row = sqlx::query(
            r#"SELECT d.id, d.active, d.hostname, d.polling_frequency, d.ping_frequency,
                      COALESCE(d.tags::TEXT, '') AS tags,
                      d.to_influx, d.to_kafka, d.to_prometheus,
                      COALESCE(d.ip_address, '') AS ip_address,
                      d.snmp_port, d.snmp_version, d.snmp_community,
                      COALESCE(d.snmp_alternate_community, '') AS snmp_alternate_community,
                      d.snmp_timeout, d.snmp_retries, d.snmp_disable_bulk, d.snmp_connection_count,
                      COALESCE(d.snmpv3_security_level, '') AS snmpv3_security_level,
                      COALESCE(d.snmpv3_auth_user, '') AS snmpv3_auth_user,
                      COALESCE(d.snmpv3_auth_proto, '') AS snmpv3_auth_proto,
                      COALESCE(d.snmpv3_auth_passwd, '') AS snmpv3_auth_passwd,
                      COALESCE(d.snmpv3_privacy_proto, '') AS snmpv3_privacy_proto,
                      COALESCE(d.snmpv3_privacy_passwd, '') AS snmpv3_privacy_passwd,
                      p.id AS profile_id, p.category, p.vendor, p.model
                 FROM devices d, profiles p
                WHERE d.profile_id = p.id
                  AND d.id = $1"#,
        )
        .bind(device_id)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("device #{} snapshot", device_id))?;

        let mut device = Device {
            id: row.get("id"),
            active: row.get("active"),
            hostname: row.get("hostname"),
            polling_frequency: row.get::<Option<i64>, _>("polling_frequency").unwrap_or(0),
            ping_frequency: row.get::<Option<i64>, _>("ping_frequency").unwrap_or(0),
            tags: row.get("tags"),
            to_influx: row.get("to_influx"),
            to_kafka: row.get("to_kafka"),
            to_prometheus: row.get("to_prometheus"),
            snmp: SnmpParams {
                ip_address: row.get("ip_address"),
                snmp_port: row.get::<Option<i32>, _>("snmp_port").unwrap_or(0) as u16,
                snmp_version: row.get::<Option<String>, _>("snmp_version").unwrap_or_default(),
                snmp_community: row.get::<Option<String>, _>("snmp_community").unwrap_or_default(),
                snmp_alternate_community: row.get("snmp_alternate_community"),
                snmp_timeout: row.get::<Option<i32>, _>("snmp_timeout").unwrap_or(0) as u64,
                snmp_retries: row.get::<Option<i32>, _>("snmp_retries").unwrap_or(0) as u32,
                snmp_disable_bulk: row.get::<Option<bool>, _>("snmp_disable_bulk").unwrap_or(false),
                snmp_connection_count: row.get::<Option<i32>, _>("snmp_connection_count").unwrap_or(0) as usize,
                snmpv3_security_level: row.get("snmpv3_security_level"),
                snmpv3_auth_user: row.get("snmpv3_auth_user"),
                snmpv3_auth_proto: row.get("snmpv3_auth_proto"),
                snmpv3_auth_passwd: row.get("snmpv3_auth_passwd"),
                snmpv3_privacy_proto: row.get("snmpv3_privacy_proto"),
                snmpv3_privacy_passwd: row.get("snmpv3_privacy_passwd"),
            },
            profile: Profile {
                profile_id: row.get("profile_id"),
                category: row.get("category"),
                vendor: row.get("vendor"),
                model: row.get("model"),
            },
        };
        device.normalize().with_context(|| format!("device #{}", device_id))?;
        Ok(device)
    }

    /// Active metrics of a measure that are due for this device: either
    /// following the device frequency (0) or past their own.
    async fn due_metrics(&self, device_id: i64, measure_id: i64) -> Result<Vec<Metric>> {
        let rows = sqlx::query(
            r#"SELECT m.id, m.name, m.oid, m.description, m.active, m.export_as_label,
                      m.to_influx, m.to_kafka, m.to_prometheus, m.running_if_only,
                      COALESCE(m.polling_frequency, 0) AS polling_frequency,
                      COALESCE(m.post_processors, '{}') AS post_processors,
                      COALESCE(m.index_pattern, '') AS index_pattern
                 FROM metrics m, measure_metrics mm
                WHERE m.active = true
                  AND m.id = mm.metric_id
                  AND mm.measure_id = $1
                  AND (COALESCE(m.polling_frequency, 0) <= 0
                       OR NOT EXISTS (SELECT 1
                                        FROM metric_poll_times t
                                       WHERE t.device_id = $2
                                         AND t.metric_id = m.id
                                         AND EXTRACT(EPOCH FROM CURRENT_TIMESTAMP - t.last_polled_at) < m.polling_frequency))
             ORDER BY m.id"#,
        )
        .bind(measure_id)
        .bind(device_id)
        .fetch_all(&self.pool)
        .await
        .context("select measure metrics")?;

        let mut metrics = Vec::with_capacity(rows.len());
        for row in &rows {
            let oid: String = row.get("oid");
            metrics.push(Metric {
                id: row.get("id"),
                name: row.get("name"),
                oid: Oid::parse(&oid).with_context(|| format!("metric oid `{}`", oid))?,
                description: row.get::<Option<String>, _>("description").unwrap_or_default(),
                active: row.get("active"),
                export_as_label: row.get("export_as_label"),
                to_influx: row.get("to_influx"),
                to_kafka: row.get("to_kafka"),
                to_prometheus: row.get("to_prometheus"),
                running_if_only: row.get("running_if_only"),
                polling_frequency: row.get("polling_frequency"),
                post_processors: row.get::<Vec<String>, _>("post_processors"),
                index_pattern: row.get("index_pattern"),
                index_regex: None,
            });
        }
        Ok(metrics)
    }
}
