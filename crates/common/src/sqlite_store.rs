//! SQLite-backed metadata store (MS) and time-series store (TS), combined
//! into one connection pool the way `hub::db::Db` wraps zones/sensors/
//! readings/events behind a single struct. See SPEC_FULL.md §3 and the
//! I-A1 dedup transaction in §4.3 step 4c.

use crate::models::{
    Alert, AlertKind, AlertStatus, AlertThresholdConfig, Device, DeviceStatus, Location,
    NotificationPreferences, Parameter, Severity, StoredReading,
};
use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashSet;
use std::str::FromStr;
use time::OffsetDateTime;

#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

fn join_set<T: AsRef<str>>(items: impl IntoIterator<Item = T>) -> String {
    items
        .into_iter()
        .map(|s| s.as_ref().to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn split_set(s: &str) -> impl Iterator<Item = &str> {
    s.split(',').filter(|p| !p.is_empty())
}

fn parameters_to_string(params: &HashSet<Parameter>) -> String {
    join_set(params.iter().map(|p| p.as_str()))
}

fn parse_parameters(s: &str) -> HashSet<Parameter> {
    split_set(s).filter_map(Parameter::parse).collect()
}

fn severities_to_string(sevs: &HashSet<Severity>) -> String {
    join_set(sevs.iter().map(|s| s.as_str()))
}

fn parse_severities(s: &str) -> HashSet<Severity> {
    split_set(s).filter_map(Severity::parse).collect()
}

impl Store {
    /// db_url examples: "sqlite:/var/lib/wq/processor.db", "sqlite::memory:"
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("db health check failed")?;
        Ok(())
    }

    // ----------------------------
    // Devices (MS)
    // ----------------------------

    pub async fn upsert_device(&self, d: &Device) -> Result<()> {
        let sensor_kinds = parameters_to_string(&d.sensor_kinds);
        let status = d.status.as_str();
        let registered_at = d.registered_at.format(&time::format_description::well_known::Rfc3339)?;
        let last_seen = d
            .last_seen
            .map(|t| t.format(&time::format_description::well_known::Rfc3339))
            .transpose()?;
        let (building, floor, notes) = match &d.location {
            Some(l) => (Some(l.building.clone()), Some(l.floor.clone()), l.notes.clone()),
            None => (None, None, None),
        };

        sqlx::query(
            r#"
            INSERT INTO devices (
              device_id, name, type, firmware_version, mac, ip,
              sensor_kinds, status, registered_at, last_seen,
              location_building, location_floor, location_notes
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(device_id) DO UPDATE SET
              name=excluded.name,
              type=excluded.type,
              firmware_version=excluded.firmware_version,
              mac=excluded.mac,
              ip=excluded.ip,
              sensor_kinds=excluded.sensor_kinds,
              status=excluded.status,
              last_seen=excluded.last_seen,
              location_building=excluded.location_building,
              location_floor=excluded.location_floor,
              location_notes=excluded.location_notes
            "#,
        )
        .bind(&d.device_id)
        .bind(&d.name)
        .bind(&d.r#type)
        .bind(&d.firmware_version)
        .bind(&d.mac)
        .bind(&d.ip)
        .bind(sensor_kinds)
        .bind(status)
        .bind(registered_at)
        .bind(last_seen)
        .bind(building)
        .bind(floor)
        .bind(notes)
        .execute(&self.pool)
        .await
        .context("upsert_device failed")?;
        Ok(())
    }

    /// Creates a bare unregistered stub (no location) if the device does
    /// not already exist. Used by the registration ancillary processor
    /// (§4.4) and never overwrites an existing device's location.
    pub async fn ensure_device_stub(&self, device_id: &str, name: &str, r#type: &str) -> Result<()> {
        let now = OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)?;
        sqlx::query(
            r#"
            INSERT INTO devices (device_id, name, type, status, registered_at)
            VALUES (?, ?, ?, 'offline', ?)
            ON CONFLICT(device_id) DO NOTHING
            "#,
        )
        .bind(device_id)
        .bind(name)
        .bind(r#type)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("ensure_device_stub failed")?;
        Ok(())
    }

    pub async fn get_device(&self, device_id: &str) -> Result<Option<Device>> {
        let row = sqlx::query("SELECT * FROM devices WHERE device_id = ?")
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await
            .context("get_device failed")?;
        row.map(device_from_row).transpose()
    }

    pub async fn list_devices(&self) -> Result<Vec<Device>> {
        let rows = sqlx::query("SELECT * FROM devices ORDER BY device_id")
            .fetch_all(&self.pool)
            .await
            .context("list_devices failed")?;
        rows.into_iter().map(device_from_row).collect()
    }

    pub async fn delete_device(&self, device_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM devices WHERE device_id = ?")
            .bind(device_id)
            .execute(&self.pool)
            .await
            .context("delete_device failed")?;
        Ok(result.rows_affected() > 0)
    }

    /// C12 status throttle: the caller is responsible for the 5-minute
    /// debounce decision (see `processor::throttle`); this always writes.
    pub async fn touch_last_seen(&self, device_id: &str, now: OffsetDateTime, status: DeviceStatus) -> Result<()> {
        let now_str = now.format(&time::format_description::well_known::Rfc3339)?;
        sqlx::query("UPDATE devices SET last_seen = ?, status = ? WHERE device_id = ?")
            .bind(now_str)
            .bind(status.as_str())
            .bind(device_id)
            .execute(&self.pool)
            .await
            .context("touch_last_seen failed")?;
        Ok(())
    }

    // ----------------------------
    // Threshold config
    // ----------------------------

    pub async fn upsert_threshold_config(&self, cfg: &AlertThresholdConfig) -> Result<()> {
        let bands_json = serde_json::to_string(&cfg.bands)?;
        sqlx::query(
            r#"
            INSERT INTO threshold_configs (parameter, bands_json) VALUES (?, ?)
            ON CONFLICT(parameter) DO UPDATE SET bands_json = excluded.bands_json
            "#,
        )
        .bind(cfg.parameter.as_str())
        .bind(bands_json)
        .execute(&self.pool)
        .await
        .context("upsert_threshold_config failed")?;
        Ok(())
    }

    pub async fn get_threshold_config(&self, parameter: Parameter) -> Result<Option<AlertThresholdConfig>> {
        let row = sqlx::query("SELECT bands_json FROM threshold_configs WHERE parameter = ?")
            .bind(parameter.as_str())
            .fetch_optional(&self.pool)
            .await
            .context("get_threshold_config failed")?;
        match row {
            None => Ok(None),
            Some(row) => {
                let bands_json: String = row.get("bands_json");
                let bands = serde_json::from_str(&bands_json)?;
                Ok(Some(AlertThresholdConfig { parameter, bands }))
            }
        }
    }

    // ----------------------------
    // Readings (TS)
    // ----------------------------

    pub async fn upsert_latest_reading(&self, r: &StoredReading) -> Result<()> {
        let ts_received = r
            .ts_received
            .format(&time::format_description::well_known::Rfc3339)?;
        sqlx::query(
            r#"
            INSERT INTO sensor_readings_latest (device_id, ts_device, ts_received, turbidity, tds, ph)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(device_id) DO UPDATE SET
              ts_device=excluded.ts_device,
              ts_received=excluded.ts_received,
              turbidity=excluded.turbidity,
              tds=excluded.tds,
              ph=excluded.ph
            "#,
        )
        .bind(&r.device_id)
        .bind(r.ts_device)
        .bind(ts_received)
        .bind(r.turbidity)
        .bind(r.tds)
        .bind(r.ph)
        .execute(&self.pool)
        .await
        .context("upsert_latest_reading failed")?;
        Ok(())
    }

    pub async fn insert_history_reading(&self, r: &StoredReading) -> Result<()> {
        let ts_received = r
            .ts_received
            .format(&time::format_description::well_known::Rfc3339)?;
        sqlx::query(
            r#"
            INSERT INTO sensor_readings_history (device_id, ts_device, ts_received, turbidity, tds, ph)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&r.device_id)
        .bind(r.ts_device)
        .bind(ts_received)
        .bind(r.turbidity)
        .bind(r.tds)
        .bind(r.ph)
        .execute(&self.pool)
        .await
        .context("insert_history_reading failed")?;
        Ok(())
    }

    pub async fn recent_history(&self, device_id: &str, limit: i64) -> Result<Vec<StoredReading>> {
        let rows = sqlx::query(
            "SELECT * FROM sensor_readings_history WHERE device_id = ? ORDER BY ts_received DESC LIMIT ?",
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_history failed")?;
        rows.into_iter().map(stored_reading_from_row).collect()
    }

    // ----------------------------
    // Alerts (MS) — the I-A1 dedup transaction
    // ----------------------------

    /// Attempts to create a new Active alert for `(device_id, parameter,
    /// kind, severity)`. Returns `Ok(Some(alert))` if this call won the
    /// race and created it, `Ok(None)` if an Active alert already exists
    /// for that tuple (the authoritative dedup outcome — §4.3 step 4c).
    #[allow(clippy::too_many_arguments)]
    pub async fn try_create_alert(
        &self,
        device_id: &str,
        parameter: Parameter,
        kind: AlertKind,
        severity: Severity,
        current_value: f64,
        threshold_value: Option<f64>,
        trend_direction: Option<&str>,
        message: &str,
        recommended_action: &str,
    ) -> Result<Option<Alert>> {
        let mut tx = self.pool.begin().await.context("begin alert tx failed")?;

        let existing = sqlx::query(
            r#"
            SELECT alert_id FROM alerts
            WHERE device_id = ? AND parameter = ? AND kind = ? AND severity = ? AND status = 'active'
            LIMIT 1
            "#,
        )
        .bind(device_id)
        .bind(parameter.as_str())
        .bind(kind.as_str())
        .bind(severity.as_str())
        .fetch_optional(&mut *tx)
        .await
        .context("dedup check failed")?;

        if existing.is_some() {
            tx.rollback().await.context("rollback after duplicate failed")?;
            return Ok(None);
        }

        let alert_id = format!("alrt_{}", uuid_like(device_id, parameter.as_str(), kind.as_str()));
        let now = OffsetDateTime::now_utc();
        let created_at = now.format(&time::format_description::well_known::Rfc3339)?;

        // Relies on idx_alerts_active_unique to reject a racing insert that
        // slipped past the SELECT above (two transactions reading the same
        // "no active alert" snapshot). Whichever commits first wins; the
        // loser's constraint violation is treated as a duplicate outcome.
        let inserted = sqlx::query(
            r#"
            INSERT INTO alerts (
              alert_id, device_id, parameter, kind, severity,
              current_value, threshold_value, trend_direction,
              message, recommended_action, status, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'active', ?)
            "#,
        )
        .bind(&alert_id)
        .bind(device_id)
        .bind(parameter.as_str())
        .bind(kind.as_str())
        .bind(severity.as_str())
        .bind(current_value)
        .bind(threshold_value)
        .bind(trend_direction)
        .bind(message)
        .bind(recommended_action)
        .bind(&created_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {
                tx.commit().await.context("commit alert tx failed")?;
                Ok(Some(Alert {
                    alert_id,
                    device_id: device_id.to_string(),
                    parameter,
                    kind,
                    severity,
                    current_value,
                    threshold_value,
                    trend_direction: trend_direction.and_then(parse_trend_direction),
                    message: message.to_string(),
                    recommended_action: recommended_action.to_string(),
                    status: AlertStatus::Active,
                    created_at: now,
                    acknowledged_at: None,
                    acknowledged_by: None,
                    resolved_at: None,
                    resolved_by: None,
                    resolved_notes: None,
                    notifications_sent: HashSet::new(),
                }))
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                tx.rollback().await.context("rollback after unique violation failed")?;
                Ok(None)
            }
            Err(e) => {
                tx.rollback().await.ok();
                Err(e).context("insert alert failed")
            }
        }
    }

    pub async fn get_alert(&self, alert_id: &str) -> Result<Option<Alert>> {
        let row = sqlx::query("SELECT * FROM alerts WHERE alert_id = ?")
            .bind(alert_id)
            .fetch_optional(&self.pool)
            .await
            .context("get_alert failed")?;
        row.map(alert_from_row).transpose()
    }

    /// I-A2: Active -> Acknowledged. Idempotent no-op if already
    /// Acknowledged or Resolved (never reverses a transition).
    pub async fn acknowledge_alert(&self, alert_id: &str, by: &str) -> Result<Option<Alert>> {
        let now = OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)?;
        sqlx::query(
            r#"
            UPDATE alerts SET status = 'acknowledged', acknowledged_at = ?, acknowledged_by = ?
            WHERE alert_id = ? AND status = 'active'
            "#,
        )
        .bind(now)
        .bind(by)
        .bind(alert_id)
        .execute(&self.pool)
        .await
        .context("acknowledge_alert failed")?;
        self.get_alert(alert_id).await
    }

    /// I-A2: Active|Acknowledged -> Resolved. Idempotent: calling twice on
    /// an already-resolved alert leaves it unchanged and returns it.
    pub async fn resolve_alert(&self, alert_id: &str, by: &str, notes: Option<&str>) -> Result<Option<Alert>> {
        let now = OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)?;
        sqlx::query(
            r#"
            UPDATE alerts SET status = 'resolved', resolved_at = ?, resolved_by = ?, resolved_notes = ?
            WHERE alert_id = ? AND status != 'resolved'
            "#,
        )
        .bind(now)
        .bind(by)
        .bind(notes)
        .bind(alert_id)
        .execute(&self.pool)
        .await
        .context("resolve_alert failed")?;
        self.get_alert(alert_id).await
    }

    pub async fn record_notifications_sent(&self, alert_id: &str, delivered: &HashSet<String>) -> Result<()> {
        if delivered.is_empty() {
            return Ok(());
        }
        if let Some(alert) = self.get_alert(alert_id).await? {
            let mut merged = alert.notifications_sent;
            merged.extend(delivered.iter().cloned());
            let joined = join_set(merged);
            sqlx::query("UPDATE alerts SET notifications_sent = ? WHERE alert_id = ?")
                .bind(joined)
                .bind(alert_id)
                .execute(&self.pool)
                .await
                .context("record_notifications_sent failed")?;
        }
        Ok(())
    }

    // ----------------------------
    // Users / notification preferences
    // ----------------------------

    pub async fn list_users(&self) -> Result<Vec<(String, NotificationPreferences)>> {
        let rows = sqlx::query("SELECT * FROM users")
            .fetch_all(&self.pool)
            .await
            .context("list_users failed")?;
        rows.into_iter().map(user_from_row).collect()
    }

    pub async fn upsert_user(&self, user_id: &str, prefs: &NotificationPreferences) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (
              user_id, email, email_notifications, push_notifications,
              send_scheduled_alerts, alert_severities, parameters, devices,
              quiet_hours_enabled, quiet_hours_start, quiet_hours_end
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
              email=excluded.email,
              email_notifications=excluded.email_notifications,
              push_notifications=excluded.push_notifications,
              send_scheduled_alerts=excluded.send_scheduled_alerts,
              alert_severities=excluded.alert_severities,
              parameters=excluded.parameters,
              devices=excluded.devices,
              quiet_hours_enabled=excluded.quiet_hours_enabled,
              quiet_hours_start=excluded.quiet_hours_start,
              quiet_hours_end=excluded.quiet_hours_end
            "#,
        )
        .bind(user_id)
        .bind(&prefs.email)
        .bind(prefs.email_notifications)
        .bind(prefs.push_notifications)
        .bind(prefs.send_scheduled_alerts)
        .bind(severities_to_string(&prefs.alert_severities))
        .bind(parameters_to_string(&prefs.parameters))
        .bind(join_set(prefs.devices.iter()))
        .bind(prefs.quiet_hours_enabled)
        .bind(prefs.quiet_hours_start as i64)
        .bind(prefs.quiet_hours_end as i64)
        .execute(&self.pool)
        .await
        .context("upsert_user failed")?;
        Ok(())
    }
}

fn parse_trend_direction(s: &str) -> Option<crate::models::TrendDirection> {
    match s {
        "rising" => Some(crate::models::TrendDirection::Rising),
        "falling" => Some(crate::models::TrendDirection::Falling),
        _ => None,
    }
}

/// Deterministic, dependency-free id generator (avoids pulling in a uuid
/// crate for one call site): device/parameter/kind plus a monotonic
/// nanosecond timestamp is unique enough for this system's scale.
fn uuid_like(device_id: &str, parameter: &str, kind: &str) -> String {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    format!("{device_id}-{parameter}-{kind}-{nanos}")
}

fn device_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Device> {
    let status: String = row.get("status");
    let registered_at: String = row.get("registered_at");
    let last_seen: Option<String> = row.get("last_seen");
    let building: Option<String> = row.get("location_building");
    let floor: Option<String> = row.get("location_floor");
    let notes: Option<String> = row.get("location_notes");
    let sensor_kinds: String = row.get("sensor_kinds");

    let location = match (building, floor) {
        (Some(building), Some(floor)) => Some(Location { building, floor, notes }),
        _ => None,
    };

    Ok(Device {
        device_id: row.get("device_id"),
        name: row.get("name"),
        r#type: row.get("type"),
        firmware_version: row.get("firmware_version"),
        mac: row.get("mac"),
        ip: row.get("ip"),
        sensor_kinds: parse_parameters(&sensor_kinds),
        status: DeviceStatus::parse(&status).unwrap_or(DeviceStatus::Offline),
        registered_at: OffsetDateTime::parse(&registered_at, &time::format_description::well_known::Rfc3339)?,
        last_seen: last_seen
            .map(|s| OffsetDateTime::parse(&s, &time::format_description::well_known::Rfc3339))
            .transpose()?,
        location,
    })
}

fn stored_reading_from_row(row: sqlx::sqlite::SqliteRow) -> Result<StoredReading> {
    let ts_received: String = row.get("ts_received");
    Ok(StoredReading {
        device_id: row.get("device_id"),
        ts_device: row.get("ts_device"),
        ts_received: OffsetDateTime::parse(&ts_received, &time::format_description::well_known::Rfc3339)?,
        turbidity: row.get("turbidity"),
        tds: row.get("tds"),
        ph: row.get("ph"),
    })
}

fn alert_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Alert> {
    let parameter: String = row.get("parameter");
    let kind: String = row.get("kind");
    let severity: String = row.get("severity");
    let status: String = row.get("status");
    let created_at: String = row.get("created_at");
    let acknowledged_at: Option<String> = row.get("acknowledged_at");
    let resolved_at: Option<String> = row.get("resolved_at");
    let trend_direction: Option<String> = row.get("trend_direction");
    let notifications_sent: String = row.get("notifications_sent");

    Ok(Alert {
        alert_id: row.get("alert_id"),
        device_id: row.get("device_id"),
        parameter: Parameter::parse(&parameter).context("bad parameter in db")?,
        kind: AlertKind::parse(&kind).context("bad kind in db")?,
        severity: Severity::parse(&severity).context("bad severity in db")?,
        current_value: row.get("current_value"),
        threshold_value: row.get("threshold_value"),
        trend_direction: trend_direction.as_deref().and_then(parse_trend_direction),
        message: row.get("message"),
        recommended_action: row.get("recommended_action"),
        status: AlertStatus::parse(&status).context("bad status in db")?,
        created_at: OffsetDateTime::parse(&created_at, &time::format_description::well_known::Rfc3339)?,
        acknowledged_at: acknowledged_at
            .map(|s| OffsetDateTime::parse(&s, &time::format_description::well_known::Rfc3339))
            .transpose()?,
        acknowledged_by: row.get("acknowledged_by"),
        resolved_at: resolved_at
            .map(|s| OffsetDateTime::parse(&s, &time::format_description::well_known::Rfc3339))
            .transpose()?,
        resolved_by: row.get("resolved_by"),
        resolved_notes: row.get("resolved_notes"),
        notifications_sent: split_set(&notifications_sent).map(String::from).collect(),
    })
}

fn user_from_row(row: sqlx::sqlite::SqliteRow) -> Result<(String, NotificationPreferences)> {
    let alert_severities: String = row.get("alert_severities");
    let parameters: String = row.get("parameters");
    let devices: String = row.get("devices");
    let user_id: String = row.get("user_id");

    Ok((
        user_id,
        NotificationPreferences {
            email: row.get("email"),
            email_notifications: row.get("email_notifications"),
            push_notifications: row.get("push_notifications"),
            send_scheduled_alerts: row.get("send_scheduled_alerts"),
            alert_severities: parse_severities(&alert_severities),
            parameters: parse_parameters(&parameters),
            devices: split_set(&devices).map(String::from).collect(),
            quiet_hours_enabled: row.get("quiet_hours_enabled"),
            quiet_hours_start: row.get::<i64, _>("quiet_hours_start") as u16,
            quiet_hours_end: row.get::<i64, _>("quiet_hours_end") as u16,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ThresholdBand;

    async fn test_store() -> Store {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    fn sample_device(id: &str, with_location: bool) -> Device {
        Device {
            device_id: id.to_string(),
            name: "Probe A".to_string(),
            r#type: "multi-param".to_string(),
            firmware_version: Some("1.0.0".to_string()),
            mac: None,
            ip: None,
            sensor_kinds: [Parameter::Ph, Parameter::Turbidity].into_iter().collect(),
            status: DeviceStatus::Online,
            registered_at: OffsetDateTime::now_utc(),
            last_seen: None,
            location: with_location.then(|| Location {
                building: "Building A".to_string(),
                floor: "2F".to_string(),
                notes: None,
            }),
        }
    }

    #[tokio::test]
    async fn upsert_and_get_device_roundtrips() {
        let store = test_store().await;
        store.upsert_device(&sample_device("d1", true)).await.unwrap();
        let d = store.get_device("d1").await.unwrap().unwrap();
        assert_eq!(d.device_id, "d1");
        assert!(d.is_registered_for_data());
        assert!(d.sensor_kinds.contains(&Parameter::Ph));
    }

    #[tokio::test]
    async fn device_without_location_is_not_registered_for_data() {
        let store = test_store().await;
        store.upsert_device(&sample_device("d2", false)).await.unwrap();
        let d = store.get_device("d2").await.unwrap().unwrap();
        assert!(!d.is_registered_for_data());
    }

    #[tokio::test]
    async fn try_create_alert_succeeds_once_then_dedups() {
        let store = test_store().await;
        store.upsert_device(&sample_device("d1", true)).await.unwrap();

        let first = store
            .try_create_alert(
                "d1",
                Parameter::Ph,
                AlertKind::Threshold,
                Severity::Critical,
                9.5,
                Some(9.0),
                None,
                "pH above safe threshold",
                "Inspect dosing pump",
            )
            .await
            .unwrap();
        assert!(first.is_some());

        let second = store
            .try_create_alert(
                "d1",
                Parameter::Ph,
                AlertKind::Threshold,
                Severity::Critical,
                9.6,
                Some(9.0),
                None,
                "pH above safe threshold",
                "Inspect dosing pump",
            )
            .await
            .unwrap();
        assert!(second.is_none(), "duplicate active alert must not be created");
    }

    #[tokio::test]
    async fn acknowledge_then_new_reading_creates_new_alert() {
        let store = test_store().await;
        store.upsert_device(&sample_device("d1", true)).await.unwrap();

        let alert = store
            .try_create_alert(
                "d1", Parameter::Ph, AlertKind::Threshold, Severity::Critical,
                9.5, Some(9.0), None, "m", "a",
            )
            .await
            .unwrap()
            .unwrap();

        store.acknowledge_alert(&alert.alert_id, "admin@example.com").await.unwrap();

        let reopened = store
            .try_create_alert(
                "d1", Parameter::Ph, AlertKind::Threshold, Severity::Critical,
                9.7, Some(9.0), None, "m", "a",
            )
            .await
            .unwrap();
        assert!(reopened.is_some(), "acknowledging frees the slot for a new alert");
    }

    #[tokio::test]
    async fn resolve_alert_is_idempotent() {
        let store = test_store().await;
        store.upsert_device(&sample_device("d1", true)).await.unwrap();
        let alert = store
            .try_create_alert(
                "d1", Parameter::Ph, AlertKind::Threshold, Severity::Critical,
                9.5, Some(9.0), None, "m", "a",
            )
            .await
            .unwrap()
            .unwrap();

        let r1 = store.resolve_alert(&alert.alert_id, "admin", Some("fixed")).await.unwrap().unwrap();
        assert_eq!(r1.status, AlertStatus::Resolved);

        let r2 = store.resolve_alert(&alert.alert_id, "admin2", Some("again")).await.unwrap().unwrap();
        assert_eq!(r2.status, AlertStatus::Resolved);
        // First resolver's attribution sticks; idempotent means no-op, not overwrite.
        assert_eq!(r2.resolved_by.as_deref(), Some("admin"));
    }

    #[tokio::test]
    async fn different_severities_coexist_as_separate_alerts() {
        let store = test_store().await;
        store.upsert_device(&sample_device("d1", true)).await.unwrap();

        let warning = store
            .try_create_alert(
                "d1", Parameter::Ph, AlertKind::Threshold, Severity::Warning,
                8.6, Some(8.5), None, "m", "a",
            )
            .await
            .unwrap();
        let critical = store
            .try_create_alert(
                "d1", Parameter::Ph, AlertKind::Threshold, Severity::Critical,
                9.3, Some(9.0), None, "m", "a",
            )
            .await
            .unwrap();
        assert!(warning.is_some());
        assert!(critical.is_some());
    }

    #[tokio::test]
    async fn threshold_config_roundtrips() {
        let store = test_store().await;
        let cfg = AlertThresholdConfig {
            parameter: Parameter::Ph,
            bands: vec![
                ThresholdBand { severity: Severity::Warning, min: Some(8.5), max: Some(9.0) },
                ThresholdBand { severity: Severity::Critical, min: Some(9.0), max: None },
            ],
        };
        store.upsert_threshold_config(&cfg).await.unwrap();
        let loaded = store.get_threshold_config(Parameter::Ph).await.unwrap().unwrap();
        assert_eq!(loaded.bands.len(), 2);
        assert_eq!(loaded.resolve(9.5), Some(Severity::Critical));
    }

    #[tokio::test]
    async fn latest_reading_upsert_overwrites() {
        let store = test_store().await;
        store.upsert_device(&sample_device("d1", true)).await.unwrap();
        let r1 = StoredReading {
            device_id: "d1".into(), ts_device: 1, ts_received: OffsetDateTime::now_utc(),
            turbidity: Some(1.0), tds: None, ph: Some(7.0),
        };
        store.upsert_latest_reading(&r1).await.unwrap();
        let r2 = StoredReading {
            device_id: "d1".into(), ts_device: 2, ts_received: OffsetDateTime::now_utc(),
            turbidity: Some(2.0), tds: None, ph: Some(7.2),
        };
        store.upsert_latest_reading(&r2).await.unwrap();

        store.insert_history_reading(&r1).await.unwrap();
        let hist = store.recent_history("d1", 10).await.unwrap();
        assert_eq!(hist.len(), 1);
    }
}
