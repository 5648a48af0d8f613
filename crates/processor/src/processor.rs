//! Stream processor (C7 + C8): the core of §4.3. One call to
//! `handle_sensor_message` or `handle_registration_message` handles one MQ
//! delivery end to end — validate, persist, throttle, threshold/trend,
//! dedup, notify. Grounded in `hub::scheduler.rs`'s shape (guard checks
//! separated from the store writes they gate, a single function per
//! message kind) generalized from the teacher's irrigation decisions to
//! this system's threshold/trend/alert pipeline.

use std::collections::HashSet;
use std::future::Future;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use wq_common::circuit_breaker::{CallError, CircuitBreaker};
use wq_common::error::ProcessError;
use wq_common::models::{
    AlertKind, AlertThresholdConfig, DeviceStatus, NotificationPreferences, Parameter, Reading,
    ReadingFields, Severity, StoredReading, ThresholdBand, TrendDirection,
};
use wq_common::sqlite_store::Store;

use crate::dedup_cache::DedupCache;
use crate::notify::eligible_recipients;
use crate::sampler::ReadingSampler;
use crate::validator::{parse_reading, parse_registration};

/// Window of recent history samples considered for trend evaluation.
const TREND_WINDOW: usize = 5;
/// Minimum |change rate| over the window before a trend is considered at all.
const TREND_MIN_RATE: f64 = 0.10;
const TREND_WARNING_RATE: f64 = 0.20;
const TREND_CRITICAL_RATE: f64 = 0.30;

/// Shared, process-wide state threaded through every worker (§5: the
/// dedup cache and reading counters are shared within one processor
/// instance; the store is the cross-instance authority).
pub struct ProcessorContext {
    pub store: Store,
    pub sampler: ReadingSampler,
    pub dedup_cache: DedupCache,
    pub cb_email: CircuitBreaker,
}

/// §4.3, §4.4: handles one MQ delivery body for `sensor_readings` or
/// `device_registration`. The caller (worker loop in `main.rs`) decides
/// ack/nack from `ProcessError::should_nack`.
pub async fn handle_sensor_message<F, Fut>(
    ctx: &ProcessorContext,
    device_id: &str,
    body: &[u8],
    send_email: F,
) -> Result<(), ProcessError>
where
    F: Fn(String) -> Fut + Clone,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let reading = parse_reading(body)?;

    let device = ctx
        .store
        .get_device(device_id)
        .await
        .map_err(ProcessError::TransientStoreError)?;

    let Some(device) = device else {
        debug!(device_id, "unregistered, data rejected");
        return Err(ProcessError::UnregisteredDevice(device_id.to_string()));
    };
    if !device.is_registered_for_data() {
        debug!(device_id, "missing location");
        return Err(ProcessError::MissingLocation(device_id.to_string()));
    }

    for fields in reading.into_fields() {
        process_one_reading(ctx, device_id, &fields, send_email.clone()).await?;
    }
    Ok(())
}

async fn process_one_reading<F, Fut>(
    ctx: &ProcessorContext,
    device_id: &str,
    fields: &ReadingFields,
    send_email: F,
) -> Result<(), ProcessError>
where
    F: Fn(String) -> Fut + Clone,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let now = OffsetDateTime::now_utc();
    let stored = StoredReading {
        device_id: device_id.to_string(),
        ts_device: fields.ts_device,
        ts_received: now,
        turbidity: fields.turbidity,
        tds: fields.tds,
        ph: fields.ph,
    };

    // Step 2: latest write always, history write every N_HISTORY-th.
    ctx.store
        .upsert_latest_reading(&stored)
        .await
        .map_err(ProcessError::TransientStoreError)?;
    if ctx.sampler.increment_and_should_sample(device_id).await {
        ctx.store
            .insert_history_reading(&stored)
            .await
            .map_err(ProcessError::TransientStoreError)?;
    }

    // Step 3 (C12): status throttle. Failing this write is logged but
    // never nacks — Step 2 already succeeded, so per §7 this falls under
    // the same best-effort posture as alerting.
    if let Some(device) = ctx
        .store
        .get_device(device_id)
        .await
        .map_err(ProcessError::TransientStoreError)?
    {
        if crate::throttle::should_touch_last_seen(device.last_seen, now) {
            if let Err(e) = ctx
                .store
                .touch_last_seen(device_id, now, DeviceStatus::Online)
                .await
            {
                warn!(device_id, "status throttle write failed: {e:#}");
            }
        }
    }

    // Step 4: threshold + trend per present parameter.
    for parameter in Parameter::ALL {
        let Some(value) = fields.value_of(parameter) else {
            continue;
        };
        evaluate_threshold(ctx, device_id, parameter, value, now, send_email.clone()).await;
        evaluate_trend(ctx, device_id, parameter, now, send_email.clone()).await;
    }

    Ok(())
}

async fn evaluate_threshold<F, Fut>(
    ctx: &ProcessorContext,
    device_id: &str,
    parameter: Parameter,
    value: f64,
    now: OffsetDateTime,
    send_email: F,
) where
    F: Fn(String) -> Fut + Clone,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let cfg = match ctx.store.get_threshold_config(parameter).await {
        Ok(Some(cfg)) => cfg,
        Ok(None) => return,
        Err(e) => {
            warn!(device_id, parameter = parameter.as_str(), "threshold config load failed: {e:#}");
            return;
        }
    };
    let Some(severity) = cfg.resolve(value) else {
        return;
    };

    let key = DedupCache::threshold_key(device_id, parameter.as_str());
    if ctx.dedup_cache.is_hot(&key).await {
        return;
    }

    let threshold_value = crossed_bound(&cfg, severity, value);
    let (message, action) = threshold_alert_text(parameter, severity, value);

    create_alert_and_notify(
        ctx,
        device_id,
        parameter,
        AlertKind::Threshold,
        severity,
        value,
        threshold_value,
        None,
        &message,
        &action,
        &key,
        now,
        send_email,
    )
    .await;
}

/// The band boundary that was crossed, best-effort (prefers the band's
/// lower bound, since bands in this system are exceed-upward ranges).
fn crossed_bound(cfg: &AlertThresholdConfig, severity: Severity, _value: f64) -> Option<f64> {
    cfg.bands
        .iter()
        .find(|b| b.severity == severity)
        .and_then(|b: &ThresholdBand| b.min.or(b.max))
}

fn threshold_alert_text(parameter: Parameter, severity: Severity, value: f64) -> (String, String) {
    let message = format!(
        "{} {} reading: {:.2}",
        severity.as_str(),
        parameter.as_str(),
        value
    );
    let action = match severity {
        Severity::Critical => "Immediate inspection required",
        Severity::Warning => "Schedule inspection soon",
        Severity::Advisory => "Monitor trend",
    };
    (message, action.to_string())
}

async fn evaluate_trend<F, Fut>(
    ctx: &ProcessorContext,
    device_id: &str,
    parameter: Parameter,
    now: OffsetDateTime,
    send_email: F,
) where
    F: Fn(String) -> Fut + Clone,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let history = match ctx.store.recent_history(device_id, TREND_WINDOW as i64).await {
        Ok(h) => h,
        Err(e) => {
            warn!(device_id, "trend history load failed: {e:#}");
            return;
        }
    };

    let Some((severity, direction, rate)) = compute_trend(&history, parameter) else {
        return;
    };

    let key = DedupCache::trend_key(device_id, parameter.as_str());
    if ctx.dedup_cache.is_hot(&key).await {
        return;
    }

    let last_value = history
        .iter()
        .find_map(|r| r.value_of(parameter))
        .unwrap_or(0.0);
    let message = format!(
        "{} {} trend: {} by {:.1}%",
        severity.as_str(),
        parameter.as_str(),
        match direction {
            TrendDirection::Rising => "rising",
            TrendDirection::Falling => "falling",
        },
        rate.abs() * 100.0
    );
    let action = "Review recent history and confirm sensor calibration".to_string();

    create_alert_and_notify(
        ctx,
        device_id,
        parameter,
        AlertKind::Trend,
        severity,
        last_value,
        None,
        Some(direction),
        &message,
        &action,
        &key,
        now,
        send_email,
    )
    .await;
}

/// §4.3 step 4f: change rate across the trend window, plus a sustained
/// direction check (no reversal within the window).
fn compute_trend(history: &[StoredReading], parameter: Parameter) -> Option<(Severity, TrendDirection, f64)> {
    let mut values: Vec<f64> = history
        .iter()
        .rev() // store returns newest-first; walk chronologically
        .filter_map(|r| r.value_of(parameter))
        .collect();
    if values.len() < 2 {
        return None;
    }
    if values.len() > TREND_WINDOW {
        let start = values.len() - TREND_WINDOW;
        values = values[start..].to_vec();
    }

    let first = values[0];
    let last = *values.last().expect("checked len >= 2");
    if first == 0.0 {
        return None;
    }
    let change_rate = (last - first) / first.abs();
    if change_rate.abs() <= TREND_MIN_RATE {
        return None;
    }

    let rising = change_rate > 0.0;
    let sustained = values
        .windows(2)
        .all(|w| if rising { w[1] >= w[0] } else { w[1] <= w[0] });
    if !sustained {
        return None;
    }

    let abs_rate = change_rate.abs();
    let severity = if abs_rate > TREND_CRITICAL_RATE {
        Severity::Critical
    } else if abs_rate > TREND_WARNING_RATE {
        Severity::Warning
    } else {
        Severity::Advisory
    };
    let direction = if rising { TrendDirection::Rising } else { TrendDirection::Falling };
    Some((severity, direction, change_rate))
}

/// §4.3 steps 4c-4e: the authoritative dedup transaction, fan-out on
/// success, cache update only on a real win.
#[allow(clippy::too_many_arguments)]
async fn create_alert_and_notify<F, Fut>(
    ctx: &ProcessorContext,
    device_id: &str,
    parameter: Parameter,
    kind: AlertKind,
    severity: Severity,
    value: f64,
    threshold_value: Option<f64>,
    trend_direction: Option<TrendDirection>,
    message: &str,
    action: &str,
    cache_key: &str,
    now: OffsetDateTime,
    send_email: F,
) where
    F: Fn(String) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let trend_str = trend_direction.map(|d| match d {
        TrendDirection::Rising => "rising",
        TrendDirection::Falling => "falling",
    });

    let created = ctx
        .store
        .try_create_alert(
            device_id,
            parameter,
            kind,
            severity,
            value,
            threshold_value,
            trend_str,
            message,
            action,
        )
        .await;

    let alert = match created {
        Ok(Some(alert)) => alert,
        Ok(None) => {
            debug!(device_id, parameter = parameter.as_str(), "duplicate alert, skipped");
            return;
        }
        Err(e) => {
            warn!(device_id, "alert creation failed: {e:#}");
            return;
        }
    };

    ctx.dedup_cache.mark(cache_key).await;
    info!(
        device_id,
        parameter = parameter.as_str(),
        severity = severity.as_str(),
        alert_id = alert.alert_id,
        "alert created"
    );

    let users = match ctx.store.list_users().await {
        Ok(u) => u,
        Err(e) => {
            warn!("failed to list users for notification fan-out: {e:#}");
            return;
        }
    };
    let recipient_ids = eligible_recipients(&users, &alert, now);
    if recipient_ids.is_empty() {
        return;
    }

    let delivered = dispatch_notifications(&ctx.cb_email, &recipient_ids, &users, send_email).await;
    if let Err(e) = ctx.store.record_notifications_sent(&alert.alert_id, &delivered).await {
        warn!(alert_id = alert.alert_id, "failed to record notifications_sent: {e:#}");
    }
}

/// §4.3 step 4d fan-out. `send` is injected so this function is testable
/// without a real SMTP transport; `main.rs` wires it to
/// `EmailDispatcher::send` behind `cb_email` in production.
async fn dispatch_notifications<F, Fut>(
    cb_email: &CircuitBreaker,
    recipient_ids: &[&str],
    users: &[(String, NotificationPreferences)],
    send: F,
) -> HashSet<String>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut delivered = HashSet::new();
    for user_id in recipient_ids {
        let Some(email) = users
            .iter()
            .find(|(id, _)| id == user_id)
            .and_then(|(_, p)| p.email.clone())
        else {
            continue;
        };

        match cb_email.call(|| send(email.clone())).await {
            Ok(()) => {
                delivered.insert((*user_id).to_string());
            }
            Err(CallError::Open) => {
                debug!(user_id, "cb_email open, notification dropped");
            }
            Err(CallError::Timeout) => {
                warn!(user_id, "email send timed out");
            }
            Err(CallError::Inner(e)) => {
                warn!(user_id, "email send failed: {e:#}");
            }
        }
    }
    delivered
}

/// §4.4: registration ancillary processor.
pub async fn handle_registration_message(ctx: &ProcessorContext, body: &[u8]) -> Result<(), ProcessError> {
    let reg = parse_registration(body)?;
    let now = OffsetDateTime::now_utc();

    match ctx
        .store
        .get_device(&reg.device_id)
        .await
        .map_err(ProcessError::TransientStoreError)?
    {
        Some(device) => {
            if crate::throttle::should_touch_last_seen(device.last_seen, now) {
                ctx.store
                    .touch_last_seen(&reg.device_id, now, DeviceStatus::Online)
                    .await
                    .map_err(ProcessError::TransientStoreError)?;
            }
        }
        None => {
            ctx.store
                .ensure_device_stub(&reg.device_id, &reg.name, &reg.r#type)
                .await
                .map_err(ProcessError::TransientStoreError)?;
            info!(device_id = reg.device_id, "registered unregistered stub");
        }
    }
    Ok(())
}
