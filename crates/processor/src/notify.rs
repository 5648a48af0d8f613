//! Notification selector (C9): filters preferences and quiet hours to
//! compute the recipient set for a new alert (§4.3 step 4d). Cooldown-style
//! local-time window math is original engineering — the closest analogue
//! in the pack (`other_examples`' notification service) only carries
//! `quiet_hours_enabled` as a config flag, with no window computation to
//! crib from — so this follows the wrap-across-midnight rule spelled out
//! in the GLOSSARY directly.
//!
//! `now` is expected to already be expressed in the deployment's local
//! time (a single server-wide offset, applied by the caller before this
//! function runs) since `quiet_hours_start`/`end` are minutes-since-local-
//! midnight with no per-user timezone stored (DESIGN.md Open Question 6).

use wq_common::models::{Alert, NotificationPreferences};

/// Minutes since local midnight for `now`.
fn minutes_of_day(now: time::OffsetDateTime) -> u16 {
    (now.hour() as u16) * 60 + now.minute() as u16
}

/// True if quiet hours are disabled, or `now` falls outside `[start, end)`.
/// `start > end` means the window wraps past midnight (e.g. 22:00-06:00).
pub fn not_in_quiet_hours(prefs: &NotificationPreferences, now: time::OffsetDateTime) -> bool {
    if !prefs.quiet_hours_enabled {
        return true;
    }
    let minute = minutes_of_day(now);
    let (start, end) = (prefs.quiet_hours_start, prefs.quiet_hours_end);
    let in_window = if start <= end {
        minute >= start && minute < end
    } else {
        minute >= start || minute < end
    };
    !in_window
}

/// §4.3 step 4d recipient predicate, applied against every `(user_id, prefs)`.
pub fn is_eligible(user_id: &str, prefs: &NotificationPreferences, alert: &Alert, now: time::OffsetDateTime) -> bool {
    let _ = user_id;
    prefs.email_notifications
        && prefs.alert_severities.contains(&alert.severity)
        && (prefs.parameters.is_empty() || prefs.parameters.contains(&alert.parameter))
        && (prefs.devices.is_empty() || prefs.devices.contains(&alert.device_id))
        && not_in_quiet_hours(prefs, now)
}

/// Computes the full eligible-recipient set for an alert.
pub fn eligible_recipients<'a>(
    users: &'a [(String, NotificationPreferences)],
    alert: &Alert,
    now: time::OffsetDateTime,
) -> Vec<&'a str> {
    users
        .iter()
        .filter(|(user_id, prefs)| is_eligible(user_id, prefs, alert, now))
        .map(|(user_id, _)| user_id.as_str())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use time::macros::datetime;
    use wq_common::models::{AlertKind, AlertStatus, Parameter, Severity};

    fn prefs(quiet_enabled: bool, start: u16, end: u16) -> NotificationPreferences {
        NotificationPreferences {
            email: Some("u@example.com".into()),
            email_notifications: true,
            push_notifications: false,
            send_scheduled_alerts: false,
            alert_severities: [Severity::Critical].into_iter().collect(),
            parameters: HashSet::new(),
            devices: HashSet::new(),
            quiet_hours_enabled: quiet_enabled,
            quiet_hours_start: start,
            quiet_hours_end: end,
        }
    }

    fn sample_alert() -> Alert {
        Alert {
            alert_id: "alrt_1".into(),
            device_id: "d1".into(),
            parameter: Parameter::Ph,
            kind: AlertKind::Threshold,
            severity: Severity::Critical,
            current_value: 9.5,
            threshold_value: Some(9.0),
            trend_direction: None,
            message: "pH above threshold".into(),
            recommended_action: "Inspect dosing pump".into(),
            status: AlertStatus::Active,
            created_at: time::OffsetDateTime::now_utc(),
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            resolved_by: None,
            resolved_notes: None,
            notifications_sent: HashSet::new(),
        }
    }

    #[test]
    fn disabled_quiet_hours_always_eligible() {
        let p = prefs(false, 22 * 60, 6 * 60);
        let midnight = datetime!(2026-01-01 0:30:00 UTC);
        assert!(not_in_quiet_hours(&p, midnight));
    }

    #[test]
    fn non_wrapping_window_blocks_inside() {
        let p = prefs(true, 9 * 60, 17 * 60);
        let noon = datetime!(2026-01-01 12:00:00 UTC);
        assert!(!not_in_quiet_hours(&p, noon));
        let evening = datetime!(2026-01-01 18:00:00 UTC);
        assert!(not_in_quiet_hours(&p, evening));
    }

    #[test]
    fn wrapping_window_blocks_across_midnight() {
        let p = prefs(true, 22 * 60, 6 * 60);
        let late_night = datetime!(2026-01-01 23:30:00 UTC);
        assert!(!not_in_quiet_hours(&p, late_night));
        let early_morning = datetime!(2026-01-01 3:00:00 UTC);
        assert!(!not_in_quiet_hours(&p, early_morning));
        let midday = datetime!(2026-01-01 12:00:00 UTC);
        assert!(not_in_quiet_hours(&p, midday));
    }

    #[test]
    fn window_end_is_exclusive() {
        let p = prefs(true, 22 * 60, 6 * 60);
        let exactly_end = datetime!(2026-01-01 6:00:00 UTC);
        assert!(not_in_quiet_hours(&p, exactly_end));
    }

    #[test]
    fn eligible_recipients_filters_by_severity_and_quiet_hours() {
        let alert = sample_alert();
        let noon = datetime!(2026-01-01 12:00:00 UTC);
        let users = vec![
            ("matches".to_string(), prefs(false, 0, 0)),
            ("quiet".to_string(), prefs(true, 9 * 60, 17 * 60)),
        ];
        let recipients = eligible_recipients(&users, &alert, noon);
        assert_eq!(recipients, vec!["matches"]);
    }

    #[test]
    fn empty_parameters_and_devices_match_everything() {
        let alert = sample_alert();
        let mut p = prefs(false, 0, 0);
        p.parameters = HashSet::new();
        p.devices = HashSet::new();
        assert!(is_eligible("u1", &p, &alert, time::OffsetDateTime::now_utc()));
    }

    #[test]
    fn non_matching_device_filter_excludes() {
        let alert = sample_alert();
        let mut p = prefs(false, 0, 0);
        p.devices = ["other-device".to_string()].into_iter().collect();
        assert!(!is_eligible("u1", &p, &alert, time::OffsetDateTime::now_utc()));
    }
}
