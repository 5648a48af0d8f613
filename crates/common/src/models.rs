//! Shared domain types for the water-quality pipeline: devices, readings,
//! thresholds, alerts and notification preferences.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use time::OffsetDateTime;

/// A monitored water-quality parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parameter {
    Turbidity,
    Tds,
    Ph,
}

impl Parameter {
    pub const ALL: [Parameter; 3] = [Parameter::Turbidity, Parameter::Tds, Parameter::Ph];

    pub fn as_str(&self) -> &'static str {
        match self {
            Parameter::Turbidity => "turbidity",
            Parameter::Tds => "tds",
            Parameter::Ph => "ph",
        }
    }

    pub fn parse(s: &str) -> Option<Parameter> {
        match s {
            "turbidity" => Some(Parameter::Turbidity),
            "tds" => Some(Parameter::Tds),
            "ph" => Some(Parameter::Ph),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Advisory,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Advisory => "advisory",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Severity> {
        match s {
            "advisory" => Some(Severity::Advisory),
            "warning" => Some(Severity::Warning),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Threshold,
    Trend,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Threshold => "threshold",
            AlertKind::Trend => "trend",
        }
    }

    pub fn parse(s: &str) -> Option<AlertKind> {
        match s {
            "threshold" => Some(AlertKind::Threshold),
            "trend" => Some(AlertKind::Trend),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Rising,
    Falling,
}

/// Alert status. Canonical case: `AlertStatus`, see DESIGN.md Open Question 1.
/// Transitions are one-way: Active -> Acknowledged -> Resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "active",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<AlertStatus> {
        match s {
            "active" => Some(AlertStatus::Active),
            "acknowledged" => Some(AlertStatus::Acknowledged),
            "resolved" => Some(AlertStatus::Resolved),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Online,
    Offline,
    Error,
    Maintenance,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Error => "error",
            DeviceStatus::Maintenance => "maintenance",
        }
    }

    pub fn parse(s: &str) -> Option<DeviceStatus> {
        match s {
            "online" => Some(DeviceStatus::Online),
            "offline" => Some(DeviceStatus::Offline),
            "error" => Some(DeviceStatus::Error),
            "maintenance" => Some(DeviceStatus::Maintenance),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub building: String,
    pub floor: String,
    pub notes: Option<String>,
}

impl Location {
    /// I-D1: a device is registered for data iff building and floor are
    /// both present and non-empty.
    pub fn is_complete(loc: &Option<Location>) -> bool {
        matches!(loc, Some(l) if !l.building.trim().is_empty() && !l.floor.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub name: String,
    pub r#type: String,
    pub firmware_version: Option<String>,
    pub mac: Option<String>,
    pub ip: Option<String>,
    pub sensor_kinds: HashSet<Parameter>,
    pub status: DeviceStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub registered_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
    pub location: Option<Location>,
}

impl Device {
    /// I-D1.
    pub fn is_registered_for_data(&self) -> bool {
        Location::is_complete(&self.location)
    }
}

/// A single sensor reading as received on the wire (one device, one instant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadingFields {
    pub ts_device: i64,
    pub turbidity: Option<f64>,
    pub tds: Option<f64>,
    pub ph: Option<f64>,
}

impl ReadingFields {
    pub fn value_of(&self, p: Parameter) -> Option<f64> {
        match p {
            Parameter::Turbidity => self.turbidity,
            Parameter::Tds => self.tds,
            Parameter::Ph => self.ph,
        }
    }

    /// I-R1: all present values must be finite numbers.
    pub fn all_finite(&self) -> bool {
        [self.turbidity, self.tds, self.ph]
            .into_iter()
            .flatten()
            .all(f64::is_finite)
    }
}

/// Wire payload: either a single reading or a batch. Decoded once at the
/// router, never threaded through the processor as an untyped map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reading {
    Single(ReadingFields),
    Batch { readings: Vec<ReadingFields> },
}

impl Reading {
    pub fn into_fields(self) -> Vec<ReadingFields> {
        match self {
            Reading::Single(f) => vec![f],
            Reading::Batch { readings } => readings,
        }
    }
}

/// A persisted record in the time-series store: one reading plus the
/// timestamp at which the server received it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredReading {
    pub device_id: String,
    pub ts_device: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub ts_received: OffsetDateTime,
    pub turbidity: Option<f64>,
    pub tds: Option<f64>,
    pub ph: Option<f64>,
}

impl StoredReading {
    pub fn value_of(&self, p: Parameter) -> Option<f64> {
        match p {
            Parameter::Turbidity => self.turbidity,
            Parameter::Tds => self.tds,
            Parameter::Ph => self.ph,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdBand {
    pub severity: Severity,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl ThresholdBand {
    pub fn contains(&self, v: f64) -> bool {
        let above_min = self.min.map(|m| v >= m).unwrap_or(true);
        let below_max = self.max.map(|m| v <= m).unwrap_or(true);
        above_min && below_max
    }
}

/// Per-parameter ordered severity bands, disjoint by construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThresholdConfig {
    pub parameter: Parameter,
    pub bands: Vec<ThresholdBand>,
}

impl AlertThresholdConfig {
    /// First matching band, highest severity wins if bands overlap due to
    /// misconfiguration (bands are expected disjoint, but evaluation order
    /// favors the more severe reading).
    pub fn resolve(&self, value: f64) -> Option<Severity> {
        self.bands
            .iter()
            .filter(|b| b.contains(value))
            .map(|b| b.severity)
            .max()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: String,
    pub device_id: String,
    pub parameter: Parameter,
    pub kind: AlertKind,
    pub severity: Severity,
    pub current_value: f64,
    pub threshold_value: Option<f64>,
    pub trend_direction: Option<TrendDirection>,
    pub message: String,
    pub recommended_action: String,
    pub status: AlertStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub acknowledged_at: Option<OffsetDateTime>,
    pub acknowledged_by: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub resolved_at: Option<OffsetDateTime>,
    pub resolved_by: Option<String>,
    pub resolved_notes: Option<String>,
    pub notifications_sent: HashSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPreferences {
    pub email: Option<String>,
    pub email_notifications: bool,
    pub push_notifications: bool,
    pub send_scheduled_alerts: bool,
    pub alert_severities: HashSet<Severity>,
    pub parameters: HashSet<Parameter>,
    pub devices: HashSet<String>,
    pub quiet_hours_enabled: bool,
    /// Minutes since local midnight.
    pub quiet_hours_start: u16,
    pub quiet_hours_end: u16,
}

impl NotificationPreferences {
    /// I-P1.
    pub fn is_valid(&self) -> bool {
        !self.email_notifications || self.email.as_deref().is_some_and(|e| e.contains('@'))
    }
}
