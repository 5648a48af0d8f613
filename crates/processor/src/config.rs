//! TOML config file loading and database seeding for alert thresholds and
//! statically-known devices. Shaped like `hub::config.rs`'s `load` + `apply`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use time::OffsetDateTime;
use wq_common::models::{AlertThresholdConfig, Device, DeviceStatus, Location, Parameter, ThresholdBand};
use wq_common::sqlite_store::Store;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub thresholds: Vec<ThresholdEntry>,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ThresholdEntry {
    pub parameter: String,
    pub bands: Vec<BandEntry>,
}

#[derive(Debug, Deserialize)]
pub struct BandEntry {
    pub severity: String,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct DeviceEntry {
    pub device_id: String,
    pub name: String,
    pub r#type: String,
    #[serde(default)]
    pub sensors: Vec<String>,
    pub building: Option<String>,
    pub floor: Option<String>,
}

/// Read and parse a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    Ok(config)
}

/// Upsert all threshold bands and seed devices from the config into the store.
pub async fn apply(config: &Config, store: &Store) -> Result<()> {
    for t in &config.thresholds {
        let parameter = Parameter::parse(&t.parameter)
            .with_context(|| format!("unknown parameter '{}' in config", t.parameter))?;
        let bands = t
            .bands
            .iter()
            .map(|b| {
                Ok(ThresholdBand {
                    severity: wq_common::models::Severity::parse(&b.severity)
                        .with_context(|| format!("unknown severity '{}' in config", b.severity))?,
                    min: b.min,
                    max: b.max,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        store
            .upsert_threshold_config(&AlertThresholdConfig { parameter, bands })
            .await
            .with_context(|| format!("failed to upsert threshold config for '{}'", t.parameter))?;
    }

    for d in &config.devices {
        let location = match (&d.building, &d.floor) {
            (Some(building), Some(floor)) => Some(Location {
                building: building.clone(),
                floor: floor.clone(),
                notes: None,
            }),
            _ => None,
        };
        let sensor_kinds: HashSet<Parameter> =
            d.sensors.iter().filter_map(|s| Parameter::parse(s)).collect();
        store
            .upsert_device(&Device {
                device_id: d.device_id.clone(),
                name: d.name.clone(),
                r#type: d.r#type.clone(),
                firmware_version: None,
                mac: None,
                ip: None,
                sensor_kinds,
                status: DeviceStatus::Offline,
                registered_at: OffsetDateTime::now_utc(),
                last_seen: None,
                location,
            })
            .await
            .with_context(|| format!("failed to seed device '{}'", d.device_id))?;
    }

    tracing::info!(
        thresholds = config.thresholds.len(),
        devices = config.devices.len(),
        "config applied"
    );

    Ok(())
}
