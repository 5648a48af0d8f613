//! Validator/router (C7): decodes the two MQTT-origin wire payloads into
//! typed values exactly once, at the edge of the processor, so the rest of
//! the pipeline never threads an untyped JSON map (§9 design note).

use serde::Deserialize;
use std::collections::HashSet;
use wq_common::error::ProcessError;
use wq_common::models::{Parameter, Reading, ReadingFields};

/// Wire shape of `device/sensordata/{device_id}`: a single reading or a
/// `{readings: [...]}` batch, each using `timestamp` on the wire where the
/// domain model uses `ts_device`.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireReading {
    Batch { readings: Vec<WireReadingFields> },
    Single(WireReadingFields),
}

#[derive(Deserialize)]
struct WireReadingFields {
    timestamp: i64,
    turbidity: Option<f64>,
    tds: Option<f64>,
    ph: Option<f64>,
}

impl From<WireReadingFields> for ReadingFields {
    fn from(w: WireReadingFields) -> Self {
        ReadingFields {
            ts_device: w.timestamp,
            turbidity: w.turbidity,
            tds: w.tds,
            ph: w.ph,
        }
    }
}

/// §4.3 Step 1: parse the body and reject (as `InvalidPayload`) if
/// unparseable or any numeric field is non-finite (I-R1).
pub fn parse_reading(body: &[u8]) -> Result<Reading, ProcessError> {
    let wire: WireReading = serde_json::from_slice(body)
        .map_err(|e| ProcessError::InvalidPayload(format!("bad sensor payload: {e}")))?;

    let reading = match wire {
        WireReading::Single(f) => Reading::Single(f.into()),
        WireReading::Batch { readings } => Reading::Batch {
            readings: readings.into_iter().map(Into::into).collect(),
        },
    };

    let fields = match &reading {
        Reading::Single(f) => std::slice::from_ref(f),
        Reading::Batch { readings } => readings.as_slice(),
    };
    if fields.is_empty() {
        return Err(ProcessError::InvalidPayload("empty reading batch".into()));
    }
    if !fields.iter().all(ReadingFields::all_finite) {
        return Err(ProcessError::InvalidPayload("non-finite numeric field".into()));
    }

    Ok(reading)
}

/// Wire shape of `device/registration/{device_id}`.
#[derive(Debug, Deserialize)]
pub struct RegistrationPayload {
    pub device_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub r#type: String,
    pub firmware_version: Option<String>,
    pub mac: Option<String>,
    pub ip: Option<String>,
    #[serde(default)]
    pub sensors: Vec<String>,
}

impl RegistrationPayload {
    pub fn sensor_kinds(&self) -> HashSet<Parameter> {
        self.sensors.iter().filter_map(|s| Parameter::parse(s)).collect()
    }
}

pub fn parse_registration(body: &[u8]) -> Result<RegistrationPayload, ProcessError> {
    serde_json::from_slice(body)
        .map_err(|e| ProcessError::InvalidPayload(format!("bad registration payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_reading() {
        let body = br#"{"timestamp": 1000, "ph": 7.2, "turbidity": 1.5}"#;
        let reading = parse_reading(body).unwrap();
        let fields = reading.into_fields();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].ts_device, 1000);
        assert_eq!(fields[0].ph, Some(7.2));
        assert_eq!(fields[0].tds, None);
    }

    #[test]
    fn parses_batch_reading() {
        let body = br#"{"readings": [{"timestamp": 1, "ph": 7.0}, {"timestamp": 2, "ph": 7.1}]}"#;
        let reading = parse_reading(body).unwrap();
        assert_eq!(reading.into_fields().len(), 2);
    }

    #[test]
    fn rejects_non_finite_value() {
        let body = br#"{"timestamp": 1000, "ph": "NaN"}"#;
        assert!(parse_reading(body).is_err());
    }

    #[test]
    fn rejects_unparseable_body() {
        assert!(parse_reading(b"not json").is_err());
    }

    #[test]
    fn rejects_empty_batch() {
        let body = br#"{"readings": []}"#;
        assert!(parse_reading(body).is_err());
    }

    #[test]
    fn parses_registration_payload() {
        let body = br#"{
            "device_id": "d1", "name": "Probe A", "type": "multi-param",
            "firmware_version": "1.0.0", "mac": null, "ip": "10.0.0.5",
            "sensors": ["ph", "turbidity", "bogus"]
        }"#;
        let reg = parse_registration(body).unwrap();
        assert_eq!(reg.device_id, "d1");
        let kinds = reg.sensor_kinds();
        assert!(kinds.contains(&Parameter::Ph));
        assert!(kinds.contains(&Parameter::Turbidity));
        assert_eq!(kinds.len(), 2);
    }

    #[test]
    fn registration_defaults_sensors_to_empty() {
        let body = br#"{"device_id": "d1", "name": "n", "type": "t"}"#;
        let reg = parse_registration(body).unwrap();
        assert!(reg.sensors.is_empty());
    }
}
