//! Topic parsing for the two edge-facing subscriptions (SPEC_FULL.md §4.2).

/// Extract device_id from "device/sensordata/<device_id>".
pub fn extract_sensordata_device_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "device" && parts[1] == "sensordata" {
        Some(parts[2])
    } else {
        None
    }
}

/// Extract device_id from "device/registration/<device_id>".
pub fn extract_registration_device_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "device" && parts[1] == "registration" {
        Some(parts[2])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_sensordata_device_id_valid_topic() {
        assert_eq!(
            extract_sensordata_device_id("device/sensordata/probe-a1"),
            Some("probe-a1")
        );
    }

    #[test]
    fn extract_sensordata_device_id_wrong_prefix() {
        assert_eq!(extract_sensordata_device_id("foo/sensordata/d1"), None);
    }

    #[test]
    fn extract_sensordata_device_id_wrong_middle_segment() {
        assert_eq!(extract_sensordata_device_id("device/registration/d1"), None);
    }

    #[test]
    fn extract_sensordata_device_id_too_few_segments() {
        assert_eq!(extract_sensordata_device_id("device/sensordata"), None);
    }

    #[test]
    fn extract_sensordata_device_id_too_many_segments() {
        assert_eq!(
            extract_sensordata_device_id("device/sensordata/d1/extra"),
            None
        );
    }

    #[test]
    fn extract_registration_device_id_valid_topic() {
        assert_eq!(
            extract_registration_device_id("device/registration/d2"),
            Some("d2")
        );
    }

    #[test]
    fn extract_registration_device_id_wrong_suffix() {
        assert_eq!(extract_registration_device_id("device/sensordata/d2"), None);
    }

    #[test]
    fn extract_device_id_empty_string() {
        assert_eq!(extract_sensordata_device_id(""), None);
        assert_eq!(extract_registration_device_id(""), None);
    }
}
