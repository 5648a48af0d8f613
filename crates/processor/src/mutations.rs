//! Admin mutation contract (§6, §9). The three operations the admin UI
//! drives against the processor's store: acknowledge an alert, resolve an
//! alert, patch a device. Modeled as a dispatch table — "each handler a
//! pure function over `(authed_principal, request_body) -> result | error`"
//! — rather than the switch-case the spec explicitly calls out for
//! replacement.

use serde::{Deserialize, Serialize};
use wq_common::error::ProcessError;
use wq_common::models::{Alert, DeviceStatus};
use wq_common::sqlite_store::Store;

/// An authenticated admin caller. Authentication/authorization itself is
/// out of scope (§1 Non-goals); the processor only consumes this already-
/// authenticated identity.
#[derive(Debug, Clone)]
pub struct AdminPrincipal {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct AcknowledgeAlertRequest {
    pub alert_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ResolveAlertRequest {
    pub alert_id: String,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateDeviceRequest {
    pub device_id: String,
    pub name: Option<String>,
    pub building: Option<String>,
    pub floor: Option<String>,
    pub notes: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MutationResponse {
    pub ok: bool,
    pub alert_id: Option<String>,
    pub device_id: Option<String>,
    pub new_status: Option<String>,
}

impl MutationResponse {
    fn for_alert(alert: &Alert) -> Self {
        Self {
            ok: true,
            alert_id: Some(alert.alert_id.clone()),
            device_id: Some(alert.device_id.clone()),
            new_status: Some(alert.status.as_str().to_string()),
        }
    }
}

pub async fn acknowledge_alert(
    store: &Store,
    admin: &AdminPrincipal,
    req: AcknowledgeAlertRequest,
) -> Result<MutationResponse, ProcessError> {
    let alert = store
        .acknowledge_alert(&req.alert_id, &admin.user_id)
        .await
        .map_err(ProcessError::TransientStoreError)?
        .ok_or_else(|| ProcessError::InvalidPayload(format!("no such alert: {}", req.alert_id)))?;
    Ok(MutationResponse::for_alert(&alert))
}

pub async fn resolve_alert(
    store: &Store,
    admin: &AdminPrincipal,
    req: ResolveAlertRequest,
) -> Result<MutationResponse, ProcessError> {
    let alert = store
        .resolve_alert(&req.alert_id, &admin.user_id, req.notes.as_deref())
        .await
        .map_err(ProcessError::TransientStoreError)?
        .ok_or_else(|| ProcessError::InvalidPayload(format!("no such alert: {}", req.alert_id)))?;
    Ok(MutationResponse::for_alert(&alert))
}

pub async fn update_device(
    store: &Store,
    _admin: &AdminPrincipal,
    req: UpdateDeviceRequest,
) -> Result<MutationResponse, ProcessError> {
    let mut device = store
        .get_device(&req.device_id)
        .await
        .map_err(ProcessError::TransientStoreError)?
        .ok_or_else(|| ProcessError::InvalidPayload(format!("no such device: {}", req.device_id)))?;

    if let Some(name) = req.name {
        device.name = name;
    }
    if let Some(status) = &req.status {
        device.status = DeviceStatus::parse(status)
            .ok_or_else(|| ProcessError::InvalidPayload(format!("unknown status: {status}")))?;
    }
    if req.building.is_some() || req.floor.is_some() || req.notes.is_some() {
        let mut loc = device.location.clone().unwrap_or(wq_common::models::Location {
            building: String::new(),
            floor: String::new(),
            notes: None,
        });
        if let Some(building) = req.building {
            loc.building = building;
        }
        if let Some(floor) = req.floor {
            loc.floor = floor;
        }
        if req.notes.is_some() {
            loc.notes = req.notes;
        }
        device.location = Some(loc);
    }

    store
        .upsert_device(&device)
        .await
        .map_err(ProcessError::TransientStoreError)?;

    Ok(MutationResponse {
        ok: true,
        alert_id: None,
        device_id: Some(device.device_id),
        new_status: Some(device.status.as_str().to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wq_common::models::{AlertKind, Device, DeviceStatus as Status, Location, Parameter, Severity};
    use time::OffsetDateTime;

    async fn test_store() -> Store {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    fn admin() -> AdminPrincipal {
        AdminPrincipal { user_id: "admin@example.com".to_string() }
    }

    async fn seed_device(store: &Store, id: &str) {
        store
            .upsert_device(&Device {
                device_id: id.to_string(),
                name: "Probe A".to_string(),
                r#type: "multi-param".to_string(),
                firmware_version: None,
                mac: None,
                ip: None,
                sensor_kinds: [Parameter::Ph].into_iter().collect(),
                status: Status::Online,
                registered_at: OffsetDateTime::now_utc(),
                last_seen: None,
                location: Some(Location { building: "A".into(), floor: "1".into(), notes: None }),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn acknowledge_alert_updates_status() {
        let store = test_store().await;
        seed_device(&store, "d1").await;
        let alert = store
            .try_create_alert("d1", Parameter::Ph, AlertKind::Threshold, Severity::Critical, 9.5, Some(9.0), None, "m", "a")
            .await
            .unwrap()
            .unwrap();

        let resp = acknowledge_alert(&store, &admin(), AcknowledgeAlertRequest { alert_id: alert.alert_id })
            .await
            .unwrap();
        assert_eq!(resp.new_status.as_deref(), Some("acknowledged"));
    }

    #[tokio::test]
    async fn acknowledge_unknown_alert_errors() {
        let store = test_store().await;
        let err = acknowledge_alert(&store, &admin(), AcknowledgeAlertRequest { alert_id: "nope".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn resolve_alert_with_notes() {
        let store = test_store().await;
        seed_device(&store, "d1").await;
        let alert = store
            .try_create_alert("d1", Parameter::Ph, AlertKind::Threshold, Severity::Critical, 9.5, Some(9.0), None, "m", "a")
            .await
            .unwrap()
            .unwrap();

        let resp = resolve_alert(
            &store,
            &admin(),
            ResolveAlertRequest { alert_id: alert.alert_id, notes: Some("fixed dosing pump".into()) },
        )
        .await
        .unwrap();
        assert_eq!(resp.new_status.as_deref(), Some("resolved"));
    }

    #[tokio::test]
    async fn update_device_assigns_location() {
        let store = test_store().await;
        store
            .upsert_device(&Device {
                device_id: "d2".to_string(),
                name: "Probe B".to_string(),
                r#type: "multi-param".to_string(),
                firmware_version: None,
                mac: None,
                ip: None,
                sensor_kinds: [Parameter::Ph].into_iter().collect(),
                status: Status::Offline,
                registered_at: OffsetDateTime::now_utc(),
                last_seen: None,
                location: None,
            })
            .await
            .unwrap();

        update_device(
            &store,
            &admin(),
            UpdateDeviceRequest {
                device_id: "d2".to_string(),
                name: None,
                building: Some("Building B".into()),
                floor: Some("3F".into()),
                notes: None,
                status: None,
            },
        )
        .await
        .unwrap();

        let device = store.get_device("d2").await.unwrap().unwrap();
        assert!(device.is_registered_for_data());
    }

    #[tokio::test]
    async fn update_device_unknown_device_errors() {
        let store = test_store().await;
        let err = update_device(
            &store,
            &admin(),
            UpdateDeviceRequest {
                device_id: "ghost".to_string(),
                name: None,
                building: None,
                floor: None,
                notes: None,
                status: None,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProcessError::InvalidPayload(_)));
    }
}
