//! Admin mutation HTTP surface (§6, §9). Thin axum wrapper around
//! `mutations.rs`; the handlers do nothing but auth, decode, delegate,
//! encode — mirroring how thin `hub::web.rs` keeps its own routes over
//! `Db`. Authentication is a bearer token checked against `ADMIN_TOKEN`;
//! real admin identity/authorization is out of scope (§1 Non-goals), so
//! this is only enough to satisfy "never reach storage" for `AuthFailure`.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::post;
use axum::Router;
use std::env;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

use wq_common::error::ProcessError;
use wq_common::sqlite_store::Store;

use crate::mutations::{
    acknowledge_alert, resolve_alert, update_device, AcknowledgeAlertRequest, AdminPrincipal,
    MutationResponse, ResolveAlertRequest, UpdateDeviceRequest,
};

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub admin_token: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/mutations/acknowledge_alert", post(acknowledge_alert_handler))
        .route("/mutations/resolve_alert", post(resolve_alert_handler))
        .route("/mutations/update_device", post(update_device_handler))
        .with_state(state)
}

fn authenticate(headers: &HeaderMap, expected_token: &str) -> Result<AdminPrincipal, ProcessError> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ProcessError::AuthFailure)?;
    let token = header.strip_prefix("Bearer ").ok_or(ProcessError::AuthFailure)?;
    if token != expected_token {
        return Err(ProcessError::AuthFailure);
    }
    Ok(AdminPrincipal { user_id: "admin".to_string() })
}

fn error_response(err: ProcessError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match err {
        ProcessError::AuthFailure => StatusCode::UNAUTHORIZED,
        ProcessError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "ok": false, "error": err.to_string() })))
}

async fn acknowledge_alert_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<AcknowledgeAlertRequest>,
) -> impl IntoResponse {
    match authenticate(&headers, &state.admin_token) {
        Ok(admin) => match acknowledge_alert(&state.store, &admin, req).await {
            Ok(resp) => (StatusCode::OK, Json(response_json(&resp))),
            Err(e) => error_response(e),
        },
        Err(e) => error_response(e),
    }
}

async fn resolve_alert_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ResolveAlertRequest>,
) -> impl IntoResponse {
    match authenticate(&headers, &state.admin_token) {
        Ok(admin) => match resolve_alert(&state.store, &admin, req).await {
            Ok(resp) => (StatusCode::OK, Json(response_json(&resp))),
            Err(e) => error_response(e),
        },
        Err(e) => error_response(e),
    }
}

async fn update_device_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<UpdateDeviceRequest>,
) -> impl IntoResponse {
    match authenticate(&headers, &state.admin_token) {
        Ok(admin) => match update_device(&state.store, &admin, req).await {
            Ok(resp) => (StatusCode::OK, Json(response_json(&resp))),
            Err(e) => error_response(e),
        },
        Err(e) => error_response(e),
    }
}

fn response_json(resp: &MutationResponse) -> serde_json::Value {
    serde_json::to_value(resp).unwrap_or_else(|_| serde_json::json!({ "ok": true }))
}

pub async fn serve(store: Store, admin_token: String) {
    let port: u16 = env::var("ADMIN_WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8081);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind admin web port");

    info!(%addr, "processor admin web server listening");

    let state = AppState { store, admin_token };
    axum::serve(listener, router(state))
        .await
        .expect("admin web server error");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use wq_common::models::{AlertKind, Device, DeviceStatus, Location, Parameter, Severity};
    use time::OffsetDateTime;

    const TOKEN: &str = "test-admin-token";

    async fn test_state() -> AppState {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        store
            .upsert_device(&Device {
                device_id: "d1".to_string(),
                name: "Probe A".to_string(),
                r#type: "multi-param".to_string(),
                firmware_version: None,
                mac: None,
                ip: None,
                sensor_kinds: [Parameter::Ph].into_iter().collect(),
                status: DeviceStatus::Online,
                registered_at: OffsetDateTime::now_utc(),
                last_seen: None,
                location: Some(Location { building: "A".into(), floor: "1".into(), notes: None }),
            })
            .await
            .unwrap();
        AppState { store, admin_token: TOKEN.to_string() }
    }

    #[tokio::test]
    async fn acknowledge_without_token_is_unauthorized() {
        let app = router(test_state().await);
        let req = Request::builder()
            .method("POST")
            .uri("/mutations/acknowledge_alert")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"alert_id": "x"}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn acknowledge_with_wrong_token_is_unauthorized() {
        let app = router(test_state().await);
        let req = Request::builder()
            .method("POST")
            .uri("/mutations/acknowledge_alert")
            .header("content-type", "application/json")
            .header("authorization", "Bearer wrong-token")
            .body(Body::from(r#"{"alert_id": "x"}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn acknowledge_with_valid_token_succeeds() {
        let state = test_state().await;
        let alert = state
            .store
            .try_create_alert("d1", Parameter::Ph, AlertKind::Threshold, Severity::Critical, 9.5, Some(9.0), None, "m", "a")
            .await
            .unwrap()
            .unwrap();

        let app = router(state);
        let body = serde_json::json!({ "alert_id": alert.alert_id }).to_string();
        let req = Request::builder()
            .method("POST")
            .uri("/mutations/acknowledge_alert")
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {TOKEN}"))
            .body(Body::from(body))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["new_status"], "acknowledged");
    }

    #[tokio::test]
    async fn acknowledge_unknown_alert_returns_bad_request() {
        let state = test_state().await;
        let app = router(state);
        let req = Request::builder()
            .method("POST")
            .uri("/mutations/acknowledge_alert")
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {TOKEN}"))
            .body(Body::from(r#"{"alert_id": "ghost"}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
