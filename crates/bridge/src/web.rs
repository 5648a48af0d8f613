//! `/health` and `/metrics` endpoints (SPEC_FULL.md §6). Structure mirrors
//! `hub::web.rs` (AppState + Router + axum::serve), pared to the two routes
//! this spec actually calls for.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use std::env;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

use crate::state::SharedState;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    let body = st.to_health();
    let status = if body.status == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(body))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    let mut out = String::new();

    out.push_str("# TYPE mqtt_messages_received_total counter\n");
    out.push_str(&format!(
        "mqtt_messages_received_total {}\n",
        st.messages_received
    ));
    out.push_str("# TYPE mqtt_messages_published_total counter\n");
    out.push_str(&format!(
        "mqtt_messages_published_total {}\n",
        st.messages_published
    ));
    out.push_str("# TYPE mqtt_messages_failed_total counter\n");
    out.push_str(&format!(
        "mqtt_messages_failed_total {}\n",
        st.publish_failures
    ));
    out.push_str("# TYPE mqtt_buffer_flushes_total counter\n");
    out.push_str(&format!("mqtt_buffer_flushes_total {}\n", st.flushes_total));
    out.push_str("# TYPE mqtt_memory_rss_bytes gauge\n");
    out.push_str(&format!("mqtt_memory_rss_bytes {}\n", st.mem_rss_bytes));
    out.push_str("# TYPE mqtt_memory_heap_used_bytes gauge\n");
    out.push_str(&format!("mqtt_memory_heap_used_bytes {}\n", st.mem_rss_bytes));
    out.push_str("# TYPE mqtt_cpu_usage_percent gauge\n");
    out.push_str(&format!("mqtt_cpu_usage_percent {}\n", st.cpu_pct));
    out.push_str("# TYPE mqtt_circuit_breaker_open gauge\n");
    out.push_str(&format!(
        "mqtt_circuit_breaker_open {}\n",
        if st.circuit_breaker_open { 1 } else { 0 }
    ));

    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], out)
}

pub async fn serve(shared: SharedState) {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind web port");

    info!(%addr, "bridge web server listening");

    let state = AppState { shared };
    axum::serve(listener, router(state))
        .await
        .expect("web server error");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{BridgeState, Lifecycle};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tokio::sync::RwLock;
    use tower::ServiceExt;

    fn test_state(lifecycle: Lifecycle) -> AppState {
        let mut st = BridgeState::new();
        st.transition(lifecycle);
        st.mqtt_connected = true;
        AppState {
            shared: Arc::new(RwLock::new(st)),
        }
    }

    #[tokio::test]
    async fn health_returns_200_when_running() {
        let app = router(test_state(Lifecycle::Running));
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_returns_503_when_unhealthy() {
        let app = router(test_state(Lifecycle::Unhealthy));
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn health_body_has_expected_fields() {
        let app = router(test_state(Lifecycle::Running));
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert!(json["uptime_secs"].is_u64());
        assert!(json["mqtt_connected"].is_boolean());
    }

    #[tokio::test]
    async fn metrics_returns_plaintext_counters() {
        let app = router(test_state(Lifecycle::Running));
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("mqtt_messages_received_total"));
        assert!(text.contains("mqtt_circuit_breaker_open 0"));
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let app = router(test_state(Lifecycle::Running));
        let req = Request::builder().uri("/nope").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
