//! Bridge entry point (C6): subscribes to the edge MQTT broker, buffers and
//! batch-publishes into the message queue behind `cb_publish`, and serves
//! `/health` + `/metrics`. Grounded in `hub::main.rs` (env config, MQTT setup
//! with LWT, resubscribe-on-ConnAck, critical-task-monitoring `tokio::select!`
//! loop, signal handling).

mod buffer;
mod mqtt;
mod resource;
mod state;
mod web;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use buffer::{chunk_batches, Buffers, ADAPTIVE_FLUSH_RATIO, BUFFER_MAX};
use mqtt::{extract_registration_device_id, extract_sensordata_device_id};
use resource::{ResourceMonitor, MEM_EMERGENCY_PCT, MEM_RECOVER_PCT};
use state::{BridgeState, Lifecycle, SharedState};
use wq_common::circuit_breaker::{CallError, CircuitBreaker, CircuitBreakerConfig};
use wq_common::mq::{Message, Queue};

const FLUSH_INTERVAL_SEC: u64 = 5;
const RESOURCE_SAMPLE_INTERVAL_SEC: u64 = 1;
const DRAIN_DEADLINE_SEC: u64 = 10;
const PUBLISH_MAX_RETRIES: u32 = 3;

const TOPIC_SENSORDATA: &str = "sensor_readings";
const TOPIC_REGISTRATION: &str = "device_registration";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);

    let shared: SharedState = Arc::new(RwLock::new(BridgeState::new()));
    let buffers = Arc::new(Buffers::new());
    let queue = Arc::new(Queue::new());
    let cb_publish = CircuitBreaker::new("cb_publish", CircuitBreakerConfig::default());
    let rejecting = Arc::new(AtomicBool::new(false));

    // ── Web server ───────────────────────────────────────────────────
    let web_state = Arc::clone(&shared);
    let mut web_handle = tokio::spawn(async move {
        web::serve(web_state).await;
    });

    // ── Resource monitor ─────────────────────────────────────────────
    let mut resource_handle = {
        let res_shared = Arc::clone(&shared);
        let res_buffers = Arc::clone(&buffers);
        let res_queue = Arc::clone(&queue);
        let res_cb = cb_publish.clone();
        let res_rejecting = Arc::clone(&rejecting);
        tokio::spawn(async move {
            let mut monitor = ResourceMonitor::new();
            let mut ticker = tokio::time::interval(Duration::from_secs(RESOURCE_SAMPLE_INTERVAL_SEC));
            let mut buffer_overflow_since: Option<tokio::time::Instant> = None;

            loop {
                ticker.tick().await;
                let sample = monitor.sample();
                let depths = res_buffers.depths().await;
                let any_overflow = depths.values().any(|d| *d > BUFFER_MAX);

                buffer_overflow_since = match (any_overflow, buffer_overflow_since) {
                    (true, None) => Some(tokio::time::Instant::now()),
                    (true, since) => since,
                    (false, _) => None,
                };
                let overflow_sustained = buffer_overflow_since
                    .is_some_and(|since| since.elapsed() > Duration::from_secs(10));

                let circuit_open = res_cb.state().await == wq_common::circuit_breaker::CircuitState::Open;

                {
                    let mut st = res_shared.write().await;
                    st.record_resources(0, sample.mem_used_pct, sample.cpu_pct);
                    st.record_buffer_depths(depths);
                    st.set_circuit_breaker_open(circuit_open);

                    let resource_critical = sample.level() == resource::ResourceLevel::Critical;
                    let resource_warning = sample.level() == resource::ResourceLevel::Warning;
                    if resource_critical || overflow_sustained {
                        st.transition(Lifecycle::Unhealthy);
                    } else if resource_warning || circuit_open {
                        st.transition(Lifecycle::Degraded);
                    } else if st.lifecycle == Lifecycle::Degraded || st.lifecycle == Lifecycle::Unhealthy {
                        st.transition(Lifecycle::Running);
                    }
                }

                if sample.mem_used_pct >= MEM_EMERGENCY_PCT && !res_rejecting.load(Ordering::SeqCst) {
                    res_rejecting.store(true, Ordering::SeqCst);
                    warn!(mem_used_pct = sample.mem_used_pct, "emergency flush: memory critical");
                    for topic in res_buffers.topic_names().await {
                        flush_topic(&topic, &res_buffers, &res_queue, &res_cb, &res_shared).await;
                    }
                } else if res_rejecting.load(Ordering::SeqCst) && sample.mem_used_pct <= MEM_RECOVER_PCT {
                    res_rejecting.store(false, Ordering::SeqCst);
                    info!("memory recovered below reject threshold, resuming accepts");
                }
            }
        })
    };

    // ── Periodic + adaptive flush ────────────────────────────────────
    let mut flush_handle = {
        let flush_buffers = Arc::clone(&buffers);
        let flush_queue = Arc::clone(&queue);
        let flush_cb = cb_publish.clone();
        let flush_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(FLUSH_INTERVAL_SEC));
            loop {
                ticker.tick().await;
                for topic in flush_buffers.topic_names().await {
                    flush_topic(&topic, &flush_buffers, &flush_queue, &flush_cb, &flush_shared).await;
                }
            }
        })
    };

    // ── MQTT ─────────────────────────────────────────────────────────
    let client_id = "wq-bridge";
    let mut mqttoptions = MqttOptions::new(client_id, &broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    mqttoptions.set_clean_session(false);
    mqttoptions.set_last_will(LastWill::new(
        "status/bridge",
        b"offline".to_vec(),
        QoS::AtLeastOnce,
        true,
    ));

    if let (Ok(user), Ok(pass)) = (env::var("MQTT_USER"), env::var("MQTT_PASS")) {
        mqttoptions.set_credentials(user, pass);
        info!("mqtt: using password authentication");
    } else {
        warn!("MQTT_USER / MQTT_PASS not set — connecting without authentication");
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 50);
    {
        let mut st = shared.write().await;
        st.transition(Lifecycle::Connecting);
    }

    // ── Signal handling ──────────────────────────────────────────────
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let exit_reason: &str;

    loop {
        tokio::select! {
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        let topic = p.topic.clone();
                        let payload = p.payload.to_vec();

                        let (dest_topic, device_id) = if let Some(id) = extract_sensordata_device_id(&topic) {
                            (TOPIC_SENSORDATA, id.to_string())
                        } else if let Some(id) = extract_registration_device_id(&topic) {
                            (TOPIC_REGISTRATION, id.to_string())
                        } else {
                            warn!(topic = %topic, "unhandled topic");
                            continue;
                        };

                        {
                            let mut st = shared.write().await;
                            st.record_received();
                        }

                        if rejecting.load(Ordering::SeqCst) {
                            let mut st = shared.write().await;
                            st.record_dropped(1, "memory emergency, rejecting new reads");
                            continue;
                        }

                        let msg = Message {
                            device_id,
                            ts_received: time::OffsetDateTime::now_utc(),
                            source: "bridge".to_string(),
                            payload,
                        };

                        let (depth, adaptive) = buffers.push(dest_topic, msg).await;
                        if adaptive {
                            info!(
                                topic = dest_topic,
                                depth,
                                threshold_ratio = ADAPTIVE_FLUSH_RATIO,
                                "adaptive flush threshold reached"
                            );
                            flush_topic(dest_topic, &buffers, &queue, &cb_publish, &shared).await;
                        }
                    }

                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt connected");
                        if let Err(e) = client.subscribe("device/sensordata/+", QoS::AtMostOnce).await {
                            error!("re-subscribe device/sensordata/+ failed: {e}");
                        }
                        if let Err(e) = client.subscribe("device/registration/+", QoS::AtLeastOnce).await {
                            error!("re-subscribe device/registration/+ failed: {e}");
                        }
                        let _ = client
                            .publish("status/bridge", QoS::AtLeastOnce, true, b"online".to_vec())
                            .await;

                        let mut st = shared.write().await;
                        st.mqtt_connected = true;
                        st.transition(Lifecycle::Subscribed);
                        st.transition(Lifecycle::Running);
                        st.record_system("mqtt connected, subscriptions active".to_string());
                    }

                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("mqtt disconnected");
                        let mut st = shared.write().await;
                        st.mqtt_connected = false;
                        st.transition(Lifecycle::Degraded);
                        st.record_system("mqtt disconnected".to_string());
                    }

                    Ok(_) => {}

                    Err(e) => {
                        warn!("mqtt error: {e}");
                        let mut st = shared.write().await;
                        st.mqtt_connected = false;
                        st.transition(Lifecycle::Degraded);
                        st.record_error(format!("mqtt error: {e}"));
                        drop(st);
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }

            result = &mut web_handle => {
                error!("web server task exited unexpectedly: {result:?}");
            }

            result = &mut resource_handle => {
                error!("CRITICAL: resource monitor task exited unexpectedly: {result:?}");
                exit_reason = "resource monitor task died";
                break;
            }

            result = &mut flush_handle => {
                error!("CRITICAL: flush task exited unexpectedly: {result:?}");
                exit_reason = "flush task died";
                break;
            }

            _ = &mut ctrl_c => {
                exit_reason = "SIGINT";
                break;
            }

            _ = sigterm.recv() => {
                exit_reason = "SIGTERM";
                break;
            }
        }
    }

    // ── Graceful shutdown: final synchronous drain, 10s deadline ─────
    warn!(signal = exit_reason, "shutting down — draining buffers");
    {
        let mut st = shared.write().await;
        st.transition(Lifecycle::Draining);
    }

    let drain = async {
        for topic in buffers.topic_names().await {
            flush_topic(&topic, &buffers, &queue, &cb_publish, &shared).await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(DRAIN_DEADLINE_SEC), drain)
        .await
        .is_err()
    {
        error!("final drain exceeded {DRAIN_DEADLINE_SEC}s deadline — remaining buffered messages dropped");
    }

    {
        let mut st = shared.write().await;
        st.transition(Lifecycle::Stopped);
    }

    let _ = client
        .publish("status/bridge", QoS::AtLeastOnce, true, b"offline".to_vec())
        .await;

    info!("shutdown complete");
    Ok(())
}

/// Drains `topic`'s buffer, splits it into batches respecting the
/// msg/byte/latency limits, and publishes each batch through `cb_publish`
/// with bounded exponential backoff. Exhausted retries discard the batch
/// after logging (§4.2) — the MQ publish is not itself redelivered, unlike
/// the processor's nack path.
async fn flush_topic(
    topic: &str,
    buffers: &Buffers,
    queue: &Queue,
    cb: &CircuitBreaker,
    shared: &SharedState,
) {
    let drained = buffers.drain_topic(topic).await;
    if drained.is_empty() {
        return;
    }

    for batch in chunk_batches(drained) {
        let batch_len = batch.len() as u64;
        let mut attempt = 0;
        loop {
            let result = cb
                .call(|| async { queue.publish_batch(topic, batch.clone()).await })
                .await;

            match result {
                Ok(()) => {
                    let mut st = shared.write().await;
                    st.record_published(batch_len);
                    st.record_flush();
                    break;
                }
                Err(CallError::Open) => {
                    let mut st = shared.write().await;
                    st.record_publish_failure(format!("{topic}: circuit open, batch discarded"));
                    break;
                }
                Err(e) if attempt < PUBLISH_MAX_RETRIES => {
                    attempt += 1;
                    warn!(topic, attempt, "publish failed, retrying: {e}");
                    tokio::time::sleep(Duration::from_millis(100 * 2u64.pow(attempt))).await;
                }
                Err(e) => {
                    let mut st = shared.write().await;
                    st.record_publish_failure(format!("{topic}: publish exhausted retries: {e}"));
                    break;
                }
            }
        }
    }
}
