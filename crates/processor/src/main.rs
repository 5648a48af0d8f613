//! Processor entry point (C7-C12): an N-way worker pool consuming the
//! sensor-reading and registration topics, running them through §4.3/§4.4,
//! plus the admin mutation HTTP surface (§6). Grounded in `bridge::main.rs`
//! (env config, `tokio::select!` critical-task monitoring, signal handling,
//! bounded final drain) generalized from a single MQTT loop to a worker
//! pool pulling from `wq_common::mq::Queue`.

mod config;
mod dedup_cache;
mod mutations;
mod notify;
mod processor;
mod sampler;
mod throttle;
mod validator;
mod web;

use anyhow::Result;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use wq_common::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use wq_common::email::{EmailDispatcher, EmailMessage};
use wq_common::error::ProcessError;
use wq_common::mq::Queue;
use wq_common::sqlite_store::Store;

use dedup_cache::DedupCache;
use processor::{handle_registration_message, handle_sensor_message, ProcessorContext};
use sampler::ReadingSampler;

const TOPIC_SENSORDATA: &str = "sensor_readings";
const TOPIC_REGISTRATION: &str = "device_registration";
const PROCESS_DEADLINE_SEC: u64 = 30;
const SHUTDOWN_GRACE_SEC: u64 = 10;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let db_url = env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:/var/lib/wq/processor.db".to_string());
    let worker_count: usize = env::var("WORKER_COUNT").ok().and_then(|s| s.parse().ok()).unwrap_or(4);
    let admin_token = env::var("ADMIN_TOKEN").unwrap_or_else(|_| {
        warn!("ADMIN_TOKEN not set — admin mutation surface will reject all callers");
        String::new()
    });

    let store = Store::connect(&db_url).await?;
    store.migrate().await?;

    if let Ok(config_path) = env::var("CONFIG_PATH") {
        let cfg = config::load(&config_path)?;
        config::apply(&cfg, &store).await?;
        info!(path = config_path, "static config applied");
    }

    let email = match (
        env::var("SMTP_HOST"),
        env::var("SMTP_USER"),
        env::var("SMTP_PASS"),
        env::var("SMTP_FROM"),
    ) {
        (Ok(host), Ok(user), Ok(pass), Ok(from)) => {
            Some(EmailDispatcher::new(&host, &user, &pass, &from)?)
        }
        _ => {
            warn!("SMTP_* env vars not fully set — notifications will be logged and dropped");
            None
        }
    };

    // This instance's own in-process queue. A production multi-process
    // deployment feeds this from the bridge's actual MQ client instead;
    // see DESIGN.md Open Question 5.
    let queue = Arc::new(Queue::new());

    let ctx = Arc::new(ProcessorContext {
        store: store.clone(),
        sampler: ReadingSampler::new(),
        dedup_cache: DedupCache::new(),
        cb_email: CircuitBreaker::new("cb_email", CircuitBreakerConfig::default()),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut worker_handles = Vec::with_capacity(worker_count + 1);
    for worker_id in 0..worker_count {
        let queue = Arc::clone(&queue);
        let ctx = Arc::clone(&ctx);
        let email = email.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        worker_handles.push(tokio::spawn(async move {
            sensor_worker_loop(worker_id, queue, ctx, email, &mut shutdown_rx).await;
        }));
    }

    {
        let queue = Arc::clone(&queue);
        let ctx = Arc::clone(&ctx);
        let mut shutdown_rx = shutdown_rx.clone();
        worker_handles.push(tokio::spawn(async move {
            registration_worker_loop(queue, ctx, &mut shutdown_rx).await;
        }));
    }

    let mut web_handle = {
        let store = store.clone();
        tokio::spawn(async move {
            web::serve(store, admin_token).await;
        })
    };

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let exit_reason = tokio::select! {
        result = &mut web_handle => {
            error!("CRITICAL: admin web server task exited unexpectedly: {result:?}");
            "web server task died"
        }
        _ = &mut ctrl_c => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    };

    warn!(signal = exit_reason, "shutting down — draining in-flight messages");
    let _ = shutdown_tx.send(true);

    let drain = async {
        for handle in worker_handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(SHUTDOWN_GRACE_SEC), drain)
        .await
        .is_err()
    {
        error!("worker shutdown exceeded {SHUTDOWN_GRACE_SEC}s grace period");
    }

    info!("shutdown complete");
    Ok(())
}

async fn sensor_worker_loop(
    worker_id: usize,
    queue: Arc<Queue>,
    ctx: Arc<ProcessorContext>,
    email: Option<EmailDispatcher>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        let delivery = tokio::select! {
            d = queue.consume(TOPIC_SENSORDATA) => d,
            _ = shutdown_rx.changed() => {
                info!(worker_id, "sensor worker shutting down");
                return;
            }
        };
        let Some(delivery) = delivery else {
            info!(worker_id, "sensor queue closed");
            return;
        };

        let device_id = delivery.message.device_id.clone();
        let body = delivery.message.payload.clone();
        let email = email.clone();

        let send_email = move |to: String| {
            let email = email.clone();
            async move {
                match &email {
                    Some(dispatcher) => {
                        dispatcher
                            .send(EmailMessage {
                                to,
                                subject: "Water quality alert".to_string(),
                                body: "A new water-quality alert was created. See the admin console for details.".to_string(),
                            })
                            .await
                    }
                    None => anyhow::bail!("no email dispatcher configured"),
                }
            }
        };

        let outcome = tokio::time::timeout(
            Duration::from_secs(PROCESS_DEADLINE_SEC),
            handle_sensor_message(&ctx, &device_id, &body, send_email),
        )
        .await;

        match outcome {
            Ok(Ok(())) => delivery.ack(),
            Ok(Err(e)) => {
                log_and_finish(&e, &device_id);
                if e.should_nack() {
                    delivery.nack();
                } else {
                    delivery.ack();
                }
            }
            Err(_) => {
                warn!(device_id, "processing deadline exceeded, requeueing");
                delivery.nack();
            }
        }
    }
}

async fn registration_worker_loop(queue: Arc<Queue>, ctx: Arc<ProcessorContext>, shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        let delivery = tokio::select! {
            d = queue.consume(TOPIC_REGISTRATION) => d,
            _ = shutdown_rx.changed() => {
                info!("registration worker shutting down");
                return;
            }
        };
        let Some(delivery) = delivery else {
            info!("registration queue closed");
            return;
        };

        let device_id = delivery.message.device_id.clone();
        let body = delivery.message.payload.clone();

        let outcome = tokio::time::timeout(
            Duration::from_secs(PROCESS_DEADLINE_SEC),
            handle_registration_message(&ctx, &body),
        )
        .await;

        match outcome {
            Ok(Ok(())) => delivery.ack(),
            Ok(Err(e)) => {
                log_and_finish(&e, &device_id);
                if e.should_nack() {
                    delivery.nack();
                } else {
                    delivery.ack();
                }
            }
            Err(_) => {
                warn!(device_id, "registration deadline exceeded, requeueing");
                delivery.nack();
            }
        }
    }
}

fn log_and_finish(err: &ProcessError, device_id: &str) {
    match err {
        ProcessError::UnregisteredDevice(_) | ProcessError::MissingLocation(_) => {
            tracing::debug!(device_id, "{err}");
        }
        ProcessError::InvalidPayload(_) => {
            tracing::warn!(device_id, "{err}");
        }
        _ => {
            tracing::error!(device_id, "{err}");
        }
    }
}
