//! Bridge lifecycle state machine and in-memory counters for `/health` and
//! `/metrics` (SPEC_FULL.md §4.2, §6). Grounded in `hub::state.rs`'s
//! `SharedState`/`SystemState` + capped event ring buffer, generalized from
//! irrigation-specific fields to connection lifecycle + queue counters.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::RwLock;

const MAX_EVENTS: usize = 200;

pub type SharedState = Arc<RwLock<BridgeState>>;

/// Bridge connection/processing lifecycle. Transitions are driven by the
/// MQTT event loop, the resource monitor, and the shutdown signal handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Init,
    Connecting,
    Subscribed,
    Running,
    Degraded,
    Unhealthy,
    Draining,
    Stopped,
}

impl Lifecycle {
    /// `/health` returns 503 only once the bridge can no longer make
    /// progress: Unhealthy, Draining (shutting down), or Stopped.
    pub fn is_healthy(&self) -> bool {
        !matches!(self, Lifecycle::Unhealthy | Lifecycle::Draining | Lifecycle::Stopped)
    }

    /// The `{healthy|degraded|unhealthy}` string the health contract names.
    pub fn status_str(&self) -> &'static str {
        match self {
            Lifecycle::Degraded => "degraded",
            Lifecycle::Unhealthy | Lifecycle::Draining | Lifecycle::Stopped => "unhealthy",
            Lifecycle::Init | Lifecycle::Connecting | Lifecycle::Subscribed | Lifecycle::Running => {
                "healthy"
            }
        }
    }
}

#[derive(Clone, Serialize)]
pub struct BridgeEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Lifecycle,
    Resource,
    Error,
    System,
}

pub struct BridgeState {
    pub started_at: Instant,
    pub lifecycle: Lifecycle,
    pub mqtt_connected: bool,
    pub messages_received: u64,
    pub messages_published: u64,
    pub messages_dropped: u64,
    pub publish_failures: u64,
    pub flushes_total: u64,
    pub circuit_breaker_open: bool,
    pub buffer_depths: HashMap<String, usize>,
    pub mem_rss_bytes: u64,
    pub mem_used_pct: f64,
    pub cpu_pct: f32,
    pub cpu_peak_pct: f32,
    cpu_sum_pct: f64,
    cpu_sample_count: u64,
    pub events: VecDeque<BridgeEvent>,
}

impl BridgeState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            lifecycle: Lifecycle::Init,
            mqtt_connected: false,
            messages_received: 0,
            messages_published: 0,
            messages_dropped: 0,
            publish_failures: 0,
            flushes_total: 0,
            circuit_breaker_open: false,
            buffer_depths: HashMap::new(),
            mem_rss_bytes: 0,
            mem_used_pct: 0.0,
            cpu_pct: 0.0,
            cpu_peak_pct: 0.0,
            cpu_sum_pct: 0.0,
            cpu_sample_count: 0,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn cpu_avg_pct(&self) -> f32 {
        if self.cpu_sample_count == 0 {
            0.0
        } else {
            (self.cpu_sum_pct / self.cpu_sample_count as f64) as f32
        }
    }

    pub fn transition(&mut self, to: Lifecycle) {
        if self.lifecycle == to {
            return;
        }
        let from = self.lifecycle;
        self.lifecycle = to;
        self.push_event(EventKind::Lifecycle, format!("{from:?} -> {to:?}"));
    }

    pub fn record_received(&mut self) {
        self.messages_received += 1;
    }

    pub fn record_published(&mut self, count: u64) {
        self.messages_published += count;
    }

    pub fn record_dropped(&mut self, count: u64, reason: &str) {
        self.messages_dropped += count;
        self.push_event(EventKind::Error, format!("dropped {count} messages: {reason}"));
    }

    pub fn record_publish_failure(&mut self, detail: String) {
        self.publish_failures += 1;
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_resources(&mut self, mem_rss_bytes: u64, mem_used_pct: f64, cpu_pct: f32) {
        self.mem_rss_bytes = mem_rss_bytes;
        self.mem_used_pct = mem_used_pct;
        self.cpu_pct = cpu_pct;
        self.cpu_peak_pct = self.cpu_peak_pct.max(cpu_pct);
        self.cpu_sum_pct += cpu_pct as f64;
        self.cpu_sample_count += 1;
    }

    pub fn record_buffer_depths(&mut self, depths: HashMap<String, usize>) {
        self.buffer_depths = depths;
    }

    pub fn record_flush(&mut self) {
        self.flushes_total += 1;
    }

    pub fn set_circuit_breaker_open(&mut self, open: bool) {
        self.circuit_breaker_open = open;
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(BridgeEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for BridgeState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
pub struct MemoryHealth {
    pub rss: u64,
    pub heap_used: u64,
    pub utilization: f64,
}

#[derive(Serialize)]
pub struct CpuHealth {
    pub current: f32,
    pub average: f32,
    pub peak: f32,
}

#[derive(Serialize)]
pub struct HealthMetrics {
    pub received: u64,
    pub published: u64,
    pub failed: u64,
    pub flushes: u64,
    pub circuit_breaker_open: bool,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub uptime_secs: u64,
    pub lifecycle: Lifecycle,
    pub mqtt_connected: bool,
    pub memory: MemoryHealth,
    pub cpu: CpuHealth,
    pub buffers: HashMap<String, usize>,
    pub metrics: HealthMetrics,
}

impl BridgeState {
    pub fn to_health(&self) -> HealthResponse {
        HealthResponse {
            status: self.lifecycle.status_str(),
            timestamp: OffsetDateTime::now_utc(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            lifecycle: self.lifecycle,
            mqtt_connected: self.mqtt_connected,
            memory: MemoryHealth {
                rss: self.mem_rss_bytes,
                // sysinfo reports process-level RSS only; a heap-vs-rss
                // split isn't available without a custom allocator hook,
                // so heap_used mirrors rss.
                heap_used: self.mem_rss_bytes,
                utilization: self.mem_used_pct,
            },
            cpu: CpuHealth {
                current: self.cpu_pct,
                average: self.cpu_avg_pct(),
                peak: self.cpu_peak_pct,
            },
            buffers: self.buffer_depths.clone(),
            metrics: HealthMetrics {
                received: self.messages_received,
                published: self.messages_published,
                failed: self.publish_failures,
                flushes: self.flushes_total,
                circuit_breaker_open: self.circuit_breaker_open,
            },
        }
    }
}
