//! Circuit breaker (C5) wrapping a downstream dependency. Two independent
//! instances are expected in this system: `cb_publish` (bridge -> MQ) and
//! `cb_email` (processor -> ED). See SPEC_FULL.md §4.1.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub timeout: Duration,
    pub error_rate_threshold: f64,
    pub reset_after: Duration,
    /// Minimum number of samples in the window before the error rate is
    /// evaluated, so a single early failure doesn't trip the breaker.
    pub min_samples: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            error_rate_threshold: 0.5,
            reset_after: Duration::from_secs(30),
            min_samples: 5,
        }
    }
}

#[derive(Debug)]
struct Window {
    total: u32,
    failures: u32,
}

impl Window {
    fn new() -> Self {
        Self { total: 0, failures: 0 }
    }

    fn record(&mut self, ok: bool) {
        self.total += 1;
        if !ok {
            self.failures += 1;
        }
    }

    fn error_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.failures as f64 / self.total as f64
        }
    }
}

struct Inner {
    state: CircuitState,
    window: Window,
    opened_at: Option<Instant>,
}

/// Thread-safe circuit breaker. Clone is cheap (shares the inner mutex).
#[derive(Clone)]
pub struct CircuitBreaker {
    name: &'static str,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, thiserror::Error)]
pub enum CallError<E> {
    #[error("circuit open")]
    Open,
    #[error("call timed out")]
    Timeout,
    #[error(transparent)]
    Inner(E),
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            config,
            inner: Arc::new(Mutex::new(Inner {
                state: CircuitState::Closed,
                window: Window::new(),
                opened_at: None,
            })),
        }
    }

    pub async fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().await;
        self.maybe_half_open(&mut inner);
        inner.state
    }

    fn maybe_half_open(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.config.reset_after {
                    inner.state = CircuitState::HalfOpen;
                    info!(breaker = self.name, "circuit half-open, admitting probe");
                }
            }
        }
    }

    /// Execute `f` under the breaker. On `CallError::Open`, `f` is never
    /// invoked. A single in-flight probe is allowed while HalfOpen; callers
    /// racing for that probe slot will also just run `f` (no separate
    /// admission queue) since probe volume in this system is low.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        {
            let mut inner = self.inner.lock().await;
            self.maybe_half_open(&mut inner);
            if inner.state == CircuitState::Open {
                return Err(CallError::Open);
            }
        }

        let result = tokio::time::timeout(self.config.timeout, f()).await;

        let mut inner = self.inner.lock().await;
        match result {
            Ok(Ok(value)) => {
                self.on_result(&mut inner, true);
                Ok(value)
            }
            Ok(Err(e)) => {
                self.on_result(&mut inner, false);
                Err(CallError::Inner(e))
            }
            Err(_) => {
                self.on_result(&mut inner, false);
                Err(CallError::Timeout)
            }
        }
    }

    fn on_result(&self, inner: &mut Inner, ok: bool) {
        match inner.state {
            CircuitState::HalfOpen => {
                if ok {
                    inner.state = CircuitState::Closed;
                    inner.window = Window::new();
                    info!(breaker = self.name, "circuit closed after successful probe");
                } else {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(breaker = self.name, "probe failed, circuit re-opened");
                }
            }
            CircuitState::Closed => {
                inner.window.record(ok);
                if inner.window.total >= self.config.min_samples
                    && inner.window.error_rate() >= self.config.error_rate_threshold
                {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        breaker = self.name,
                        error_rate = inner.window.error_rate(),
                        "error rate threshold exceeded, circuit opened"
                    );
                }
            }
            CircuitState::Open => {
                // A late result arriving after the breaker already flipped
                // back open; nothing to do.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            timeout: Duration::from_millis(50),
            error_rate_threshold: 0.5,
            reset_after: Duration::from_millis(50),
            min_samples: 2,
        }
    }

    #[tokio::test]
    async fn opens_after_error_rate_exceeded() {
        let cb = CircuitBreaker::new("test", fast_config());
        for _ in 0..2 {
            let _ = cb
                .call(|| async { Err::<(), &str>("boom") })
                .await;
        }
        assert_eq!(cb.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn stays_closed_under_threshold() {
        let cb = CircuitBreaker::new("test", fast_config());
        let _ = cb.call(|| async { Err::<(), &str>("boom") }).await;
        let _ = cb.call(|| async { Ok::<(), &str>(()) }).await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_opens_after_reset_and_closes_on_success() {
        let cb = CircuitBreaker::new("test", fast_config());
        for _ in 0..2 {
            let _ = cb.call(|| async { Err::<(), &str>("boom") }).await;
        }
        assert_eq!(cb.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cb.state().await, CircuitState::HalfOpen);

        let r = cb.call(|| async { Ok::<(), &str>(()) }).await;
        assert!(r.is_ok());
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn open_rejects_without_calling_f() {
        let cb = CircuitBreaker::new("test", fast_config());
        for _ in 0..2 {
            let _ = cb.call(|| async { Err::<(), &str>("boom") }).await;
        }
        let called = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let called2 = called.clone();
        let r = cb
            .call(move || {
                called2.store(true, std::sync::atomic::Ordering::SeqCst);
                async { Ok::<(), &str>(()) }
            })
            .await;
        assert!(matches!(r, Err(CallError::Open)));
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let cb = CircuitBreaker::new("test", fast_config());
        for _ in 0..2 {
            let r = cb
                .call(|| async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<(), &str>(())
                })
                .await;
            assert!(matches!(r, Err(CallError::Timeout)));
        }
        assert_eq!(cb.state().await, CircuitState::Open);
    }
}
