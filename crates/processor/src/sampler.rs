//! Reading/history sampler (C11): the latest-value write happens for every
//! reading, but the history append only happens every `N_HISTORY`th one.
//! Grounded in `hub::scheduler.rs`'s habit of keeping small per-entity
//! counters in a `HashMap` guarded by a single mutex rather than reaching
//! for a concurrent map crate not already in the teacher's dependency tree.

use std::collections::HashMap;
use tokio::sync::Mutex;

pub const N_HISTORY: u64 = 5;

/// `ReadingCounter`: per-device monotonic counter, reset on process
/// restart. Losing counter state only shifts the sampling phase by a few
/// readings, which §3 accepts explicitly.
pub struct ReadingSampler {
    counters: Mutex<HashMap<String, u64>>,
}

impl ReadingSampler {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Increments the device's counter and reports whether this reading
    /// should also be appended to history (§4.3 step 2). At-most-one
    /// history write per reading falls out of this being the only call
    /// site that increments the counter.
    pub async fn increment_and_should_sample(&self, device_id: &str) -> bool {
        let mut counters = self.counters.lock().await;
        let counter = counters.entry(device_id.to_string()).or_insert(0);
        *counter += 1;
        *counter % N_HISTORY == 0
    }
}

impl Default for ReadingSampler {
    fn default() -> Self {
        Self::new()
    }
}
