//! Per-topic FIFO buffers with adaptive/emergency flush thresholds
//! (SPEC_FULL.md §4.2). The teacher has no direct analogue for a buffer —
//! this follows the teacher's `tokio::spawn` + `tokio::time::interval`
//! periodic-task idiom (`main.rs`'s watchdog/prune/backup tasks) for the
//! flush ticker, applied to a new data structure.

use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;
use wq_common::mq::Message;

pub const BUFFER_MAX: usize = 100;
pub const ADAPTIVE_FLUSH_RATIO: f64 = 0.70;
pub const BATCH_MAX_MSGS: usize = 100;
pub const BATCH_MAX_BYTES: usize = 1024 * 1024;

pub struct Buffers {
    topics: Mutex<HashMap<String, VecDeque<Message>>>,
}

impl Default for Buffers {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffers {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Pushes a message onto `topic`'s buffer. Returns `(depth,
    /// reached_adaptive_threshold)`. A full buffer drops the oldest entry
    /// to make room — the bridge's backpressure is deliberately lossy at
    /// the edge (§5); the drop is the caller's responsibility to count.
    pub async fn push(&self, topic: &str, msg: Message) -> (usize, bool) {
        let mut topics = self.topics.lock().await;
        let buf = topics.entry(topic.to_string()).or_default();
        if buf.len() >= BUFFER_MAX {
            buf.pop_front();
        }
        buf.push_back(msg);
        let depth = buf.len();
        let reached_adaptive = depth as f64 >= BUFFER_MAX as f64 * ADAPTIVE_FLUSH_RATIO;
        (depth, reached_adaptive)
    }

    pub async fn depths(&self) -> HashMap<String, usize> {
        let topics = self.topics.lock().await;
        topics.iter().map(|(k, v)| (k.clone(), v.len())).collect()
    }

    /// Drains every message currently buffered for `topic`.
    pub async fn drain_topic(&self, topic: &str) -> Vec<Message> {
        let mut topics = self.topics.lock().await;
        match topics.get_mut(topic) {
            Some(buf) => buf.drain(..).collect(),
            None => Vec::new(),
        }
    }

    /// Drains every buffered message across all topics, keyed by topic.
    /// Used for the emergency flush and the final shutdown drain.
    pub async fn drain_all(&self) -> HashMap<String, Vec<Message>> {
        let mut topics = self.topics.lock().await;
        topics
            .iter_mut()
            .map(|(k, v)| (k.clone(), v.drain(..).collect()))
            .collect()
    }

    pub async fn topic_names(&self) -> Vec<String> {
        let topics = self.topics.lock().await;
        topics.keys().cloned().collect()
    }
}

/// Splits a drained batch into sub-batches respecting `batch_max_msgs` and
/// `batch_max_bytes`.
pub fn chunk_batches(messages: Vec<Message>) -> Vec<Vec<Message>> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut current_bytes = 0usize;

    for msg in messages {
        let msg_bytes = msg.payload.len();
        let would_exceed_count = current.len() + 1 > BATCH_MAX_MSGS;
        let would_exceed_bytes = current_bytes + msg_bytes > BATCH_MAX_BYTES;

        if !current.is_empty() && (would_exceed_count || would_exceed_bytes) {
            batches.push(std::mem::take(&mut current));
            current_bytes = 0;
        }

        current_bytes += msg_bytes;
        current.push(msg);
    }

    if !current.is_empty() {
        batches.push(current);
    }

    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn msg(bytes: usize) -> Message {
        Message {
            device_id: "d1".to_string(),
            ts_received: OffsetDateTime::now_utc(),
            source: "bridge".to_string(),
            payload: vec![0u8; bytes],
        }
    }

    #[tokio::test]
    async fn push_reports_adaptive_threshold() {
        let buffers = Buffers::new();
        let mut reached = false;
        for _ in 0..70 {
            let (_, r) = buffers.push("t", msg(10)).await;
            reached = r;
        }
        assert!(reached);
    }

    #[tokio::test]
    async fn push_below_threshold_does_not_flag() {
        let buffers = Buffers::new();
        let (_, reached) = buffers.push("t", msg(10)).await;
        assert!(!reached);
    }

    #[tokio::test]
    async fn full_buffer_drops_oldest() {
        let buffers = Buffers::new();
        for i in 0..BUFFER_MAX + 5 {
            buffers
                .push(
                    "t",
                    Message {
                        device_id: format!("d{i}"),
                        ts_received: OffsetDateTime::now_utc(),
                        source: "bridge".into(),
                        payload: vec![],
                    },
                )
                .await;
        }
        let drained = buffers.drain_topic("t").await;
        assert_eq!(drained.len(), BUFFER_MAX);
        assert_eq!(drained[0].device_id, "d5");
    }

    #[tokio::test]
    async fn drain_topic_empties_it() {
        let buffers = Buffers::new();
        buffers.push("t", msg(10)).await;
        let drained = buffers.drain_topic("t").await;
        assert_eq!(drained.len(), 1);
        let depths = buffers.depths().await;
        assert_eq!(depths.get("t"), Some(&0));
    }

    #[test]
    fn chunk_batches_respects_msg_count() {
        let msgs: Vec<Message> = (0..250).map(|_| msg(1)).collect();
        let batches = chunk_batches(msgs);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 100);
        assert_eq!(batches[2].len(), 50);
    }

    #[test]
    fn chunk_batches_respects_byte_limit() {
        let msgs = vec![msg(BATCH_MAX_BYTES - 1), msg(10)];
        let batches = chunk_batches(msgs);
        assert_eq!(batches.len(), 2);
    }

    #[test]
    fn chunk_batches_empty_input() {
        assert!(chunk_batches(Vec::new()).is_empty());
    }
}
