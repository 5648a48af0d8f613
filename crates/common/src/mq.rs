//! In-process message queue (C3). At-least-once delivery between the
//! bridge and the processor: consumers pull, and a `nack` redelivers.
//!
//! Modeled as a concrete type rather than a trait object, following this
//! workspace's existing habit of selecting a concrete backend at compile
//! time (`ValveBoard`'s `gpio` vs mock split) instead of reaching for
//! `dyn Trait` + `async-trait`. A production deployment swaps this module
//! for a managed-queue client without touching callers, since both expose
//! the same `publish`/`consume` shape.

use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Clone)]
pub struct Message {
    pub device_id: String,
    pub ts_received: OffsetDateTime,
    pub source: String,
    pub payload: Vec<u8>,
}

struct Topic {
    tx: mpsc::UnboundedSender<Message>,
    rx: Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl Topic {
    fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: Mutex::new(rx),
        })
    }
}

/// A message pulled off a topic. Must be acked on success or nacked to
/// requeue; dropping without either simply loses the delivery, matching
/// the "lossy at the edge, authoritative downstream" posture of this
/// system's backpressure model (SPEC_FULL.md §5).
pub struct Delivery {
    pub message: Message,
    topic: Arc<Topic>,
}

impl Delivery {
    pub fn ack(self) {
        // No-op: the in-process queue has no separate "in-flight" store to
        // clear. A durable backend's delivery type would delete the
        // server-side lease here.
    }

    pub fn nack(self) {
        let _ = self.topic.tx.send(self.message);
    }
}

#[derive(Default)]
pub struct Queue {
    topics: Mutex<HashMap<String, Arc<Topic>>>,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    async fn topic(&self, name: &str) -> Arc<Topic> {
        let mut topics = self.topics.lock().await;
        topics.entry(name.to_string()).or_insert_with(Topic::new).clone()
    }

    pub async fn publish(&self, topic: &str, msg: Message) -> anyhow::Result<()> {
        let t = self.topic(topic).await;
        t.tx.send(msg).map_err(|_| anyhow::anyhow!("queue closed"))?;
        Ok(())
    }

    pub async fn publish_batch(&self, topic: &str, msgs: Vec<Message>) -> anyhow::Result<()> {
        let t = self.topic(topic).await;
        for msg in msgs {
            t.tx.send(msg).map_err(|_| anyhow::anyhow!("queue closed"))?;
        }
        Ok(())
    }

    /// Blocks until a message is available on `topic`.
    pub async fn consume(&self, topic: &str) -> Option<Delivery> {
        let t = self.topic(topic).await;
        let message = {
            let mut rx = t.rx.lock().await;
            rx.recv().await?
        };
        Some(Delivery { message, topic: t })
    }
}
