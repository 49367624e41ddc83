//! In-process topic-keyed event bus (spec §4.1).
//!
//! `publish`/`subscribe`/`close`, with per-topic FIFO relative to a single
//! publisher, bounded per-subscriber queues with a drop-oldest overflow
//! policy, and two optional decorator wrappers (instrumentation, logging).

use serde_json::Value as Payload;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

pub const TOPIC_MODEL_PROGRESS: &str = "model.progress";
pub const TOPIC_INDEX_PROGRESS: &str = "index.progress";
pub const TOPIC_QUERY_LOGGED: &str = "query.logged";
pub const TOPIC_ALERT_TRIGGERED: &str = "alert.triggered";
pub const TOPIC_VERSION_PROMOTED: &str = "version.promoted";

/// Default bound on a single subscriber's pending-delivery queue.
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

pub type HandlerResult = Result<(), String>;
pub type Handler = Arc<dyn Fn(Payload) -> HandlerResult + Send + Sync>;

/// A bus implementation: in-process, instrumented, or logging decorator.
#[async_trait::async_trait]
pub trait EventBus: Send + Sync {
    fn publish(&self, topic: &str, payload: Payload);
    fn subscribe(&self, ctx: CancellationToken, topic: &str, handler: Handler);
    async fn close(&self, drain_deadline: Duration);
}

struct SubscriberQueue {
    queue: std::sync::Mutex<VecDeque<Payload>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            queue: std::sync::Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, payload: Payload) {
        let mut q = self.queue.lock().unwrap();
        if q.len() >= self.capacity {
            q.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        q.push_back(payload);
        drop(q);
        self.notify.notify_one();
    }

    fn drain_one(&self) -> Option<Payload> {
        self.queue.lock().unwrap().pop_front()
    }
}

struct Subscriber {
    queue: Arc<SubscriberQueue>,
}

/// Base in-process bus.
#[derive(Default)]
pub struct InProcessBus {
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
    topic_counts: RwLock<HashMap<String, u64>>,
}

impl InProcessBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn dropped_count(&self) -> u64 {
        self.subscribers
            .read()
            .unwrap()
            .values()
            .flatten()
            .map(|s| s.queue.dropped.load(Ordering::Relaxed))
            .sum()
    }
}

#[async_trait::async_trait]
impl EventBus for InProcessBus {
    fn publish(&self, topic: &str, payload: Payload) {
        *self.topic_counts.write().unwrap().entry(topic.to_string()).or_insert(0) += 1;
        let subs = self.subscribers.read().unwrap();
        if let Some(list) = subs.get(topic) {
            for sub in list {
                sub.queue.push(payload.clone());
            }
        }
    }

    fn subscribe(&self, ctx: CancellationToken, topic: &str, handler: Handler) {
        let queue = Arc::new(SubscriberQueue::new(DEFAULT_QUEUE_CAPACITY));
        self.subscribers
            .write()
            .unwrap()
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber { queue: queue.clone() });

        let topic_owned = topic.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = queue.notify.notified() => {}
                }
                while let Some(payload) = queue.drain_one() {
                    if let Err(e) = handler(payload) {
                        error!(topic = %topic_owned, error = %e, "event handler failed");
                    }
                }
            }
            debug!(topic = %topic_owned, "subscription closed");
        });
    }

    async fn close(&self, drain_deadline: Duration) {
        tokio::time::sleep(drain_deadline).await;
    }
}

/// Wraps a bus, recording per-topic publish counts and handler latency.
pub struct InstrumentedBus {
    inner: Arc<dyn EventBus>,
    pub counts: Arc<RwLock<HashMap<String, u64>>>,
    pub latencies_ms: Arc<RwLock<HashMap<String, Vec<f64>>>>,
}

impl InstrumentedBus {
    pub fn new(inner: Arc<dyn EventBus>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            counts: Arc::new(RwLock::new(HashMap::new())),
            latencies_ms: Arc::new(RwLock::new(HashMap::new())),
        })
    }
}

#[async_trait::async_trait]
impl EventBus for InstrumentedBus {
    fn publish(&self, topic: &str, payload: Payload) {
        *self.counts.write().unwrap().entry(topic.to_string()).or_insert(0) += 1;
        self.inner.publish(topic, payload);
    }

    fn subscribe(&self, ctx: CancellationToken, topic: &str, handler: Handler) {
        let topic_owned = topic.to_string();
        let latencies = self.latencies_ms.clone();
        let timed_handler: Handler = Arc::new(move |payload| {
            let start = Instant::now();
            let result = handler(payload);
            let elapsed = start.elapsed().as_secs_f64() * 1000.0;
            latencies.write().unwrap().entry(topic_owned.clone()).or_default().push(elapsed);
            result
        });
        self.inner.subscribe(ctx, topic, timed_handler);
    }

    async fn close(&self, drain_deadline: Duration) {
        self.inner.close(drain_deadline).await;
    }
}

/// Wraps a bus, appending `(timestamp, topic, payload)` NDJSON lines to a
/// rotating file when enabled.
pub struct LoggingBus {
    inner: Arc<dyn EventBus>,
    writer: Arc<crate::telemetry::RotatingWriter>,
}

impl LoggingBus {
    pub fn new(inner: Arc<dyn EventBus>, writer: Arc<crate::telemetry::RotatingWriter>) -> Arc<Self> {
        Arc::new(Self { inner, writer })
    }
}

#[async_trait::async_trait]
impl EventBus for LoggingBus {
    fn publish(&self, topic: &str, payload: Payload) {
        let line = serde_json::json!({
            "timestamp": crate::util::unix_timestamp_ms(),
            "topic": topic,
            "payload": payload,
        });
        if let Err(e) = self.writer.append_line(&line.to_string()) {
            error!(error = %e, "failed to append event log line");
        }
        self.inner.publish(topic, payload);
    }

    fn subscribe(&self, ctx: CancellationToken, topic: &str, handler: Handler) {
        self.inner.subscribe(ctx, topic, handler);
    }

    async fn close(&self, drain_deadline: Duration) {
        self.inner.close(drain_deadline).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn publish_delivers_to_subscriber() {
        let bus = InProcessBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let ctx = CancellationToken::new();
        bus.subscribe(
            ctx.clone(),
            "test.topic",
            Arc::new(move |_payload| {
                count2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        bus.publish("test.topic", serde_json::json!({"a": 1}));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        ctx.cancel();
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let queue = SubscriberQueue::new(2);
        queue.push(serde_json::json!(1));
        queue.push(serde_json::json!(2));
        queue.push(serde_json::json!(3));
        assert_eq!(queue.dropped.load(Ordering::Relaxed), 1);
        assert_eq!(queue.drain_one(), Some(serde_json::json!(2)));
        assert_eq!(queue.drain_one(), Some(serde_json::json!(3)));
    }
}
