//! Delayed-enqueue task channel with named processors and lanes.
//!
//! Workers never sleep to wait out a retry delay; they hand the delay
//! back to the queue and move on. [`InMemoryQueue`] implements the
//! contract for tests and single-process deployments; production
//! deployments back [`TaskQueue`] with an external work queue that
//! supports delayed enqueue natively.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Processor consuming scheduled event deliveries.
pub const EVENT_PROCESSOR: &str = "EventProcessor";

/// Processor consuming endpoint-state notification tasks.
pub const NOTIFICATION_PROCESSOR: &str = "NotificationProcessor";

/// Default lane within a processor.
pub const DEFAULT_LANE: &str = "default";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is shut down")]
    Closed,
}

/// Task channel contract: route `payload` to `processor`/`lane`, visible
/// to consumers no earlier than `delay` from now.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn write(
        &self,
        processor: &str,
        lane: &str,
        payload: Vec<u8>,
        delay: Duration,
    ) -> Result<(), QueueError>;
}

/// A payload waiting for its visibility time.
///
/// The derived ordering is lexicographic, so entries sort by
/// `ready_at` and then by `seq`, which keeps same-instant writes FIFO.
/// Held in the heap under [`Reverse`] to pop the earliest first.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct DelayedTask {
    ready_at: Instant,
    seq: u64,
    processor: String,
    payload: Vec<u8>,
}

struct ProcessorChannel {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
}

struct QueueInner {
    channels: Mutex<HashMap<String, ProcessorChannel>>,
    delayed: Mutex<BinaryHeap<Reverse<DelayedTask>>>,
    seq: AtomicU64,
    notify: Notify,
}

/// Single-process [`TaskQueue`] with its own delayed-dispatch scheduler.
///
/// One consumer per processor: [`InMemoryQueue::subscribe`] hands out
/// the receiving half, and a scheduler task moves delayed payloads into
/// the channel once their visibility time passes.
pub struct InMemoryQueue {
    inner: Arc<QueueInner>,
    token: CancellationToken,
}

impl InMemoryQueue {
    /// Create the queue and spawn its scheduler. Must be called from
    /// within a tokio runtime.
    pub fn new() -> Self {
        let inner = Arc::new(QueueInner {
            channels: Mutex::new(HashMap::new()),
            delayed: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            notify: Notify::new(),
        });
        let token = CancellationToken::new();

        tokio::spawn(run_scheduler(inner.clone(), token.clone()));

        Self { inner, token }
    }

    /// Take the consuming side of a processor's channel. Payloads
    /// written before the first subscribe are retained.
    pub async fn subscribe(&self, processor: &str) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let mut channels = self.inner.channels.lock().await;
        let channel = channels
            .entry(processor.to_string())
            .or_insert_with(new_channel);
        match channel.rx.take() {
            Some(rx) => rx,
            None => {
                // Second subscriber replaces the channel entirely.
                let (tx, rx) = mpsc::unbounded_channel();
                channels.insert(processor.to_string(), ProcessorChannel { tx, rx: None });
                rx
            }
        }
    }

    /// Stop the scheduler; subsequent writes fail with [`QueueError::Closed`].
    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn new_channel() -> ProcessorChannel {
    let (tx, rx) = mpsc::unbounded_channel();
    ProcessorChannel { tx, rx: Some(rx) }
}

#[async_trait]
impl TaskQueue for InMemoryQueue {
    async fn write(
        &self,
        processor: &str,
        lane: &str,
        payload: Vec<u8>,
        delay: Duration,
    ) -> Result<(), QueueError> {
        if self.token.is_cancelled() {
            return Err(QueueError::Closed);
        }

        tracing::trace!(
            target: "queue",
            processor,
            lane,
            delay_ms = delay.as_millis() as u64,
            "enqueue task"
        );

        if delay.is_zero() {
            let mut channels = self.inner.channels.lock().await;
            let channel = channels
                .entry(processor.to_string())
                .or_insert_with(new_channel);
            channel.tx.send(payload).map_err(|_| QueueError::Closed)?;
        } else {
            self.inner.delayed.lock().await.push(Reverse(DelayedTask {
                ready_at: Instant::now() + delay,
                seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
                processor: processor.to_string(),
                payload,
            }));
            self.inner.notify.notify_one();
        }

        Ok(())
    }
}

async fn run_scheduler(inner: Arc<QueueInner>, token: CancellationToken) {
    loop {
        // Drain everything due, then find out how long to sleep. Due
        // tasks are collected first so the channels lock is never taken
        // while holding the heap lock.
        let (due, next_ready) = {
            let mut delayed = inner.delayed.lock().await;
            let now = Instant::now();
            let mut due = Vec::new();
            while delayed.peek().is_some_and(|entry| entry.0.ready_at <= now) {
                if let Some(Reverse(task)) = delayed.pop() {
                    due.push(task);
                }
            }
            (due, delayed.peek().map(|entry| entry.0.ready_at))
        };

        if !due.is_empty() {
            let mut channels = inner.channels.lock().await;
            for task in due {
                let channel = channels
                    .entry(task.processor.clone())
                    .or_insert_with(new_channel);
                let _ = channel.tx.send(task.payload);
            }
            continue;
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = inner.notify.notified() => {}
            _ = async {
                match next_ready {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => {}
        }
    }
}
