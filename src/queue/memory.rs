//! In-process reference backend. Per-topic unbounded channels, handler
//! concurrency bounded by a semaphore, exponential backoff on failure and a
//! dead-letter sink once retries run out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tracing::{debug, error, warn};

use crate::error::EngineError;
use crate::message::QueueMessage;
use crate::queue::{ConsumerOptions, Handler, QueueProvider, Subscription};

const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(250);

struct TopicState {
    tx: mpsc::UnboundedSender<QueueMessage>,
    /// Taken by the live consumer, returned when it disposes.
    rx: Mutex<Option<mpsc::UnboundedReceiver<QueueMessage>>>,
    /// Enqueued but not yet settled, retries included.
    depth: AtomicUsize,
    dead: Mutex<Vec<QueueMessage>>,
}

impl TopicState {
    fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: Mutex::new(Some(rx)),
            depth: AtomicUsize::new(0),
            dead: Mutex::new(Vec::new()),
        })
    }
}

pub struct InMemoryQueue {
    topics: DashMap<String, Arc<TopicState>>,
    max_retries: u32,
    backoff_base: Duration,
}

impl InMemoryQueue {
    pub fn new(max_retries: u32) -> Arc<Self> {
        Arc::new(Self {
            topics: DashMap::new(),
            max_retries,
            backoff_base: DEFAULT_BACKOFF_BASE,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_backoff_base(max_retries: u32, backoff_base: Duration) -> Arc<Self> {
        Arc::new(Self {
            topics: DashMap::new(),
            max_retries,
            backoff_base,
        })
    }

    fn topic(&self, topic: &str) -> Arc<TopicState> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(TopicState::new)
            .clone()
    }
}

#[async_trait]
impl QueueProvider for InMemoryQueue {
    async fn enqueue(&self, topic: &str, body: String) -> Result<(), EngineError> {
        let state = self.topic(topic);
        let msg = QueueMessage::new(topic, body, self.max_retries);
        debug!(topic, trace = %msg.trace_id, "enqueue");
        state.depth.fetch_add(1, Ordering::SeqCst);
        state
            .tx
            .send(msg)
            .map_err(|_| EngineError::Queue(format!("topic `{topic}` channel closed")))
    }

    async fn consume(
        &self,
        topic: &str,
        handler: Handler,
        options: ConsumerOptions,
    ) -> Result<Subscription, EngineError> {
        let state = self.topic(topic);
        let mut rx = state.rx.lock().await.take().ok_or_else(|| {
            EngineError::Conflict(format!("topic `{topic}` already has a consumer"))
        })?;

        let concurrency = options.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let backoff_base = self.backoff_base;

        let task = tokio::spawn({
            let state = Arc::clone(&state);
            async move {
                loop {
                    let msg = tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        msg = rx.recv() => match msg {
                            Some(msg) => msg,
                            None => break,
                        },
                    };
                    let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                        break;
                    };
                    let handler = Arc::clone(&handler);
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        settle(state, handler, msg, backoff_base).await;
                        drop(permit);
                    });
                }
                // drain: wait for every in-flight handler before handing the
                // receiver back for a future consumer
                let _ = semaphore.acquire_many(concurrency as u32).await;
                *state.rx.lock().await = Some(rx);
            }
        });

        Ok(Subscription::new(shutdown_tx, task))
    }

    async fn depth(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|s| s.depth.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    async fn dead_letters(&self, topic: &str) -> Vec<QueueMessage> {
        match self.topics.get(topic) {
            Some(state) => state.dead.lock().await.clone(),
            None => Vec::new(),
        }
    }

    fn name(&self) -> &'static str {
        "InMemoryQueue"
    }
}

/// Runs the handler and applies the retry contract: ack on success, backoff
/// and re-enqueue on failure, dead-letter once retries are spent.
async fn settle(
    state: Arc<TopicState>,
    handler: Handler,
    mut msg: QueueMessage,
    backoff_base: Duration,
) {
    match handler(msg.clone()).await {
        Ok(()) => {
            state.depth.fetch_sub(1, Ordering::SeqCst);
        }
        Err(err) if msg.retries_exhausted() => {
            error!(
                topic = %msg.topic,
                trace = %msg.trace_id,
                retries = msg.retry_count,
                %err,
                "retries exhausted, dead-lettering"
            );
            state.depth.fetch_sub(1, Ordering::SeqCst);
            state.dead.lock().await.push(msg);
        }
        Err(err) => {
            msg.retry_count += 1;
            let delay = backoff_base * 2u32.saturating_pow(msg.retry_count - 1);
            warn!(
                topic = %msg.topic,
                trace = %msg.trace_id,
                retry = msg.retry_count,
                delay_ms = delay.as_millis() as u64,
                %err,
                "handler failed, re-enqueueing"
            );
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                // the receiver may be parked between consumers; the message
                // waits in the channel either way
                let _ = state.tx.send(msg);
            });
        }
    }
}
