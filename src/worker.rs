//! Bounded-concurrency worker pool over a `QueueProvider`. The pool owns no
//! retry math: a failed message is returned to the provider, which applies
//! the backoff and dead-letter contract.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::config::WorkerConfig;
use crate::error::EngineError;
use crate::flow::{RunStatus, TriggerSource};
use crate::message::{Envelope, QueueMessage};
use crate::pipeline::Orchestrator;
use crate::queue::{ConsumerOptions, Handler, QueueProvider, Subscription};
use crate::storage::{emit_event, EventRecord, FlowStore};

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub enabled: bool,
    pub concurrency: usize,
    pub messages_processed: u64,
    pub state: &'static str,
}

pub struct WorkerPool {
    qp: Arc<dyn QueueProvider>,
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn FlowStore>,
    config: Mutex<WorkerConfig>,
    enabled: AtomicBool,
    processed: AtomicU64,
    subscription: Mutex<Option<Subscription>>,
}

impl WorkerPool {
    pub fn new(
        qp: Arc<dyn QueueProvider>,
        orchestrator: Arc<Orchestrator>,
        store: Arc<dyn FlowStore>,
        config: WorkerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            qp,
            orchestrator,
            store,
            config: Mutex::new(config),
            enabled: AtomicBool::new(true),
            processed: AtomicU64::new(0),
            subscription: Mutex::new(None),
        })
    }

    /// Subscribes to the configured topic. Calling it on a running pool is a
    /// no-op.
    pub async fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        let mut slot = self.subscription.lock().await;
        if slot.is_some() {
            debug!("worker already running");
            return Ok(());
        }
        self.enabled.store(true, Ordering::SeqCst);
        let config = self.config.lock().await.clone();
        let options = ConsumerOptions {
            concurrency: config.clamped_concurrency(),
        };
        info!(
            topic = %config.topic,
            concurrency = options.concurrency,
            "starting worker pool"
        );
        let sub = self.qp.consume(&config.topic, self.handler(), options).await?;
        *slot = Some(sub);
        Ok(())
    }

    /// Stops pulling and waits for in-flight messages to finish.
    pub async fn stop(&self) {
        if let Some(sub) = self.subscription.lock().await.take() {
            info!("stopping worker pool");
            self.enabled.store(false, Ordering::SeqCst);
            sub.dispose().await;
        }
    }

    /// When disabled the pool keeps consuming but acks without processing,
    /// draining the topic.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Applies a new configuration; a running pool is resubscribed with the
    /// new concurrency.
    pub async fn set_config(self: &Arc<Self>, config: WorkerConfig) -> Result<(), EngineError> {
        let was_running = {
            let mut cfg = self.config.lock().await;
            *cfg = config;
            self.subscription.lock().await.is_some()
        };
        if was_running {
            self.stop().await;
            self.start().await?;
        }
        Ok(())
    }

    pub async fn status(&self) -> WorkerStatus {
        let config = self.config.lock().await;
        let running = self.subscription.lock().await.is_some();
        WorkerStatus {
            enabled: self.enabled.load(Ordering::SeqCst),
            concurrency: config.clamped_concurrency(),
            messages_processed: self.processed.load(Ordering::SeqCst),
            state: if running { "running" } else { "stopped" },
        }
    }

    fn handler(self: &Arc<Self>) -> Handler {
        let pool = Arc::clone(self);
        Arc::new(move |msg| {
            let pool = Arc::clone(&pool);
            Box::pin(async move { pool.process_message(msg).await })
        })
    }

    /// One delivery end to end. `Ok` settles the message; `Err` is only
    /// returned for retryable failures so the provider re-delivers.
    #[tracing::instrument(skip(self, msg), fields(trace = %msg.trace_id, retry = msg.retry_count))]
    async fn process_message(&self, msg: QueueMessage) -> Result<(), EngineError> {
        if !self.enabled.load(Ordering::SeqCst) {
            debug!("worker disabled, draining message unprocessed");
            return Ok(());
        }

        let outcome = self.dispatch(&msg).await;
        match outcome {
            Ok(()) => Ok(()),
            Err(err) => {
                emit_event(
                    &self.store,
                    EventRecord::new(
                        "flow_failed",
                        "worker",
                        json!({
                            "traceId": msg.trace_id,
                            "retryCount": msg.retry_count,
                            "error": err.to_string(),
                        }),
                    ),
                )
                .await;
                if err.is_retryable() {
                    Err(err)
                } else {
                    // a malformed or unroutable message never gets better;
                    // settle it instead of burning retries
                    error!(%err, "non-retryable failure, message settled");
                    Ok(())
                }
            }
        }
    }

    async fn dispatch(&self, msg: &QueueMessage) -> Result<(), EngineError> {
        let envelope = Envelope::normalize(&msg.body)?;
        let run = self
            .orchestrator
            .execute_flow(
                envelope.flow_id(),
                envelope.payload().clone(),
                envelope.trace_id(),
                TriggerSource::Queue,
            )
            .await?;

        if run.status == RunStatus::Failed {
            let reason = run.error.unwrap_or_else(|| "unknown node failure".into());
            return Err(EngineError::Execution(reason));
        }

        self.processed.fetch_add(1, Ordering::SeqCst);
        emit_event(
            &self.store,
            EventRecord::new(
                "flow_completed",
                "worker",
                json!({
                    "flowId": run.flow_id,
                    "traceId": run.trace_id,
                    "runId": run.run_id,
                    "durationMs": run.duration_ms,
                    "retryCount": msg.retry_count,
                    "executedNodes": run.executed_nodes.len(),
                }),
            ),
        )
        .await;
        Ok(())
    }
}
