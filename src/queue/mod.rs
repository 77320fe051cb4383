//! Backend-agnostic queue contract. The engine core only ever talks to
//! `QueueProvider`; the backend is picked once at startup by the config
//! factory and never swapped at runtime.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::EngineError;
use crate::message::QueueMessage;

pub mod memory;

/// Invoked once per delivery. `Ok` acks the message; `Err` hands it back to
/// the provider, which owns retry, backoff, and dead-lettering.
pub type Handler =
    Arc<dyn Fn(QueueMessage) -> BoxFuture<'static, Result<(), EngineError>> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct ConsumerOptions {
    pub concurrency: usize,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self { concurrency: 1 }
    }
}

#[async_trait]
pub trait QueueProvider: Send + Sync {
    async fn enqueue(&self, topic: &str, body: String) -> Result<(), EngineError>;

    /// Starts pulling from `topic`. One consumer per topic; a second call
    /// while a subscription is live is a `Conflict`.
    async fn consume(
        &self,
        topic: &str,
        handler: Handler,
        options: ConsumerOptions,
    ) -> Result<Subscription, EngineError>;

    /// Messages enqueued but not yet settled (acked or dead-lettered).
    async fn depth(&self, topic: &str) -> usize;

    /// Messages that exhausted their retries.
    async fn dead_letters(&self, topic: &str) -> Vec<QueueMessage>;

    fn name(&self) -> &'static str;
}

/// Handle to a live consumer. Prefer `dispose` over dropping: a plain drop
/// stops the pull loop but does not wait for in-flight handlers.
#[derive(Debug)]
pub struct Subscription {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn new(shutdown: watch::Sender<bool>, task: JoinHandle<()>) -> Self {
        Self { shutdown, task }
    }

    /// Stops pulling new messages and waits for in-flight handlers to
    /// finish. The topic can be consumed again afterwards.
    pub async fn dispose(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}
