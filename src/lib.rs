//! Multi-tenant workflow engine core: queue-fed flow orchestration with
//! pairwise and fan-in joins, plus dynamic tenant-scoped webhooks.

pub mod config;
pub mod correlation;
pub mod error;
pub mod flow;
pub mod join;
pub mod message;
pub mod node;
pub mod pipeline;
pub mod queue;
pub mod storage;
pub mod webhook;
pub mod worker;

pub use config::EngineConfig;
pub use error::EngineError;
pub use flow::{FlowDefinition, FlowRun, TriggerSource};
pub use message::Envelope;
pub use pipeline::Orchestrator;
pub use worker::WorkerPool;
