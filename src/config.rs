use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::EngineError;

/// Which broker backs the logical queue. Resolved once at startup; switching
/// backends requires a restart, which the core surfaces but does not perform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum QueueBackend {
    Memory,
    Amqp { url: String },
    Log { brokers: String },
}

impl Default for QueueBackend {
    fn default() -> Self {
        QueueBackend::Memory
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "WorkerConfig::default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "WorkerConfig::default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "WorkerConfig::default_topic")]
    pub topic: String,
}

impl WorkerConfig {
    fn default_concurrency() -> usize {
        3
    }
    fn default_max_retries() -> u32 {
        3
    }
    fn default_topic() -> String {
        "inbound-items".to_string()
    }

    /// Concurrency is accepted from config but never outside 1..=100.
    pub fn clamped_concurrency(&self) -> usize {
        self.concurrency.clamp(1, 100)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: Self::default_concurrency(),
            max_retries: Self::default_max_retries(),
            topic: Self::default_topic(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub queue: QueueBackend,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default = "EngineConfig::default_http_port")]
    pub http_port: u16,
    #[serde(default = "EngineConfig::default_flow_dir")]
    pub flow_dir: PathBuf,
}

impl EngineConfig {
    fn default_http_port() -> u16 {
        8086
    }
    fn default_flow_dir() -> PathBuf {
        PathBuf::from("./flows")
    }

    /// Builds the config from process environment, loading `.env` first if
    /// present.
    pub fn from_env() -> Self {
        if dotenvy::dotenv().is_ok() {
            info!("loaded environment from .env");
        }

        let queue = match env::var("FLOWGATE_QUEUE").as_deref() {
            Ok("amqp") => QueueBackend::Amqp {
                url: env::var("FLOWGATE_AMQP_URL").unwrap_or_default(),
            },
            Ok("log") => QueueBackend::Log {
                brokers: env::var("FLOWGATE_LOG_BROKERS").unwrap_or_default(),
            },
            _ => QueueBackend::Memory,
        };

        let worker = WorkerConfig {
            concurrency: env_usize("FLOWGATE_CONCURRENCY", WorkerConfig::default_concurrency()),
            max_retries: env_usize("FLOWGATE_MAX_RETRIES", 3) as u32,
            topic: env::var("FLOWGATE_TOPIC").unwrap_or_else(|_| WorkerConfig::default_topic()),
        };

        Self {
            queue,
            worker,
            http_port: env_usize("FLOWGATE_HTTP_PORT", Self::default_http_port() as usize) as u16,
            flow_dir: env::var("FLOWGATE_FLOW_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| Self::default_flow_dir()),
        }
    }

    /// Validates that the configured backend is one this build can serve.
    /// Broker-backed variants are configuration-complete but ship no executor
    /// here; selecting one is an explicit startup failure, not a fallback.
    pub fn ensure_supported_backend(&self) -> Result<(), EngineError> {
        match &self.queue {
            QueueBackend::Memory => Ok(()),
            QueueBackend::Amqp { .. } => Err(EngineError::Queue(
                "amqp backend is not compiled into this binary; restart with queue=memory".into(),
            )),
            QueueBackend::Log { .. } => Err(EngineError::Queue(
                "log-broker backend is not compiled into this binary; restart with queue=memory"
                    .into(),
            )),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue: QueueBackend::default(),
            worker: WorkerConfig::default(),
            http_port: Self::default_http_port(),
            flow_dir: Self::default_flow_dir(),
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.queue, QueueBackend::Memory);
        assert_eq!(cfg.worker.concurrency, 3);
        assert_eq!(cfg.worker.topic, "inbound-items");
        assert!(cfg.ensure_supported_backend().is_ok());
    }

    #[test]
    fn test_concurrency_clamping() {
        let mut worker = WorkerConfig::default();
        worker.concurrency = 0;
        assert_eq!(worker.clamped_concurrency(), 1);
        worker.concurrency = 500;
        assert_eq!(worker.clamped_concurrency(), 100);
        worker.concurrency = 12;
        assert_eq!(worker.clamped_concurrency(), 12);
    }

    #[test]
    fn test_broker_backends_require_restart() {
        let cfg = EngineConfig {
            queue: QueueBackend::Amqp {
                url: "amqp://localhost".into(),
            },
            ..EngineConfig::default()
        };
        let err = cfg.ensure_supported_backend().unwrap_err();
        assert!(matches!(err, EngineError::Queue(_)));
    }
}
