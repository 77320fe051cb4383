use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::correlation::{CorrelationStore, FanInStrategy};
use crate::error::EngineError;
use crate::join;
use crate::join::fanin::FanInTimers;
use crate::storage::FlowStore;

/// Node kinds, flattened by top-level key. A closed set: adding a node type
/// is a new variant here plus an arm in `execute`, checked at compile time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeKind {
    Join {
        join: JoinConfig,
    },
    FanIn {
        #[serde(rename = "fanIn")]
        fan_in: FanInConfig,
    },
    ErrorHandler {
        #[serde(rename = "errorHandler")]
        error_handler: ErrorHandlerConfig,
    },
    Connector {
        connector: ConnectorConfig,
    },
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Join { .. } => "join",
            NodeKind::FanIn { .. } => "fan_in",
            NodeKind::ErrorHandler { .. } => "error_handler",
            NodeKind::Connector { .. } => "connector",
        }
    }

    /// Single dispatch surface for all node behavior.
    ///
    /// An error-handler node performs no work of its own here; the pipeline
    /// applies its guard to the node named by `guards`.
    pub async fn execute(
        &self,
        node_id: &str,
        input: Value,
        ctx: &ExecutionContext,
    ) -> Result<NodeOutcome, EngineError> {
        match self {
            NodeKind::Join { join } => join::pairwise::execute(join, node_id, input, ctx).await,
            NodeKind::FanIn { fan_in } => join::fanin::execute(fan_in, node_id, input, ctx).await,
            NodeKind::ErrorHandler { .. } => Ok(NodeOutcome::Emitted(input)),
            NodeKind::Connector { connector } => connector.execute(input, ctx).await,
        }
    }
}

/// What a node produced. `Waiting` is a legitimate suspended state, not a
/// failure: the flow resumes when the matching arrival runs the same node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    Emitted(Value),
    Waiting,
}

/// Pairwise-correlation node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinConfig {
    #[serde(rename = "correlationKey")]
    pub correlation_key: String,
    #[serde(rename = "labelA", default = "JoinConfig::default_label_a")]
    pub label_a: String,
    #[serde(rename = "labelB", default = "JoinConfig::default_label_b")]
    pub label_b: String,
    /// When set, an arriving payload is classified by matching these
    /// identifiers; when absent, classification falls back to arrival order.
    #[serde(rename = "streamA", default)]
    pub stream_a: Option<StreamIdentifier>,
    #[serde(rename = "streamB", default)]
    pub stream_b: Option<StreamIdentifier>,
    #[serde(rename = "timeoutMinutes", default = "JoinConfig::default_timeout_minutes")]
    pub timeout_minutes: i64,
    #[serde(rename = "joinStrategy", default)]
    pub join_strategy: PairStrategy,
}

impl JoinConfig {
    fn default_label_a() -> String {
        "a".to_string()
    }
    fn default_label_b() -> String {
        "b".to_string()
    }
    fn default_timeout_minutes() -> i64 {
        60
    }
}

/// Field/value pair that marks a payload as belonging to one stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamIdentifier {
    pub field: String,
    pub equals: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairStrategy {
    #[default]
    Inner,
    Left,
    Right,
}

/// Count/strategy fan-in node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanInConfig {
    #[serde(rename = "joinStrategy", default = "FanInConfig::default_strategy")]
    pub join_strategy: FanInStrategy,
    #[serde(rename = "minimumJoins", default = "FanInConfig::default_minimum")]
    pub minimum_joins: usize,
    #[serde(rename = "timeoutMs", default = "FanInConfig::default_timeout_ms")]
    pub timeout_ms: u64,
    /// Payload field carrying the rendezvous id; arrivals without it share a
    /// node-scoped join.
    #[serde(rename = "joinIdKey", default = "FanInConfig::default_join_id_key")]
    pub join_id_key: String,
}

impl FanInConfig {
    fn default_strategy() -> FanInStrategy {
        FanInStrategy::All
    }
    fn default_minimum() -> usize {
        1
    }
    fn default_timeout_ms() -> u64 {
        30_000
    }
    fn default_join_id_key() -> String {
        "joinId".to_string()
    }
}

/// Error-handler node configuration. Guards the node named by `guards`
/// (an explicit relationship, never "whatever happens to run next").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorHandlerConfig {
    pub guards: String,
    #[serde(rename = "retryAttempts", default)]
    pub retry_attempts: usize,
    #[serde(rename = "retryDelayMs", default = "ErrorHandlerConfig::default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(rename = "defaultValue", default)]
    pub default_value: Value,
    #[serde(rename = "errorField", default = "ErrorHandlerConfig::default_error_field")]
    pub error_field: String,
}

impl ErrorHandlerConfig {
    fn default_retry_delay_ms() -> u64 {
        500
    }
    fn default_error_field() -> String {
        "error".to_string()
    }
}

/// Generic connector node: the executor that talks to a specific external
/// system is injected behind `ConnectorHandler`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    pub name: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl ConnectorConfig {
    async fn execute(
        &self,
        input: Value,
        ctx: &ExecutionContext,
    ) -> Result<NodeOutcome, EngineError> {
        if ctx.emulation {
            // deterministic, side-effect free: the only way flows run in
            // tests and previews
            return Ok(NodeOutcome::Emitted(json!({
                "connector": self.name,
                "action": self.action,
                "emulated": true,
                "input": input,
            })));
        }
        let output = ctx
            .connector
            .invoke(&self.name, &self.action, self.parameters.as_ref(), input)
            .await?;
        Ok(NodeOutcome::Emitted(output))
    }
}

/// Seam for the out-of-scope connector executors.
#[async_trait]
pub trait ConnectorHandler: Send + Sync {
    async fn invoke(
        &self,
        name: &str,
        action: &str,
        parameters: Option<&Value>,
        input: Value,
    ) -> Result<Value, EngineError>;

    fn name(&self) -> &'static str;
}

/// Default handler: echoes its input back, annotated. Keeps flows runnable
/// without any external systems wired in.
pub struct EchoConnector;

impl EchoConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl ConnectorHandler for EchoConnector {
    async fn invoke(
        &self,
        name: &str,
        action: &str,
        _parameters: Option<&Value>,
        input: Value,
    ) -> Result<Value, EngineError> {
        Ok(json!({
            "connector": name,
            "action": action,
            "echo": input,
        }))
    }

    fn name(&self) -> &'static str {
        "EchoConnector"
    }
}

/// Threaded through every node of one run.
#[derive(Clone)]
pub struct ExecutionContext {
    pub flow_id: String,
    pub flow_title: String,
    pub run_id: String,
    pub trace_id: String,
    pub organization_id: Option<String>,
    pub emulation: bool,
    pub correlations: Arc<dyn CorrelationStore>,
    pub store: Arc<dyn FlowStore>,
    pub connector: Arc<dyn ConnectorHandler>,
    pub fanin_timers: Arc<FanInTimers>,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::correlation::InMemoryCorrelationStore;
    use crate::storage::InMemoryFlowStore;

    pub fn context(emulation: bool) -> ExecutionContext {
        ExecutionContext {
            flow_id: "orders".into(),
            flow_title: "Order intake".into(),
            run_id: "run-1".into(),
            trace_id: "trace-1".into(),
            organization_id: Some("acme".into()),
            emulation,
            correlations: InMemoryCorrelationStore::new(),
            store: InMemoryFlowStore::new(),
            connector: EchoConnector::new(),
            fanin_timers: FanInTimers::new(),
        }
    }
}
