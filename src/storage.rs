use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::EngineError;
use crate::flow::FlowDefinition;

/// Event surfaced to the external observability collaborator. Best-effort:
/// a failure to record one is logged and never rethrown into orchestration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub kind: String,
    pub source: String,
    pub data: Value,
    pub at: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(kind: impl Into<String>, source: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            source: source.into(),
            data,
            at: Utc::now(),
        }
    }
}

/// Row store for flow definitions plus the events sink.
#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn flow(&self, id: &str) -> Option<FlowDefinition>;
    async fn all_flows(&self) -> Vec<FlowDefinition>;
    /// Used by the startup loader and tests; the flow editor itself lives
    /// outside the core.
    async fn upsert_flow(&self, flow: FlowDefinition) -> Result<(), EngineError>;
    async fn create_event(&self, event: EventRecord) -> Result<(), EngineError>;

    fn name(&self) -> &'static str;
}

impl fmt::Debug for dyn FlowStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowStore").field("impl", &self.name()).finish()
    }
}

const EVENT_CAP: usize = 1024;

pub struct InMemoryFlowStore {
    flows: DashMap<String, FlowDefinition>,
    events: Mutex<Vec<EventRecord>>,
}

impl InMemoryFlowStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            flows: DashMap::new(),
            events: Mutex::new(Vec::new()),
        })
    }

    /// Snapshot of recorded events, oldest first (test/inspection hook).
    pub async fn events(&self) -> Vec<EventRecord> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl FlowStore for InMemoryFlowStore {
    async fn flow(&self, id: &str) -> Option<FlowDefinition> {
        self.flows.get(id).map(|f| f.clone())
    }

    async fn all_flows(&self) -> Vec<FlowDefinition> {
        self.flows.iter().map(|f| f.clone()).collect()
    }

    async fn upsert_flow(&self, flow: FlowDefinition) -> Result<(), EngineError> {
        info!("registered flow `{}` (v{})", flow.id, flow.version);
        self.flows.insert(flow.id.clone(), flow);
        Ok(())
    }

    async fn create_event(&self, event: EventRecord) -> Result<(), EngineError> {
        let mut events = self.events.lock().await;
        if events.len() >= EVENT_CAP {
            events.remove(0);
        }
        events.push(event);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "InMemoryFlowStore"
    }
}

/// Records an event and swallows (but logs) its failure.
pub async fn emit_event(store: &Arc<dyn FlowStore>, event: EventRecord) {
    if let Err(e) = store.create_event(event).await {
        tracing::warn!("failed to record event: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_flow(id: &str) -> FlowDefinition {
        let json = json!({
            "id": id,
            "nodes": {
                "in": {"connector": {"name": "echo", "action": "receive"}}
            },
            "connections": {}
        });
        serde_json::from_value::<FlowDefinition>(json)
            .unwrap()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_flow_roundtrip() {
        let store = InMemoryFlowStore::new();
        store.upsert_flow(sample_flow("orders")).await.unwrap();

        assert!(store.flow("orders").await.is_some());
        assert!(store.flow("missing").await.is_none());
        assert_eq!(store.all_flows().await.len(), 1);
    }

    #[tokio::test]
    async fn test_events_are_recorded_and_capped() {
        let store = InMemoryFlowStore::new();
        store
            .create_event(EventRecord::new("flow_failed", "pipeline", json!({"x": 1})))
            .await
            .unwrap();
        let events = store.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "flow_failed");
    }

    #[tokio::test]
    async fn test_trait_object_usage() {
        let store: Arc<dyn FlowStore> = InMemoryFlowStore::new();
        assert_eq!(store.name(), "InMemoryFlowStore");
        emit_event(&store, EventRecord::new("k", "s", json!(null))).await;
    }
}
