//! Flow orchestrator: walks a flow's precomputed plan, threads the payload
//! through every node and applies error-handler guards.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::correlation::CorrelationStore;
use crate::error::EngineError;
use crate::flow::{FlowDefinition, FlowRun, NodeConfig, NodeRecord, TriggerSource};
use crate::join::fanin::FanInTimers;
use crate::node::{ConnectorHandler, ErrorHandlerConfig, ExecutionContext, NodeOutcome};
use crate::storage::{emit_event, EventRecord, FlowStore};

pub struct Orchestrator {
    store: Arc<dyn FlowStore>,
    correlations: Arc<dyn CorrelationStore>,
    connector: Arc<dyn ConnectorHandler>,
    fanin_timers: Arc<FanInTimers>,
    emulation: bool,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn FlowStore>,
        correlations: Arc<dyn CorrelationStore>,
        connector: Arc<dyn ConnectorHandler>,
        emulation: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            correlations,
            connector,
            fanin_timers: FanInTimers::new(),
            emulation,
        })
    }

    /// Runs one flow to completion, suspension or failure.
    ///
    /// Pre-run gates surface as `Err` (unknown flow, disabled flow, payload
    /// that is not an object or array). A node failure mid-run returns
    /// `Ok` with a `Failed` run so callers still get the run record.
    #[tracing::instrument(skip(self, input), fields(flow = %flow_id, trace = %trace_id))]
    pub async fn execute_flow(
        &self,
        flow_id: &str,
        input: Value,
        trace_id: &str,
        trigger: TriggerSource,
    ) -> Result<FlowRun, EngineError> {
        let flow = self
            .store
            .flow(flow_id)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("flow `{flow_id}` not registered")))?;
        if !flow.enabled {
            return Err(EngineError::Disabled(format!("flow `{flow_id}` is disabled")));
        }
        if !input.is_object() && !input.is_array() {
            return Err(EngineError::Validation(
                "payload must be a JSON object or array".into(),
            ));
        }

        let guards = guard_map(&flow);
        let ctx = ExecutionContext {
            flow_id: flow.id.clone(),
            flow_title: flow.title.clone(),
            run_id: String::new(),
            trace_id: trace_id.to_string(),
            organization_id: flow.organization_id.clone(),
            emulation: self.emulation,
            correlations: Arc::clone(&self.correlations),
            store: Arc::clone(&self.store),
            connector: Arc::clone(&self.connector),
            fanin_timers: Arc::clone(&self.fanin_timers),
        };
        let mut run = FlowRun::start(flow_id, trace_id, trigger);
        let ctx = ExecutionContext {
            run_id: run.run_id.clone(),
            ..ctx
        };

        let mut current = input;
        for node in flow.plan() {
            let started = Utc::now();
            let guard = guards.get(node.id.as_str()).copied();
            match self.run_node(node, current.clone(), guard, &ctx).await {
                Ok((NodeOutcome::Emitted(output), recovered)) => {
                    run.executed_nodes.push(NodeRecord {
                        node_id: node.id.clone(),
                        started,
                        finished: Utc::now(),
                        disposition: if recovered { "recovered" } else { "emitted" }.into(),
                    });
                    current = output;
                }
                Ok((NodeOutcome::Waiting, _)) => {
                    run.executed_nodes.push(NodeRecord {
                        node_id: node.id.clone(),
                        started,
                        finished: Utc::now(),
                        disposition: "waiting".into(),
                    });
                    info!(node = %node.id, "run suspended waiting on correlation");
                    // the message is settled; the pair's arrival re-enters
                    // through the same node and carries the flow forward
                    return Ok(run.finish_completed(None));
                }
                Err(err) => {
                    run.executed_nodes.push(NodeRecord {
                        node_id: node.id.clone(),
                        started,
                        finished: Utc::now(),
                        disposition: "failed".into(),
                    });
                    error!(node = %node.id, %err, "node failed, run aborted");
                    return Ok(run.finish_failed(err.to_string()));
                }
            }
        }

        Ok(run.finish_completed(Some(current)))
    }

    /// One node, with its guard applied when it has one: failed attempts are
    /// retried per the guard config, and a still-failing node is replaced by
    /// the guard's default payload instead of aborting the run.
    async fn run_node(
        &self,
        node: &NodeConfig,
        input: Value,
        guard: Option<&ErrorHandlerConfig>,
        ctx: &ExecutionContext,
    ) -> Result<(NodeOutcome, bool), EngineError> {
        let attempts = 1 + guard.map(|g| g.retry_attempts).unwrap_or(0);
        let mut last_err = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                if let Some(guard) = guard {
                    tokio::time::sleep(Duration::from_millis(guard.retry_delay_ms)).await;
                }
                warn!(node = %node.id, attempt, "retrying guarded node");
            }
            match node.kind.execute(&node.id, input.clone(), ctx).await {
                Ok(outcome) => return Ok((outcome, false)),
                Err(err) => last_err = Some(err),
            }
        }
        let err = last_err.unwrap_or_else(|| EngineError::Execution("node produced no result".into()));

        let Some(guard) = guard else {
            return Err(err);
        };
        warn!(node = %node.id, %err, "guarded node failed, substituting default");
        emit_event(
            &ctx.store,
            EventRecord::new(
                "node_error_recovered",
                "pipeline",
                json!({
                    "flowId": ctx.flow_id,
                    "nodeId": node.id,
                    "runId": ctx.run_id,
                    "traceId": ctx.trace_id,
                    "error": err.to_string(),
                    "attempts": attempts,
                }),
            ),
        )
        .await;

        let mut fallback = guard.default_value.clone();
        if let Some(obj) = fallback.as_object_mut() {
            obj.insert(guard.error_field.clone(), json!(err.to_string()));
        }
        Ok((NodeOutcome::Emitted(fallback), true))
    }
}

/// `guarded node id → its guard`, from the flow's error-handler nodes. The
/// relationship is the explicit `guards` field, never execution order.
fn guard_map(flow: &FlowDefinition) -> HashMap<&str, &ErrorHandlerConfig> {
    flow.nodes
        .values()
        .filter_map(|n| match &n.kind {
            crate::node::NodeKind::ErrorHandler { error_handler } => {
                Some((error_handler.guards.as_str(), error_handler))
            }
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::InMemoryCorrelationStore;
    use crate::flow::RunStatus;
    use crate::node::EchoConnector;
    use crate::storage::InMemoryFlowStore;
    use async_trait::async_trait;
    use serde_json::json;

    struct FailingConnector;

    #[async_trait]
    impl ConnectorHandler for FailingConnector {
        async fn invoke(
            &self,
            _name: &str,
            _action: &str,
            _parameters: Option<&Value>,
            _input: Value,
        ) -> Result<Value, EngineError> {
            Err(EngineError::Execution("upstream unreachable".into()))
        }

        fn name(&self) -> &'static str {
            "FailingConnector"
        }
    }

    async fn store_with(flow: Value) -> Arc<InMemoryFlowStore> {
        let store = InMemoryFlowStore::new();
        let flow: FlowDefinition = serde_json::from_value(flow).unwrap();
        store.upsert_flow(flow.build().unwrap()).await.unwrap();
        store
    }

    fn two_connector_flow() -> Value {
        json!({
            "id": "orders",
            "title": "Order intake",
            "nodes": {
                "fetch": {"connector": {"name": "crm", "action": "get"}},
                "push": {"connector": {"name": "erp", "action": "put"}}
            },
            "connections": {"fetch": ["push"]}
        })
    }

    #[tokio::test]
    async fn test_completed_run_threads_payload_through_plan() {
        let store = store_with(two_connector_flow()).await;
        let orch = Orchestrator::new(
            store,
            InMemoryCorrelationStore::new(),
            EchoConnector::new(),
            true,
        );

        let run = orch
            .execute_flow("orders", json!({"n": 1}), "trace-1", TriggerSource::Manual)
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.executed_nodes.len(), 2);
        assert_eq!(run.executed_nodes[0].node_id, "fetch");
        assert_eq!(run.executed_nodes[1].node_id, "push");
        // second node's emulated output wraps the first node's
        let output = run.output.unwrap();
        assert_eq!(output["connector"], json!("erp"));
        assert_eq!(output["input"]["connector"], json!("crm"));
    }

    #[tokio::test]
    async fn test_unknown_flow_is_not_found() {
        let orch = Orchestrator::new(
            InMemoryFlowStore::new(),
            InMemoryCorrelationStore::new(),
            EchoConnector::new(),
            true,
        );
        let err = orch
            .execute_flow("ghost", json!({}), "t", TriggerSource::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_disabled_flow_is_refused() {
        let mut flow = two_connector_flow();
        flow["enabled"] = json!(false);
        let store = store_with(flow).await;
        let orch = Orchestrator::new(
            store,
            InMemoryCorrelationStore::new(),
            EchoConnector::new(),
            true,
        );
        let err = orch
            .execute_flow("orders", json!({}), "t", TriggerSource::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Disabled(_)));
    }

    #[tokio::test]
    async fn test_scalar_payload_is_rejected_before_any_node() {
        let store = store_with(two_connector_flow()).await;
        let orch = Orchestrator::new(
            store,
            InMemoryCorrelationStore::new(),
            EchoConnector::new(),
            true,
        );
        let err = orch
            .execute_flow("orders", json!("just a string"), "t", TriggerSource::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_unguarded_failure_aborts_the_run() {
        let store = store_with(two_connector_flow()).await;
        let orch = Orchestrator::new(
            store,
            InMemoryCorrelationStore::new(),
            Arc::new(FailingConnector),
            false,
        );
        let run = orch
            .execute_flow("orders", json!({}), "t", TriggerSource::Manual)
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.executed_nodes.len(), 1);
        assert_eq!(run.executed_nodes[0].disposition, "failed");
        assert!(run.error.unwrap().contains("upstream unreachable"));
    }

    #[tokio::test]
    async fn test_guarded_failure_substitutes_default_payload() {
        let store = store_with(json!({
            "id": "orders",
            "nodes": {
                "fetch": {"connector": {"name": "crm", "action": "get"}},
                "push": {"connector": {"name": "erp", "action": "put"}},
                "guard": {"errorHandler": {
                    "guards": "fetch",
                    "retryAttempts": 1,
                    "retryDelayMs": 1,
                    "defaultValue": {"fallback": true}
                }}
            },
            "connections": {"fetch": ["push"]}
        }))
        .await;
        // echoing would also fail here, so emulate the second node instead:
        // the failing connector serves both and only `fetch` is guarded
        let orch = Orchestrator::new(
            store.clone(),
            InMemoryCorrelationStore::new(),
            Arc::new(FailingConnector),
            false,
        );

        let run = orch
            .execute_flow("orders", json!({}), "t", TriggerSource::Manual)
            .await
            .unwrap();
        // fetch recovered, push still fails unguarded
        assert_eq!(run.executed_nodes[0].disposition, "recovered");
        assert_eq!(run.executed_nodes[1].disposition, "failed");
        assert_eq!(run.status, RunStatus::Failed);

        let events = store.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "node_error_recovered");
        assert_eq!(events[0].data["attempts"], json!(2));
    }

    #[tokio::test]
    async fn test_guarded_default_carries_the_error_field() {
        let store = store_with(json!({
            "id": "orders",
            "nodes": {
                "fetch": {"connector": {"name": "crm", "action": "get"}},
                "guard": {"errorHandler": {
                    "guards": "fetch",
                    "defaultValue": {"fallback": true}
                }}
            },
            "connections": {}
        }))
        .await;
        let orch = Orchestrator::new(
            store,
            InMemoryCorrelationStore::new(),
            Arc::new(FailingConnector),
            false,
        );

        let run = orch
            .execute_flow("orders", json!({}), "t", TriggerSource::Manual)
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        let output = run.output.unwrap();
        assert_eq!(output["fallback"], json!(true));
        assert!(output["error"].as_str().unwrap().contains("upstream unreachable"));
    }

    fn join_flow() -> Value {
        json!({
            "id": "orders",
            "nodes": {
                "join": {"join": {
                    "correlationKey": "orderId",
                    "streamA": {"field": "source", "equals": "erp"},
                    "streamB": {"field": "source", "equals": "carrier"}
                }},
                "notify": {"connector": {"name": "mail", "action": "send"}}
            },
            "connections": {"join": ["notify"]}
        })
    }

    #[tokio::test]
    async fn test_waiting_join_suspends_the_run() {
        let store = store_with(join_flow()).await;
        let orch = Orchestrator::new(
            store,
            InMemoryCorrelationStore::new(),
            EchoConnector::new(),
            false,
        );

        let run = orch
            .execute_flow(
                "orders",
                json!({"orderId": "po-1", "source": "erp"}),
                "t1",
                TriggerSource::Queue,
            )
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.output.is_none());
        assert_eq!(run.executed_nodes.len(), 1);
        assert_eq!(run.executed_nodes[0].disposition, "waiting");
    }

    #[tokio::test]
    async fn test_pair_arrival_resumes_past_the_join() {
        let store = store_with(join_flow()).await;
        let orch = Orchestrator::new(
            store,
            InMemoryCorrelationStore::new(),
            EchoConnector::new(),
            false,
        );

        orch.execute_flow(
            "orders",
            json!({"orderId": "po-1", "source": "erp", "qty": 2}),
            "t1",
            TriggerSource::Queue,
        )
        .await
        .unwrap();
        let run = orch
            .execute_flow(
                "orders",
                json!({"orderId": "po-1", "source": "carrier"}),
                "t2",
                TriggerSource::Queue,
            )
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.executed_nodes.len(), 2);
        assert_eq!(run.executed_nodes[0].disposition, "emitted");
        let output = run.output.unwrap();
        // echo connector wraps the combined pair
        assert_eq!(output["echo"]["a"]["qty"], json!(2));
        assert_eq!(output["echo"]["b"]["source"], json!("carrier"));
    }
}
