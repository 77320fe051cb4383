//! Count-based fan-in: N independent arrivals rendezvous on a shared join
//! id. The first arrival fixes the required count and arms a timeout; every
//! arrival appends atomically and checks the completion strategy.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::correlation::{CorrelationStore, FanInStrategy};
use crate::error::EngineError;
use crate::join::{lookup_path, value_as_key};
use crate::node::{ExecutionContext, FanInConfig, NodeOutcome};
use crate::storage::{emit_event, EventRecord, FlowStore};

/// Payload field that lets the first arrival declare how many siblings it
/// expects. Absent, the join waits for two.
const EXPECTED_JOINS_KEY: &str = "expectedJoins";

pub async fn execute(
    cfg: &FanInConfig,
    node_id: &str,
    input: Value,
    ctx: &ExecutionContext,
) -> Result<NodeOutcome, EngineError> {
    if ctx.emulation {
        return Ok(NodeOutcome::Emitted(json!({
            "joinId": "emulated",
            "received": 1,
            "payloads": [input],
            "emulated": true,
        })));
    }

    // arrivals without the configured key share one node-scoped rendezvous
    let join_id = lookup_path(&input, &cfg.join_id_key)
        .map(value_as_key)
        .unwrap_or_else(|| format!("{}::{}", ctx.flow_id, node_id));

    let required_hint = input
        .get(EXPECTED_JOINS_KEY)
        .and_then(Value::as_u64)
        .map(|n| n as usize);

    let append = ctx
        .correlations
        .append_fanin(
            &join_id,
            input,
            required_hint,
            cfg.minimum_joins,
            cfg.join_strategy,
        )
        .await?;

    if let Some(payloads) = append.payloads {
        ctx.fanin_timers.cancel(&join_id);
        info!(
            flow = %ctx.flow_id,
            node = node_id,
            join_id = %join_id,
            received = append.received,
            "fan-in complete"
        );
        return Ok(NodeOutcome::Emitted(json!({
            "joinId": join_id,
            "received": append.received,
            "payloads": payloads,
        })));
    }

    if append.first_arrival {
        arm_timeout(cfg, node_id, &join_id, ctx);
    }
    info!(
        flow = %ctx.flow_id,
        node = node_id,
        join_id = %join_id,
        received = append.received,
        required = append.required,
        "fan-in waiting for siblings"
    );
    Ok(NodeOutcome::Waiting)
}

fn arm_timeout(cfg: &FanInConfig, node_id: &str, join_id: &str, ctx: &ExecutionContext) {
    let correlations = Arc::clone(&ctx.correlations);
    let store = Arc::clone(&ctx.store);
    let timers = Arc::clone(&ctx.fanin_timers);
    let strategy = cfg.join_strategy;
    let timeout = Duration::from_millis(cfg.timeout_ms);
    let join_id = join_id.to_string();
    let flow_id = ctx.flow_id.clone();
    let node_id = node_id.to_string();
    let trace_id = ctx.trace_id.clone();

    let handle = tokio::spawn({
        let join_id = join_id.clone();
        async move {
            tokio::time::sleep(timeout).await;
            timers.forget(&join_id);
            fire_timeout(
                &correlations,
                &store,
                strategy,
                &join_id,
                &flow_id,
                &node_id,
                &trace_id,
            )
            .await;
        }
    });
    ctx.fanin_timers.arm(&join_id, handle);
}

async fn fire_timeout(
    correlations: &Arc<dyn CorrelationStore>,
    store: &Arc<dyn FlowStore>,
    strategy: FanInStrategy,
    join_id: &str,
    flow_id: &str,
    node_id: &str,
    trace_id: &str,
) {
    // completion in the window between sleep and take wins; nothing to do
    let Some(pending) = correlations.take_fanin(join_id).await else {
        return;
    };
    warn!(
        flow = flow_id,
        node = node_id,
        join_id,
        received = pending.received.len(),
        required = pending.required,
        "fan-in timed out"
    );
    let salvaged = matches!(strategy, FanInStrategy::Timeout);
    let mut data = json!({
        "flowId": flow_id,
        "nodeId": node_id,
        "traceId": trace_id,
        "joinId": join_id,
        "received": pending.received.len(),
        "required": pending.required,
        "salvaged": salvaged,
    });
    if salvaged {
        // the timeout strategy treats the deadline as the rendezvous: the
        // partial set is the result, published for downstream consumers
        data["payloads"] = Value::Array(pending.received);
    }
    emit_event(store, EventRecord::new("fanin_timeout", "fan_in", data)).await;
}

/// Live timeout tasks keyed by join id. A completed join must cancel its
/// timer; a fired timer must not linger in the map.
pub struct FanInTimers {
    tasks: DashMap<String, JoinHandle<()>>,
}

impl FanInTimers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tasks: DashMap::new(),
        })
    }

    fn arm(&self, join_id: &str, handle: JoinHandle<()>) {
        if let Some(previous) = self.tasks.insert(join_id.to_string(), handle) {
            previous.abort();
        }
    }

    /// Cancels the pending timer for a join that completed in time.
    pub fn cancel(&self, join_id: &str) {
        if let Some((_, handle)) = self.tasks.remove(join_id) {
            handle.abort();
        }
    }

    /// Drops the map entry without aborting; called from inside the firing
    /// task itself.
    fn forget(&self, join_id: &str) {
        self.tasks.remove(join_id);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::test_support::context;
    use serde_json::json;

    fn fanin_cfg(value: Value) -> FanInConfig {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_all_strategy_completes_at_required_count() {
        let ctx = context(false);
        let cfg = fanin_cfg(json!({}));

        let first = json!({"joinId": "batch-1", "expectedJoins": 3, "part": 1});
        let second = json!({"joinId": "batch-1", "part": 2});
        let third = json!({"joinId": "batch-1", "part": 3});

        assert_eq!(
            execute(&cfg, "fanin-1", first, &ctx).await.unwrap(),
            NodeOutcome::Waiting
        );
        assert_eq!(
            execute(&cfg, "fanin-1", second, &ctx).await.unwrap(),
            NodeOutcome::Waiting
        );
        let NodeOutcome::Emitted(out) = execute(&cfg, "fanin-1", third, &ctx).await.unwrap()
        else {
            panic!("third arrival completes the join");
        };
        assert_eq!(out["received"], json!(3));
        assert_eq!(out["payloads"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_required_defaults_to_two_without_hint() {
        let ctx = context(false);
        let cfg = fanin_cfg(json!({}));

        assert_eq!(
            execute(&cfg, "fanin-1", json!({"joinId": "b", "n": 1}), &ctx)
                .await
                .unwrap(),
            NodeOutcome::Waiting
        );
        let out = execute(&cfg, "fanin-1", json!({"joinId": "b", "n": 2}), &ctx)
            .await
            .unwrap();
        assert!(matches!(out, NodeOutcome::Emitted(_)));
    }

    #[tokio::test]
    async fn test_any_strategy_completes_immediately() {
        let ctx = context(false);
        let cfg = fanin_cfg(json!({"joinStrategy": "any"}));
        let out = execute(&cfg, "fanin-1", json!({"joinId": "solo"}), &ctx)
            .await
            .unwrap();
        assert!(matches!(out, NodeOutcome::Emitted(_)));
    }

    #[tokio::test]
    async fn test_majority_strategy_completes_past_half() {
        let ctx = context(false);
        let cfg = fanin_cfg(json!({"joinStrategy": "majority"}));

        assert_eq!(
            execute(
                &cfg,
                "fanin-1",
                json!({"joinId": "vote", "expectedJoins": 3}),
                &ctx
            )
            .await
            .unwrap(),
            NodeOutcome::Waiting
        );
        // 2 of 3 is a majority
        let out = execute(&cfg, "fanin-1", json!({"joinId": "vote"}), &ctx)
            .await
            .unwrap();
        assert!(matches!(out, NodeOutcome::Emitted(_)));
    }

    #[tokio::test]
    async fn test_minimum_strategy_uses_configured_floor() {
        let ctx = context(false);
        let cfg = fanin_cfg(json!({"joinStrategy": "minimum", "minimumJoins": 2}));

        assert_eq!(
            execute(
                &cfg,
                "fanin-1",
                json!({"joinId": "m", "expectedJoins": 5}),
                &ctx
            )
            .await
            .unwrap(),
            NodeOutcome::Waiting
        );
        let out = execute(&cfg, "fanin-1", json!({"joinId": "m"}), &ctx)
            .await
            .unwrap();
        assert!(matches!(out, NodeOutcome::Emitted(_)));
    }

    #[tokio::test]
    async fn test_missing_join_id_scopes_to_node() {
        let ctx = context(false);
        let cfg = fanin_cfg(json!({}));

        assert_eq!(
            execute(&cfg, "fanin-1", json!({"n": 1}), &ctx).await.unwrap(),
            NodeOutcome::Waiting
        );
        // a different node is a different rendezvous
        assert_eq!(
            execute(&cfg, "fanin-2", json!({"n": 2}), &ctx).await.unwrap(),
            NodeOutcome::Waiting
        );
        let out = execute(&cfg, "fanin-1", json!({"n": 3}), &ctx).await.unwrap();
        assert!(matches!(out, NodeOutcome::Emitted(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_strategy_salvages_partial_set() {
        let store = crate::storage::InMemoryFlowStore::new();
        let mut ctx = context(false);
        ctx.store = store.clone();
        let cfg = fanin_cfg(json!({"joinStrategy": "timeout", "timeoutMs": 1000}));

        execute(
            &cfg,
            "fanin-1",
            json!({"joinId": "late", "expectedJoins": 3, "n": 1}),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(ctx.fanin_timers.len(), 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;

        let events = store.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "fanin_timeout");
        assert_eq!(events[0].data["salvaged"], json!(true));
        assert_eq!(events[0].data["payloads"].as_array().unwrap().len(), 1);
        assert!(ctx.correlations.take_fanin("late").await.is_none());
        assert!(ctx.fanin_timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_discards_for_strict_strategies() {
        let store = crate::storage::InMemoryFlowStore::new();
        let mut ctx = context(false);
        ctx.store = store.clone();
        let cfg = fanin_cfg(json!({"timeoutMs": 1000}));

        execute(
            &cfg,
            "fanin-1",
            json!({"joinId": "late", "expectedJoins": 3}),
            &ctx,
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let events = store.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data["salvaged"], json!(false));
        assert!(events[0].data.get("payloads").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_cancels_timeout_task() {
        let store = crate::storage::InMemoryFlowStore::new();
        let mut ctx = context(false);
        ctx.store = store.clone();
        let cfg = fanin_cfg(json!({"timeoutMs": 1000}));

        execute(&cfg, "fanin-1", json!({"joinId": "fast"}), &ctx)
            .await
            .unwrap();
        let out = execute(&cfg, "fanin-1", json!({"joinId": "fast"}), &ctx)
            .await
            .unwrap();
        assert!(matches!(out, NodeOutcome::Emitted(_)));
        assert!(ctx.fanin_timers.is_empty());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(store.events().await.is_empty());
    }

    #[tokio::test]
    async fn test_emulation_mode_touches_no_state() {
        let ctx = context(true);
        let cfg = fanin_cfg(json!({}));
        let out = execute(&cfg, "fanin-1", json!({"joinId": "x"}), &ctx)
            .await
            .unwrap();
        let NodeOutcome::Emitted(v) = out else {
            panic!("emulation always emits");
        };
        assert_eq!(v["emulated"], json!(true));
        assert!(ctx.correlations.take_fanin("x").await.is_none());
    }
}
