//! Pairwise correlation: two independent streams stitched by a shared
//! business key. The "still waiting for the pair" case is an explicit
//! `NodeOutcome::Waiting`, never an error.

use chrono::Duration;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::correlation::{JoinKey, JoinState, PairwiseOutcome, Stream};
use crate::error::EngineError;
use crate::join::{lookup_path, value_as_key};
use crate::node::{ExecutionContext, JoinConfig, NodeOutcome, PairStrategy, StreamIdentifier};
use crate::storage::{emit_event, EventRecord};

pub async fn execute(
    cfg: &JoinConfig,
    node_id: &str,
    input: Value,
    ctx: &ExecutionContext,
) -> Result<NodeOutcome, EngineError> {
    if ctx.emulation {
        // the mock is a self-match: both labels carry the input
        let mut combined = serde_json::Map::new();
        combined.insert(cfg.label_a.clone(), input.clone());
        combined.insert(cfg.label_b.clone(), input);
        combined.insert("emulated".to_string(), json!(true));
        return Ok(NodeOutcome::Emitted(Value::Object(combined)));
    }

    let correlation_value = lookup_path(&input, &cfg.correlation_key)
        .map(value_as_key)
        .ok_or_else(|| {
            EngineError::Validation(format!(
                "payload has no correlation key `{}`",
                cfg.correlation_key
            ))
        })?;

    let arrival = classify(cfg, &input)?;
    let key = JoinKey::new(&ctx.flow_id, node_id, &correlation_value);
    let ttl = Duration::minutes(cfg.timeout_minutes.max(1));

    match ctx
        .correlations
        .upsert_pairwise(&key, arrival, input, ttl)
        .await?
    {
        PairwiseOutcome::Waiting(displaced) => {
            if let Some(stale) = displaced {
                salvage_expired(cfg, node_id, &correlation_value, stale, ctx).await;
            }
            info!(
                flow = %ctx.flow_id,
                node = node_id,
                correlation = %correlation_value,
                "join waiting for pair"
            );
            Ok(NodeOutcome::Waiting)
        }
        PairwiseOutcome::Matched(state) => {
            info!(
                flow = %ctx.flow_id,
                node = node_id,
                correlation = %correlation_value,
                "join matched"
            );
            let mut combined = serde_json::Map::new();
            combined.insert(
                cfg.label_a.clone(),
                state.stream_a.unwrap_or(Value::Null),
            );
            combined.insert(
                cfg.label_b.clone(),
                state.stream_b.unwrap_or(Value::Null),
            );
            Ok(NodeOutcome::Emitted(Value::Object(combined)))
        }
        PairwiseOutcome::SameStreamConflict(state) => {
            let stream = state
                .waiting_stream()
                .map(Stream::label)
                .unwrap_or("unknown");
            warn!(
                flow = %ctx.flow_id,
                node = node_id,
                correlation = %correlation_value,
                stream,
                "duplicate same-stream arrival rejected"
            );
            emit_event(
                &ctx.store,
                EventRecord::new(
                    "join_duplicate_arrival",
                    "join",
                    json!({
                        "flowId": ctx.flow_id,
                        "nodeId": node_id,
                        "traceId": ctx.trace_id,
                        "correlationValue": correlation_value,
                        "stream": stream,
                    }),
                ),
            )
            .await;
            Err(EngineError::Conflict(format!(
                "stream {stream} already arrived for correlation value `{correlation_value}`"
            )))
        }
    }
}

/// Records an expired cycle that the current arrival displaced.
///
/// Left and right strategies additionally publish the one-sided payload so a
/// downstream consumer can still act on the half that did arrive; inner joins
/// simply drop it.
async fn salvage_expired(
    cfg: &JoinConfig,
    node_id: &str,
    correlation_value: &str,
    stale: JoinState,
    ctx: &ExecutionContext,
) {
    warn!(
        flow = %ctx.flow_id,
        node = node_id,
        correlation = correlation_value,
        "pending join expired before its pair arrived"
    );
    let partial = match cfg.join_strategy {
        PairStrategy::Inner => None,
        PairStrategy::Left => stale.stream_a.clone(),
        PairStrategy::Right => stale.stream_b.clone(),
    };
    let Some(partial) = partial else { return };
    emit_event(
        &ctx.store,
        EventRecord::new(
            "join_expired_partial",
            "join",
            json!({
                "flowId": ctx.flow_id,
                "nodeId": node_id,
                "traceId": ctx.trace_id,
                "correlationValue": correlation_value,
                "strategy": cfg.join_strategy,
                "partial": partial,
            }),
        ),
    )
    .await;
}

/// Classifies an arriving payload as stream A or B.
///
/// With identifiers configured the payload must match one of them; without
/// any, `None` defers to arrival order inside the store.
fn classify(cfg: &JoinConfig, payload: &Value) -> Result<Option<Stream>, EngineError> {
    if cfg.stream_a.is_none() && cfg.stream_b.is_none() {
        return Ok(None);
    }
    if matches_identifier(cfg.stream_a.as_ref(), payload) {
        return Ok(Some(Stream::A));
    }
    if matches_identifier(cfg.stream_b.as_ref(), payload) {
        return Ok(Some(Stream::B));
    }
    Err(EngineError::Classification(format!(
        "payload matches neither stream identifier of key `{}`",
        cfg.correlation_key
    )))
}

fn matches_identifier(ident: Option<&StreamIdentifier>, payload: &Value) -> bool {
    match ident {
        Some(ident) => lookup_path(payload, &ident.field) == Some(&ident.equals),
        None => false,
    }
}
