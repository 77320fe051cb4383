use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::error::EngineError;

/// Addresses one pending pairwise correlation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JoinKey {
    pub flow_id: String,
    pub node_id: String,
    pub correlation_value: String,
}

impl JoinKey {
    pub fn new(
        flow_id: impl Into<String>,
        node_id: impl Into<String>,
        correlation_value: impl Into<String>,
    ) -> Self {
        Self {
            flow_id: flow_id.into(),
            node_id: node_id.into(),
            correlation_value: correlation_value.into(),
        }
    }

    fn storage_key(&self) -> String {
        format!(
            "{}::{}::{}",
            self.flow_id, self.node_id, self.correlation_value
        )
    }
}

impl fmt::Display for JoinKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.storage_key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stream {
    A,
    B,
}

impl Stream {
    pub fn opposite(self) -> Stream {
        match self {
            Stream::A => Stream::B,
            Stream::B => Stream::A,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Stream::A => "a",
            Stream::B => "b",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStatus {
    WaitingA,
    WaitingB,
    Matched,
    Expired,
}

/// Pending (or just-matched) correlation between two named streams.
/// Invariant: exactly one of `stream_a`/`stream_b` is set while waiting;
/// both are set only when matched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinState {
    pub flow_id: String,
    pub node_id: String,
    pub correlation_value: String,
    pub stream_a: Option<Value>,
    pub stream_b: Option<Value>,
    pub status: JoinStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl JoinState {
    fn waiting(key: &JoinKey, stream: Stream, payload: Value, ttl: Duration) -> Self {
        let now = Utc::now();
        let (stream_a, stream_b, status) = match stream {
            Stream::A => (Some(payload), None, JoinStatus::WaitingA),
            Stream::B => (None, Some(payload), JoinStatus::WaitingB),
        };
        Self {
            flow_id: key.flow_id.clone(),
            node_id: key.node_id.clone(),
            correlation_value: key.correlation_value.clone(),
            stream_a,
            stream_b,
            status,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn waiting_stream(&self) -> Option<Stream> {
        match self.status {
            JoinStatus::WaitingA => Some(Stream::A),
            JoinStatus::WaitingB => Some(Stream::B),
            _ => None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Outcome of the atomic pairwise upsert.
#[derive(Debug, Clone)]
pub enum PairwiseOutcome {
    /// First arrival for this correlation value: state persisted, the flow
    /// suspends and resumes when the pair arrives. Carries the expired state
    /// this arrival displaced, if any.
    Waiting(Option<JoinState>),
    /// Second arrival from the opposite stream: both payloads, state removed.
    Matched(JoinState),
    /// Second arrival from the *same* stream: configuration or data error,
    /// rejected instead of silently overwriting.
    SameStreamConflict(JoinState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanInStrategy {
    All,
    Any,
    Majority,
    Minimum,
    Timeout,
}

impl FanInStrategy {
    fn is_complete(self, received: usize, required: usize, minimum: usize) -> bool {
        match self {
            FanInStrategy::All => received >= required,
            FanInStrategy::Any => received >= 1,
            FanInStrategy::Majority => received * 2 > required,
            FanInStrategy::Minimum => received >= minimum,
            // only the timeout callback completes this one
            FanInStrategy::Timeout => false,
        }
    }
}

/// In-flight count-based join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingFanIn {
    pub join_id: String,
    pub required: usize,
    pub received: Vec<Value>,
    pub strategy: FanInStrategy,
    pub created_at: DateTime<Utc>,
}

/// Result of one atomic append-and-check.
#[derive(Debug, Clone)]
pub struct FanInAppend {
    pub first_arrival: bool,
    pub received: usize,
    pub required: usize,
    /// Set exactly when the append completed the join; the pending state has
    /// been removed in the same operation.
    pub payloads: Option<Vec<Value>>,
}

/// Durable-or-in-memory state for pending joins, keyed by
/// `(flow, node, correlation value)` for pairwise and `join_id` for fan-in.
///
/// Both upsert operations are atomic: two near-simultaneous arrivals for the
/// same key must never both observe "no pending state".
#[async_trait]
pub trait CorrelationStore: Send + Sync {
    /// Insert-or-match in one step. `arrival` is the classified stream, or
    /// `None` to classify by arrival order (first = A, second = B).
    /// An expired pending state is dropped and treated as absent, starting a
    /// new correlation cycle.
    async fn upsert_pairwise(
        &self,
        key: &JoinKey,
        arrival: Option<Stream>,
        payload: Value,
        ttl: Duration,
    ) -> Result<PairwiseOutcome, EngineError>;

    /// The pending state for a key, if any (inspection).
    async fn pending_pairwise(&self, key: &JoinKey) -> Option<JoinState>;

    /// Removes a pending state if it is still waiting; used by sweeps.
    async fn expire_pairwise(&self, key: &JoinKey) -> Option<JoinState>;

    /// Atomic append-and-check-completion. The first arrival establishes the
    /// required count (hint, default 2) and reports `first_arrival = true` so
    /// the caller can schedule a timeout.
    async fn append_fanin(
        &self,
        join_id: &str,
        payload: Value,
        required_hint: Option<usize>,
        minimum: usize,
        strategy: FanInStrategy,
    ) -> Result<FanInAppend, EngineError>;

    /// Removes and returns the pending fan-in state (timeout path).
    async fn take_fanin(&self, join_id: &str) -> Option<PendingFanIn>;
}

/// Reference implementation over DashMap entry operations; every upsert runs
/// under the shard lock for its key, which makes check-then-insert atomic.
pub struct InMemoryCorrelationStore {
    pairwise: DashMap<String, JoinState>,
    fanin: DashMap<String, PendingFanIn>,
}

impl InMemoryCorrelationStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pairwise: DashMap::new(),
            fanin: DashMap::new(),
        })
    }
}

#[async_trait]
impl CorrelationStore for InMemoryCorrelationStore {
    async fn upsert_pairwise(
        &self,
        key: &JoinKey,
        arrival: Option<Stream>,
        payload: Value,
        ttl: Duration,
    ) -> Result<PairwiseOutcome, EngineError> {
        let now = Utc::now();
        match self.pairwise.entry(key.storage_key()) {
            Entry::Vacant(slot) => {
                let stream = arrival.unwrap_or(Stream::A);
                slot.insert(JoinState::waiting(key, stream, payload, ttl));
                Ok(PairwiseOutcome::Waiting(None))
            }
            Entry::Occupied(mut slot) => {
                if slot.get().is_expired(now) {
                    // stale cycle: replace in place, new cycle starts here
                    let stream = arrival.unwrap_or(Stream::A);
                    let mut stale = slot.insert(JoinState::waiting(key, stream, payload, ttl));
                    stale.status = JoinStatus::Expired;
                    return Ok(PairwiseOutcome::Waiting(Some(stale)));
                }

                let waiting = slot.get().waiting_stream().ok_or_else(|| {
                    EngineError::Execution(format!(
                        "join state for {key} is neither waiting nor expired"
                    ))
                })?;

                if arrival == Some(waiting) {
                    return Ok(PairwiseOutcome::SameStreamConflict(slot.get().clone()));
                }

                let mut state = slot.remove();
                match waiting.opposite() {
                    Stream::A => state.stream_a = Some(payload),
                    Stream::B => state.stream_b = Some(payload),
                }
                state.status = JoinStatus::Matched;
                Ok(PairwiseOutcome::Matched(state))
            }
        }
    }

    async fn pending_pairwise(&self, key: &JoinKey) -> Option<JoinState> {
        self.pairwise.get(&key.storage_key()).map(|s| s.clone())
    }

    async fn expire_pairwise(&self, key: &JoinKey) -> Option<JoinState> {
        match self.pairwise.entry(key.storage_key()) {
            Entry::Occupied(slot) if slot.get().waiting_stream().is_some() => {
                let mut state = slot.remove();
                state.status = JoinStatus::Expired;
                Some(state)
            }
            _ => None,
        }
    }

    async fn append_fanin(
        &self,
        join_id: &str,
        payload: Value,
        required_hint: Option<usize>,
        minimum: usize,
        strategy: FanInStrategy,
    ) -> Result<FanInAppend, EngineError> {
        match self.fanin.entry(join_id.to_string()) {
            Entry::Vacant(slot) => {
                let required = required_hint.unwrap_or(2).max(1);
                let pending = PendingFanIn {
                    join_id: join_id.to_string(),
                    required,
                    received: vec![payload],
                    strategy,
                    created_at: Utc::now(),
                };
                if strategy.is_complete(1, required, minimum) {
                    return Ok(FanInAppend {
                        first_arrival: true,
                        received: 1,
                        required,
                        payloads: Some(pending.received),
                    });
                }
                slot.insert(pending);
                Ok(FanInAppend {
                    first_arrival: true,
                    received: 1,
                    required,
                    payloads: None,
                })
            }
            Entry::Occupied(mut slot) => {
                let pending = slot.get_mut();
                pending.received.push(payload);
                let received = pending.received.len();
                let required = pending.required;
                if pending.strategy.is_complete(received, required, minimum) {
                    let pending = slot.remove();
                    return Ok(FanInAppend {
                        first_arrival: false,
                        received,
                        required,
                        payloads: Some(pending.received),
                    });
                }
                Ok(FanInAppend {
                    first_arrival: false,
                    received,
                    required,
                    payloads: None,
                })
            }
        }
    }

    async fn take_fanin(&self, join_id: &str) -> Option<PendingFanIn> {
        self.fanin.remove(join_id).map(|(_, pending)| pending)
    }
}
