use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::EngineError;

/// The canonical inbound envelope. Every message the worker dispatches is one
/// of these; legacy shapes are normalized into it, unrecognized shapes are a
/// validation error rather than a best-effort guess.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "version")]
pub enum Envelope {
    #[serde(rename = "v1")]
    V1 {
        #[serde(rename = "traceId")]
        trace_id: String,
        #[serde(rename = "flowId")]
        flow_id: String,
        payload: Value,
    },
}

impl Envelope {
    pub fn new(flow_id: impl Into<String>, payload: Value) -> Self {
        Envelope::V1 {
            trace_id: Uuid::new_v4().to_string(),
            flow_id: flow_id.into(),
            payload,
        }
    }

    pub fn trace_id(&self) -> &str {
        match self {
            Envelope::V1 { trace_id, .. } => trace_id,
        }
    }

    pub fn flow_id(&self) -> &str {
        match self {
            Envelope::V1 { flow_id, .. } => flow_id,
        }
    }

    pub fn payload(&self) -> &Value {
        match self {
            Envelope::V1 { payload, .. } => payload,
        }
    }

    pub fn into_payload(self) -> Value {
        match self {
            Envelope::V1 { payload, .. } => payload,
        }
    }

    /// Accepts the current envelope plus two historical message shapes:
    ///
    /// - discriminated envelope: `{"version":"v1","traceId":…,"flowId":…,"payload":…}`
    /// - canonical object: `{"flow":"<id>","data":{…}}`
    /// - raw object carrying a `flowId` field, everything else is the payload
    pub fn normalize(raw: &str) -> Result<Envelope, EngineError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| EngineError::Validation(format!("message is not JSON: {e}")))?;

        if value.get("version").is_some() {
            return serde_json::from_value(value)
                .map_err(|e| EngineError::Validation(format!("bad envelope: {e}")));
        }

        if let (Some(flow), Some(data)) = (
            value.get("flow").and_then(Value::as_str),
            value.get("data"),
        ) {
            return Ok(Envelope::new(flow, data.clone()));
        }

        if let Some(flow_id) = value.get("flowId").and_then(Value::as_str) {
            let flow_id = flow_id.to_string();
            let mut payload = value;
            if let Some(obj) = payload.as_object_mut() {
                obj.remove("flowId");
            }
            return Ok(Envelope::new(flow_id, payload));
        }

        Err(EngineError::Validation(
            "unrecognized message shape: expected a versioned envelope, a {flow,data} object, \
             or an object with a flowId field"
                .into(),
        ))
    }

    pub fn to_body(&self) -> Result<String, EngineError> {
        serde_json::to_string(self).map_err(|e| EngineError::Validation(e.to_string()))
    }
}

/// Unit of queued work as the provider sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub topic: String,
    pub body: String,
    pub trace_id: String,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl QueueMessage {
    pub fn new(topic: impl Into<String>, body: String, max_retries: u32) -> Self {
        // Peek the trace id out of the body so queue logs correlate with flow
        // runs; a fresh one is minted for bodies that carry none.
        let trace_id = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| {
                v.get("traceId")
                    .or_else(|| v.get("trace_id"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Self {
            topic: topic.into(),
            body,
            trace_id,
            retry_count: 0,
            max_retries,
        }
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_current_envelope() {
        let raw = json!({
            "version": "v1",
            "traceId": "t-1",
            "flowId": "orders",
            "payload": {"orderId": "42"}
        })
        .to_string();

        let env = Envelope::normalize(&raw).unwrap();
        assert_eq!(env.trace_id(), "t-1");
        assert_eq!(env.flow_id(), "orders");
        assert_eq!(env.payload(), &json!({"orderId": "42"}));
    }

    #[test]
    fn test_normalize_canonical_legacy_shape() {
        let raw = json!({"flow": "orders", "data": {"orderId": "42"}}).to_string();
        let env = Envelope::normalize(&raw).unwrap();
        assert_eq!(env.flow_id(), "orders");
        assert_eq!(env.payload(), &json!({"orderId": "42"}));
        assert!(!env.trace_id().is_empty());
    }

    #[test]
    fn test_normalize_raw_legacy_shape() {
        let raw = json!({"flowId": "orders", "orderId": "42"}).to_string();
        let env = Envelope::normalize(&raw).unwrap();
        assert_eq!(env.flow_id(), "orders");
        // flowId is stripped, the rest is the payload
        assert_eq!(env.payload(), &json!({"orderId": "42"}));
    }

    #[test]
    fn test_normalize_rejects_unknown_shape() {
        let err = Envelope::normalize(r#"{"hello":"world"}"#).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let err = Envelope::normalize("not json at all").unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_queue_message_picks_up_trace_id() {
        let env = Envelope::new("orders", json!({}));
        let trace = env.trace_id().to_string();
        let msg = QueueMessage::new("inbound-items", env.to_body().unwrap(), 3);
        assert_eq!(msg.trace_id, trace);
        assert_eq!(msg.retry_count, 0);
        assert!(!msg.retries_exhausted());
    }

    #[test]
    fn test_queue_message_mints_trace_id_when_absent() {
        let msg = QueueMessage::new("inbound-items", "{}".to_string(), 3);
        assert!(!msg.trace_id.is_empty());
    }
}
