//! Dynamic tenant-scoped webhook routing. Registrations live in a DashMap
//! keyed by `organization::slug`; HTTP dispatch resolves the slug and runs
//! the flow synchronously. Routing failures (unknown slug, wrong method,
//! disabled route or flow) answer with a bare status; everything past
//! routing gets the JSON envelope.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::flow::{FlowDefinition, RunStatus, TriggerSource};
use crate::pipeline::Orchestrator;
use crate::storage::FlowStore;

pub const ORGANIZATION_HEADER: &str = "x-organization-id";

#[derive(Debug, Clone, Serialize)]
pub struct WebhookRegistration {
    pub slug: String,
    pub flow_id: String,
    #[serde(rename = "organizationId")]
    pub organization_id: Option<String>,
    /// Upper-case verb, or `ANY`.
    pub method: String,
    pub enabled: bool,
    #[serde(rename = "registeredAt")]
    pub registered_at: DateTime<Utc>,
}

impl WebhookRegistration {
    fn key(&self) -> String {
        route_key(self.organization_id.as_deref(), &self.slug)
    }

    fn accepts(&self, method: &Method) -> bool {
        self.method == "ANY" || self.method == method.as_str()
    }
}

/// `org::slug` for tenant-scoped routes, bare slug for tenantless ones.
fn route_key(organization_id: Option<&str>, slug: &str) -> String {
    match organization_id {
        Some(org) => format!("{org}::{slug}"),
        None => slug.to_string(),
    }
}

pub struct WebhookRouter {
    routes: DashMap<String, WebhookRegistration>,
    store: Arc<dyn FlowStore>,
}

impl WebhookRouter {
    pub fn new(store: Arc<dyn FlowStore>) -> Arc<Self> {
        Arc::new(Self {
            routes: DashMap::new(),
            store,
        })
    }

    /// Registers the webhook route of a flow. The flow must exist, be
    /// enabled and declare a slug; the route key must be free.
    pub async fn register_webhook(
        &self,
        flow_id: &str,
    ) -> Result<WebhookRegistration, EngineError> {
        let flow = self
            .store
            .flow(flow_id)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("flow `{flow_id}` not registered")))?;
        self.register_flow(&flow)
    }

    fn register_flow(&self, flow: &FlowDefinition) -> Result<WebhookRegistration, EngineError> {
        if !flow.enabled {
            return Err(EngineError::Disabled(format!(
                "flow `{}` is disabled",
                flow.id
            )));
        }
        let Some(slug) = flow.webhook_slug.as_deref().filter(|_| flow.webhook_enabled) else {
            return Err(EngineError::Validation(format!(
                "flow `{}` is not webhook-capable",
                flow.id
            )));
        };

        let registration = WebhookRegistration {
            slug: slug.to_string(),
            flow_id: flow.id.clone(),
            organization_id: flow.organization_id.clone(),
            method: flow
                .webhook_method
                .as_deref()
                .map(str::to_uppercase)
                .unwrap_or_else(|| "ANY".to_string()),
            enabled: true,
            registered_at: Utc::now(),
        };

        match self.routes.entry(registration.key()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => Err(EngineError::Conflict(
                format!(
                    "slug `{}` already registered by flow `{}`",
                    slug,
                    existing.get().flow_id
                ),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                info!(slug, flow = %flow.id, "webhook registered");
                slot.insert(registration.clone());
                Ok(registration)
            }
        }
    }

    pub fn unregister_webhook(
        &self,
        organization_id: Option<&str>,
        slug: &str,
    ) -> Option<WebhookRegistration> {
        self.routes
            .remove(&route_key(organization_id, slug))
            .map(|(_, reg)| {
                info!(slug, flow = %reg.flow_id, "webhook unregistered");
                reg
            })
    }

    /// Re-registers a flow whose definition changed. Unregister-then-register
    /// as one operation: a failed re-register restores the old route.
    pub async fn update_webhook(
        &self,
        flow_id: &str,
    ) -> Result<WebhookRegistration, EngineError> {
        let previous = self
            .routes
            .iter()
            .find(|r| r.flow_id == flow_id)
            .map(|r| r.clone());
        if let Some(previous) = &previous {
            self.routes.remove(&previous.key());
        }
        match self.register_webhook(flow_id).await {
            Ok(registration) => Ok(registration),
            Err(err) => {
                if let Some(previous) = previous {
                    self.routes.insert(previous.key(), previous);
                }
                Err(err)
            }
        }
    }

    /// Registers every enabled, webhook-capable flow in the store. A flow
    /// that fails to register is logged and skipped.
    pub async fn sync_from_store(&self) -> usize {
        let mut registered = 0;
        for flow in self.store.all_flows().await {
            if !flow.is_webhook_capable() {
                continue;
            }
            match self.register_flow(&flow) {
                Ok(_) => registered += 1,
                Err(err) => warn!(flow = %flow.id, %err, "skipping webhook registration"),
            }
        }
        info!(registered, "webhook routes synced from store");
        registered
    }

    /// Flips a registration's enabled flag in place. A disabled route keeps
    /// its slug reserved but answers dispatches with 410.
    pub fn set_webhook_enabled(
        &self,
        organization_id: Option<&str>,
        slug: &str,
        enabled: bool,
    ) -> Result<WebhookRegistration, EngineError> {
        let mut registration = self
            .routes
            .get_mut(&route_key(organization_id, slug))
            .ok_or_else(|| EngineError::NotFound(format!("slug `{slug}` not registered")))?;
        registration.enabled = enabled;
        info!(slug, enabled, flow = %registration.flow_id, "webhook toggled");
        Ok(registration.clone())
    }

    pub fn lookup(
        &self,
        organization_id: Option<&str>,
        slug: &str,
    ) -> Option<WebhookRegistration> {
        self.routes
            .get(&route_key(organization_id, slug))
            .map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<WebhookRouter>,
    pub orchestrator: Arc<Orchestrator>,
}

pub fn http_router(state: AppState) -> Router {
    Router::new()
        .route("/webhook/:slug", any(dispatch))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `ANY /webhook/:slug`. Tenancy comes from the `x-organization-id` header.
async fn dispatch(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let organization_id = headers
        .get(ORGANIZATION_HEADER)
        .and_then(|v| v.to_str().ok());

    let Some(registration) = state.router.lookup(organization_id, &slug) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !registration.accepts(&method) {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    if !registration.enabled {
        return StatusCode::GONE.into_response();
    }

    let trace_id = Uuid::new_v4().to_string();
    let payload = if body.is_empty() {
        json!({})
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(value) => value,
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    &format!("body is not JSON: {e}"),
                    &trace_id,
                    None,
                );
            }
        }
    };

    match state
        .orchestrator
        .execute_flow(
            &registration.flow_id,
            payload,
            &trace_id,
            TriggerSource::Webhook,
        )
        .await
    {
        Ok(run) if run.status == RunStatus::Failed => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            run.error.as_deref().unwrap_or("flow execution failed"),
            &trace_id,
            Some(&run.run_id),
        ),
        Ok(run) => (
            StatusCode::OK,
            Json(json!({
                "ok": true,
                "traceId": run.trace_id,
                "runId": run.run_id,
                "status": run.status,
                "output": run.output,
                "executedNodes": run.executed_nodes,
                "durationMs": run.duration_ms,
            })),
        )
            .into_response(),
        // Disabled flows answer like disabled routes: bare 410, no envelope.
        Err(EngineError::Disabled(_)) => StatusCode::GONE.into_response(),
        Err(err) => error_response(err.http_status(), &err.to_string(), &trace_id, None),
    }
}

fn error_response(
    status: StatusCode,
    error: &str,
    trace_id: &str,
    run_id: Option<&str>,
) -> Response {
    let mut body = json!({
        "ok": false,
        "error": error,
        "traceId": trace_id,
    });
    if let Some(run_id) = run_id {
        body["runId"] = json!(run_id);
    }
    (status, Json(body)).into_response()
}
