use std::{
    collections::{HashMap, HashSet},
    fs,
    path::Path,
};

use chrono::{DateTime, Utc};
use petgraph::{
    graph::NodeIndex,
    prelude::StableDiGraph,
    visit::{Topo, Walker},
    Direction,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tracing::{error, info};

use crate::error::EngineError;
use crate::node::NodeKind;

/// A tenant's processing graph. Created and edited by the (external) flow
/// editor; read-only to the engine core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: String,
    #[serde(rename = "organizationId", default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default = "FlowDefinition::default_enabled")]
    pub enabled: bool,
    #[serde(rename = "webhookSlug", default)]
    pub webhook_slug: Option<String>,
    #[serde(rename = "webhookEnabled", default)]
    pub webhook_enabled: bool,
    #[serde(rename = "webhookMethod", default)]
    pub webhook_method: Option<String>,
    #[serde(default)]
    pub version: u32,

    /// node_id → node configuration
    #[serde(
        deserialize_with = "deserialize_nodes_with_id",
        serialize_with = "serialize_nodes"
    )]
    pub nodes: HashMap<String, NodeConfig>,

    /// adjacency: from node_id → list of to node_ids
    #[serde(default)]
    pub connections: HashMap<String, Vec<String>>,

    #[serde(skip)]
    graph: StableDiGraph<NodeConfig, ()>,
    #[serde(skip)]
    index_of: HashMap<String, NodeIndex>,
    #[serde(skip)]
    plan: Vec<NodeIndex>,
    #[serde(skip)]
    entry: Option<String>,
}

/// A single node's config in the flow.
#[derive(Debug, Clone, Serialize)]
pub struct NodeConfig {
    #[serde(skip)]
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
}

// matches the JSON shape of a node, minus the `id` field
#[derive(Deserialize, Serialize)]
struct RawNodeConfig {
    #[serde(flatten)]
    kind: NodeKind,
}

// re-use the normal Serde impl for the map, then inject the key as `id`
fn deserialize_nodes_with_id<'de, D>(deserializer: D) -> Result<HashMap<String, NodeConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: HashMap<String, RawNodeConfig> = HashMap::deserialize(deserializer)?;
    let mut out = HashMap::with_capacity(raw.len());
    for (key, r) in raw {
        out.insert(
            key.clone(),
            NodeConfig {
                id: key,
                kind: r.kind,
            },
        );
    }
    Ok(out)
}

fn serialize_nodes<S>(nodes: &HashMap<String, NodeConfig>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    use serde::ser::SerializeMap;
    let mut map = serializer.serialize_map(Some(nodes.len()))?;
    for (k, v) in nodes {
        let raw = RawNodeConfig {
            kind: v.kind.clone(),
        };
        map.serialize_entry(k, &raw)?;
    }
    map.end()
}

impl FlowDefinition {
    fn default_enabled() -> bool {
        true
    }

    /// Builds the internal graph: connects nodes, rejects cycles and dangling
    /// edges, finds the single entry node and precomputes the topological
    /// execution plan reachable from it.
    pub fn build(mut self) -> Result<Self, EngineError> {
        let mut graph = StableDiGraph::new();
        let mut index_of = HashMap::new();

        for (nid, cfg) in &self.nodes {
            let idx = graph.add_node(cfg.clone());
            index_of.insert(nid.clone(), idx);
        }

        for (from, tos) in &self.connections {
            let &i = index_of.get(from).ok_or_else(|| {
                EngineError::Validation(format!(
                    "flow `{}`: connection from unknown node `{}`",
                    self.id, from
                ))
            })?;
            for to in tos {
                let &j = index_of.get(to).ok_or_else(|| {
                    EngineError::Validation(format!(
                        "flow `{}`: connection to unknown node `{}`",
                        self.id, to
                    ))
                })?;
                graph.add_edge(i, j, ());
            }
        }

        if petgraph::algo::is_cyclic_directed(&graph) {
            return Err(EngineError::Validation(format!(
                "flow `{}` has cycles",
                self.id
            )));
        }

        // an error-handler must guard a node that exists
        for cfg in self.nodes.values() {
            if let NodeKind::ErrorHandler { error_handler } = &cfg.kind {
                if !self.nodes.contains_key(&error_handler.guards) {
                    return Err(EngineError::Validation(format!(
                        "flow `{}`: error handler `{}` guards unknown node `{}`",
                        self.id, cfg.id, error_handler.guards
                    )));
                }
            }
        }

        // entry = the unique non-handler node with no incoming edges; error
        // handlers attach through `guards`, not graph edges, so a detached
        // one is not an entry candidate
        let mut entries: Vec<&String> = self
            .nodes
            .iter()
            .filter(|(_, cfg)| !matches!(cfg.kind, NodeKind::ErrorHandler { .. }))
            .map(|(nid, _)| nid)
            .filter(|nid| {
                graph
                    .neighbors_directed(index_of[*nid], Direction::Incoming)
                    .next()
                    .is_none()
            })
            .collect();
        entries.sort();

        let entry = match entries.as_slice() {
            [one] => (*one).clone(),
            [] => {
                return Err(EngineError::Validation(format!(
                    "flow `{}` has no entry node",
                    self.id
                )))
            }
            many => {
                return Err(EngineError::Validation(format!(
                    "flow `{}` has multiple entry nodes: {:?}",
                    self.id, many
                )))
            }
        };

        // full topological order once, filtered down to what the entry reaches
        let full_order: Vec<NodeIndex> = Topo::new(&graph).iter(&graph).collect();
        let mut reachable = HashSet::new();
        let mut stack = vec![index_of[&entry]];
        while let Some(n) = stack.pop() {
            if reachable.insert(n) {
                for succ in graph.neighbors_directed(n, Direction::Outgoing) {
                    stack.push(succ);
                }
            }
        }
        let plan = full_order
            .into_iter()
            .filter(|ix| reachable.contains(ix))
            .collect();

        self.plan = plan;
        self.graph = graph;
        self.index_of = index_of;
        self.entry = Some(entry);
        Ok(self)
    }

    pub fn entry(&self) -> Option<&str> {
        self.entry.as_deref()
    }

    /// Execution order from the entry node, as `(node_id, kind)` pairs.
    pub fn plan(&self) -> Vec<&NodeConfig> {
        self.plan.iter().map(|&ix| &self.graph[ix]).collect()
    }

    pub fn predecessors(&self, node_id: &str) -> Vec<&str> {
        match self.index_of.get(node_id) {
            Some(&ix) => self
                .graph
                .neighbors_directed(ix, Direction::Incoming)
                .map(|p| self.graph[p].id.as_str())
                .collect(),
            None => Vec::new(),
        }
    }

    /// True when this flow can be reached over HTTP: either the flag is set
    /// or any node declares itself a webhook trigger via its slug.
    pub fn is_webhook_capable(&self) -> bool {
        self.webhook_enabled && self.webhook_slug.is_some()
    }

    pub fn load_from_file(path: &Path) -> Result<FlowDefinition, EngineError> {
        let json = fs::read_to_string(path)
            .map_err(|e| EngineError::Validation(format!("read error: {e}")))?;
        let flow: FlowDefinition = serde_json::from_str(&json)
            .map_err(|e| EngineError::Validation(format!("parse error: {e}")))?;
        flow.build()
    }

    /// Loads every `.flow.json` file under `dir`. One bad file is logged and
    /// skipped, it never aborts the load.
    pub fn load_all_from_dir(dir: &Path) -> Vec<FlowDefinition> {
        let mut flows = Vec::new();
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                error!("cannot read flow dir {}: {}", dir.display(), e);
                return flows;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let is_flow_file = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(".flow.json"))
                .unwrap_or(false);
            if !is_flow_file {
                continue;
            }
            match Self::load_from_file(&path) {
                Ok(flow) => {
                    info!("loaded flow `{}` from {}", flow.id, path.display());
                    flows.push(flow);
                }
                Err(e) => error!("failed to load {}: {}", path.display(), e),
            }
        }
        flows
    }
}

/// Where an execution was triggered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Webhook,
    Queue,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

/// One record per executed node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    /// `emitted`, `waiting`, `recovered` or `failed`
    pub disposition: String,
}

/// One execution instance of a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRun {
    pub run_id: String,
    pub flow_id: String,
    pub trace_id: String,
    pub trigger: TriggerSource,
    pub status: RunStatus,
    pub executed_nodes: Vec<NodeRecord>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: i64,
    pub started_at: DateTime<Utc>,
}

impl FlowRun {
    pub fn start(flow_id: &str, trace_id: &str, trigger: TriggerSource) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            flow_id: flow_id.to_string(),
            trace_id: trace_id.to_string(),
            trigger,
            status: RunStatus::Running,
            executed_nodes: Vec::new(),
            output: None,
            error: None,
            duration_ms: 0,
            started_at: Utc::now(),
        }
    }

    pub fn finish_completed(mut self, output: Option<Value>) -> Self {
        self.status = RunStatus::Completed;
        self.output = output;
        self.duration_ms = (Utc::now() - self.started_at).num_milliseconds();
        self
    }

    pub fn finish_failed(mut self, error: String) -> Self {
        self.status = RunStatus::Failed;
        self.error = Some(error);
        self.duration_ms = (Utc::now() - self.started_at).num_milliseconds();
        self
    }
}
