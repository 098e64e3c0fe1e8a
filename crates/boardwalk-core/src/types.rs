use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{BoardwalkError, Result};

/// Node identifier, unique within one graph.
pub type NodeId = String;

/// Name of an input or output port.
pub type PortName = String;

/// Port name -> value map used for node inputs, outputs, and configuration.
pub type Values = serde_json::Map<String, serde_json::Value>;

/// Virtual source of the synthetic edges that start a traversal.
pub const ENTRY_NODE_ID: &str = "$entry";

/// Virtual descriptor id of the result that precedes the first real node.
pub const EMPTY_NODE_ID: &str = "$empty";

/// Output port that carries handler-reported errors.
pub const ERROR_PORT: &str = "$error";

/// Wildcard port: the whole output map travels along the edge.
pub const WILDCARD_PORT: &str = "*";

/// Node types the harness interprets itself instead of dispatching to a kit.
pub mod node_types {
    pub const INPUT: &str = "input";
    pub const OUTPUT: &str = "output";
    pub const SECRETS: &str = "secrets";
    pub const INVOKE: &str = "invoke";
}

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A node in a board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: NodeId,
    /// Handler name.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Static values merged under the node's wired inputs.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub configuration: Values,
    /// Keys the engine does not interpret (`metadata`, ...), kept for round-trips.
    #[serde(flatten)]
    pub extra: Values,
}

impl NodeDescriptor {
    pub fn new(id: impl Into<NodeId>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            configuration: Values::new(),
            extra: Values::new(),
        }
    }

    /// Set one configuration value.
    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.configuration.insert(key.into(), value);
        self
    }
}

/// A wire between an output port of one node and an input port of another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out: Option<PortName>,
    #[serde(rename = "in", default, skip_serializing_if = "Option::is_none")]
    pub in_port: Option<PortName>,
    /// The delivered value is retained and redelivered on every invocation.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub constant: bool,
    /// The target port is never required.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
    #[serde(flatten)]
    pub extra: Values,
}

impl Edge {
    /// Create a regular edge `from.out -> to.in`.
    pub fn new(
        from: impl Into<NodeId>,
        out: impl Into<PortName>,
        to: impl Into<NodeId>,
        in_port: impl Into<PortName>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            out: Some(out.into()),
            in_port: Some(in_port.into()),
            constant: false,
            optional: false,
            extra: Values::new(),
        }
    }

    /// Create a control edge that carries no value.
    pub fn control(from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            out: None,
            in_port: None,
            constant: false,
            optional: false,
            extra: Values::new(),
        }
    }

    /// Create a wildcard edge delivering the whole output map.
    pub fn wildcard(from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        Self {
            out: Some(WILDCARD_PORT.to_string()),
            ..Self::control(from, to)
        }
    }

    pub fn constant(mut self) -> Self {
        self.constant = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn is_wildcard(&self) -> bool {
        self.out.as_deref() == Some(WILDCARD_PORT)
    }

    /// The named input port this edge fills, if any.
    pub fn target_port(&self) -> Option<&str> {
        match self.in_port.as_deref() {
            None | Some("") | Some(WILDCARD_PORT) => None,
            Some(port) => Some(port),
        }
    }
}

/// A board: the static dataflow program.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub nodes: Vec<NodeDescriptor>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Nested boards addressable as `#id`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub graphs: BTreeMap<String, GraphDescriptor>,
    #[serde(flatten)]
    pub extra: Values,
}

impl GraphDescriptor {
    pub fn new(nodes: Vec<NodeDescriptor>, edges: Vec<Edge>) -> Self {
        Self {
            nodes,
            edges,
            ..Self::default()
        }
    }

    /// Parse a board from its JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        let graph: Self = serde_json::from_str(text)?;
        graph.validate()?;
        Ok(graph)
    }

    pub fn node(&self, id: &str) -> Option<&NodeDescriptor> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Ids of the nodes of a given type, in declaration order.
    pub fn nodes_of_type(&self, node_type: &str) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.node_type == node_type)
            .map(|n| n.id.clone())
            .collect()
    }

    /// Check node id uniqueness and edge endpoints, including nested graphs.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if node.id.is_empty() {
                return Err(BoardwalkError::InvalidGraph("node with empty id".into()));
            }
            if !ids.insert(node.id.as_str()) {
                return Err(BoardwalkError::InvalidGraph(format!(
                    "duplicate node id \"{}\"",
                    node.id
                )));
            }
        }

        let known = |id: &str| ids.contains(id) || is_reserved_id(id);
        for edge in &self.edges {
            for endpoint in [&edge.from, &edge.to] {
                if !known(endpoint) {
                    return Err(BoardwalkError::InvalidGraph(format!(
                        "edge {} -> {} references unknown node \"{}\"",
                        edge.from, edge.to, endpoint
                    )));
                }
            }
        }

        for (id, graph) in &self.graphs {
            graph.validate().map_err(|e| match e {
                BoardwalkError::InvalidGraph(msg) => {
                    BoardwalkError::InvalidGraph(format!("subgraph #{}: {}", id, msg))
                }
                other => other,
            })?;
        }
        Ok(())
    }
}

/// Context passed to node handlers during invocation.
#[derive(Clone)]
pub struct NodeHandlerContext {
    pub descriptor: NodeDescriptor,
    /// The top-level board of the run; nested `#id` boards resolve against it.
    pub outer_graph: Arc<GraphDescriptor>,
    pub invocation_path: Vec<usize>,
    /// Location relative to which board paths resolve.
    pub base: Option<String>,
    pub loader: Option<Arc<dyn crate::traits::GraphLoader>>,
    pub cancel: CancellationToken,
    output_sink: Option<mpsc::UnboundedSender<Values>>,
}

impl NodeHandlerContext {
    pub fn new(descriptor: NodeDescriptor, outer_graph: Arc<GraphDescriptor>) -> Self {
        Self {
            descriptor,
            outer_graph,
            invocation_path: Vec::new(),
            base: None,
            loader: None,
            cancel: CancellationToken::new(),
            output_sink: None,
        }
    }

    /// Route values passed to [`provide_output`](Self::provide_output) into `sink`.
    pub fn with_output_sink(mut self, sink: mpsc::UnboundedSender<Values>) -> Self {
        self.output_sink = Some(sink);
        self
    }

    /// Emit values as an `output` event while the handler is still running.
    /// Returns false when nobody listens.
    pub fn provide_output(&self, values: Values) -> bool {
        match &self.output_sink {
            Some(tx) => tx.send(values).is_ok(),
            None => false,
        }
    }
}

impl std::fmt::Debug for NodeHandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandlerContext")
            .field("descriptor", &self.descriptor.id)
            .field("invocation_path", &self.invocation_path)
            .field("base", &self.base)
            .field("loader", &self.loader.is_some())
            .field("output_sink", &self.output_sink.is_some())
            .finish()
    }
}

/// Ids that may appear as edge endpoints without a matching node.
pub fn is_reserved_id(id: &str) -> bool {
    id == ENTRY_NODE_ID || id == EMPTY_NODE_ID
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_board_json() {
        let text = r#"{
            "title": "Echo",
            "$schema": "https://example.com/board.schema.json",
            "nodes": [
                {"id": "a", "type": "input", "metadata": {"x": 10}},
                {"id": "b", "type": "output", "configuration": {"schema": {}}}
            ],
            "edges": [{"from": "a", "to": "b", "out": "text", "in": "text"}]
        }"#;
        let graph = GraphDescriptor::from_json(text).unwrap();
        assert_eq!(graph.title.as_deref(), Some("Echo"));
        assert_eq!(graph.nodes[0].node_type, "input");
        assert_eq!(graph.edges[0].in_port.as_deref(), Some("text"));
        assert!(graph.extra.contains_key("$schema"));
        assert_eq!(graph.nodes[0].extra["metadata"], json!({"x": 10}));
    }

    #[test]
    fn test_unknown_keys_survive_roundtrip() {
        let text = r#"{"nodes":[{"id":"a","type":"input","metadata":{"title":"A"}}],"edges":[],"metadata":{"tags":["t"]}}"#;
        let graph = GraphDescriptor::from_json(text).unwrap();
        let back: serde_json::Value = serde_json::to_value(&graph).unwrap();
        let orig: serde_json::Value = serde_json::from_str(text).unwrap();
        assert_eq!(back, orig);
    }

    #[test]
    fn test_edge_flags_default_false() {
        let edge: Edge = serde_json::from_str(r#"{"from":"a","to":"b","out":"x","in":"y"}"#).unwrap();
        assert!(!edge.constant);
        assert!(!edge.optional);
        let json = serde_json::to_value(&edge).unwrap();
        assert!(json.get("constant").is_none());
    }

    #[test]
    fn test_target_port() {
        assert_eq!(Edge::new("a", "x", "b", "y").target_port(), Some("y"));
        assert_eq!(Edge::wildcard("a", "b").target_port(), None);
        assert_eq!(Edge::control("a", "b").target_port(), None);
    }

    #[test]
    fn test_validate_rejects_dangling_edge() {
        let graph = GraphDescriptor::new(
            vec![NodeDescriptor::new("a", "input")],
            vec![Edge::new("a", "text", "missing", "in")],
        );
        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let graph = GraphDescriptor::new(
            vec![NodeDescriptor::new("a", "input"), NodeDescriptor::new("a", "output")],
            vec![],
        );
        assert!(matches!(
            graph.validate(),
            Err(BoardwalkError::InvalidGraph(_))
        ));
    }

    #[test]
    fn test_validate_checks_subgraphs() {
        let mut graph = GraphDescriptor::new(vec![NodeDescriptor::new("a", "input")], vec![]);
        graph.graphs.insert(
            "child".into(),
            GraphDescriptor::new(vec![], vec![Edge::control("x", "y")]),
        );
        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("subgraph #child"));
    }

    #[test]
    fn test_entry_edges_are_valid() {
        let graph = GraphDescriptor::new(
            vec![NodeDescriptor::new("a", "input")],
            vec![Edge::control(ENTRY_NODE_ID, "a")],
        );
        assert!(graph.validate().is_ok());
    }
}
