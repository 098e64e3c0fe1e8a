use std::collections::{HashMap, HashSet};

use boardwalk_core::types::{Edge, GraphDescriptor, NodeDescriptor, NodeId, ENTRY_NODE_ID};

/// Lookup tables over a graph descriptor: nodes by id and edges by endpoint.
#[derive(Debug, Clone)]
pub struct GraphRepresentation {
    nodes: HashMap<NodeId, NodeDescriptor>,
    /// Incoming edges per node, in declaration order.
    heads: HashMap<NodeId, Vec<Edge>>,
    /// Outgoing edges per node, in declaration order.
    tails: HashMap<NodeId, Vec<Edge>>,
    /// Nodes without incoming edges, in declaration order.
    entries: Vec<NodeId>,
}

impl GraphRepresentation {
    pub fn new(descriptor: &GraphDescriptor) -> Self {
        let mut heads: HashMap<NodeId, Vec<Edge>> = HashMap::new();
        let mut tails: HashMap<NodeId, Vec<Edge>> = HashMap::new();
        for edge in &descriptor.edges {
            heads.entry(edge.to.clone()).or_default().push(edge.clone());
            tails.entry(edge.from.clone()).or_default().push(edge.clone());
        }

        let with_incoming: HashSet<&str> = descriptor
            .edges
            .iter()
            .filter(|e| e.from != ENTRY_NODE_ID)
            .map(|e| e.to.as_str())
            .collect();
        let entries = descriptor
            .nodes
            .iter()
            .filter(|n| !with_incoming.contains(n.id.as_str()))
            .map(|n| n.id.clone())
            .collect();

        let nodes = descriptor
            .nodes
            .iter()
            .map(|n| (n.id.clone(), n.clone()))
            .collect();

        Self {
            nodes,
            heads,
            tails,
            entries,
        }
    }

    pub fn node(&self, id: &str) -> Option<&NodeDescriptor> {
        self.nodes.get(id)
    }

    pub fn incoming(&self, id: &str) -> &[Edge] {
        self.heads.get(id).map_or(&[], Vec::as_slice)
    }

    pub fn outgoing(&self, id: &str) -> &[Edge] {
        self.tails.get(id).map_or(&[], Vec::as_slice)
    }

    pub fn entries(&self) -> &[NodeId] {
        &self.entries
    }
}
