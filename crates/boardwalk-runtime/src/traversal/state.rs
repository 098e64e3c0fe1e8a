use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use boardwalk_core::types::{Edge, NodeId, PortName, Values};

use crate::snapshot::tagged_map;

/// Pending values for the ports of one node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortQueues(#[serde(with = "tagged_map")] pub BTreeMap<PortName, VecDeque<Value>>);

/// Retained values for the constant ports of one node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortConstants(#[serde(with = "tagged_map")] pub BTreeMap<PortName, Value>);

/// Values travelling along edges, keyed by (target node, input port).
///
/// Regular edges feed FIFO queues that are drained one value per invocation.
/// Constant edges overwrite a slot that stays available for every later
/// invocation; a queued value takes precedence over the constant on the same port.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeStateStore {
    #[serde(with = "tagged_map")]
    state: BTreeMap<NodeId, PortQueues>,
    #[serde(with = "tagged_map")]
    constants: BTreeMap<NodeId, PortConstants>,
}

impl EdgeStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a node's outputs along its outgoing edges.
    ///
    /// `out = "*"` spreads every output key into the same-named port, unless the
    /// edge names an input port, in which case the whole map arrives there as
    /// one object. `null` values are not delivered.
    pub fn wire_outputs(&mut self, opportunities: &[Edge], outputs: &Values) {
        for edge in opportunities {
            let Some(out) = edge.out.as_deref() else {
                continue;
            };
            if edge.is_wildcard() {
                match edge.target_port() {
                    Some(port) => {
                        let whole = Value::Object(outputs.clone());
                        self.deliver(edge, port, whole);
                    }
                    None => {
                        for (key, value) in outputs {
                            if !value.is_null() {
                                self.deliver(edge, key, value.clone());
                            }
                        }
                    }
                }
                continue;
            }
            let Some(port) = edge.target_port() else {
                continue;
            };
            match outputs.get(out) {
                Some(value) if !value.is_null() => self.deliver(edge, port, value.clone()),
                _ => {}
            }
        }
    }

    fn deliver(&mut self, edge: &Edge, port: &str, value: Value) {
        if edge.constant {
            self.constants
                .entry(edge.to.clone())
                .or_default()
                .0
                .insert(port.to_string(), value);
        } else {
            self.state
                .entry(edge.to.clone())
                .or_default()
                .0
                .entry(port.to_string())
                .or_default()
                .push_back(value);
        }
    }

    /// One value per available port: the queue head, else the constant.
    /// Nothing is consumed.
    pub fn get_available_inputs(&self, node: &str) -> Values {
        let mut result = Values::new();
        if let Some(constants) = self.constants.get(node) {
            for (port, value) in &constants.0 {
                result.insert(port.clone(), value.clone());
            }
        }
        if let Some(queues) = self.state.get(node) {
            for (port, queue) in &queues.0 {
                if let Some(head) = queue.front() {
                    result.insert(port.clone(), head.clone());
                }
            }
        }
        result
    }

    /// Dequeue one value from every regular port named in `inputs`.
    pub fn use_inputs(&mut self, node: &str, inputs: &Values) {
        let Some(queues) = self.state.get_mut(node) else {
            return;
        };
        for port in inputs.keys() {
            if let Some(queue) = queues.0.get_mut(port) {
                queue.pop_front();
                if queue.is_empty() {
                    queues.0.remove(port);
                }
            }
        }
        if queues.0.is_empty() {
            self.state.remove(node);
        }
    }

    /// Number of values waiting on a regular port.
    pub fn queued(&self, node: &str, port: &str) -> usize {
        self.state
            .get(node)
            .and_then(|q| q.0.get(port))
            .map_or(0, VecDeque::len)
    }

    pub fn constant(&self, node: &str, port: &str) -> Option<&Value> {
        self.constants.get(node).and_then(|c| c.0.get(port))
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty() && self.constants.is_empty()
    }
}
