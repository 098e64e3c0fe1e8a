use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use boardwalk_core::error::{BoardwalkError, Result, StalledNode};
use boardwalk_core::types::{
    Edge, NodeDescriptor, NodeId, PortName, Values, EMPTY_NODE_ID, ENTRY_NODE_ID,
};

use super::state::EdgeStateStore;
use crate::snapshot::tagged_map;

/// Snapshot of one traversal step.
///
/// Each step of the machine consumes the previous result and produces the
/// next one. `skip` is true exactly when `missing_inputs` is non-empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraversalResult {
    pub descriptor: NodeDescriptor,
    pub inputs: Values,
    pub missing_inputs: Vec<PortName>,
    /// The edge that led here.
    pub current: Edge,
    /// Edges still waiting to be traversed, front first.
    pub opportunities: VecDeque<Edge>,
    /// Outgoing edges of `descriptor`, appended once this step is processed.
    pub new_opportunities: Vec<Edge>,
    pub state: EdgeStateStore,
    /// Set by the harness once the node's outputs are known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Values>,
    /// Accumulated partial outputs of a streaming handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_outputs: Option<Values>,
    pub skip: bool,
    /// Nodes skipped since they last ran, with the ports they lacked.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty", with = "tagged_map")]
    pub stalled: BTreeMap<NodeId, Vec<PortName>>,
}

impl TraversalResult {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        descriptor: NodeDescriptor,
        inputs: Values,
        missing_inputs: Vec<PortName>,
        current: Edge,
        opportunities: VecDeque<Edge>,
        new_opportunities: Vec<Edge>,
        state: EdgeStateStore,
        stalled: BTreeMap<NodeId, Vec<PortName>>,
    ) -> Self {
        let skip = !missing_inputs.is_empty();
        Self {
            descriptor,
            inputs,
            missing_inputs,
            current,
            opportunities,
            new_opportunities,
            state,
            outputs: None,
            partial_outputs: None,
            skip,
            stalled,
        }
    }

    /// The placeholder result that precedes the first node: processing it
    /// does nothing, and its opportunities are one synthetic edge per entry.
    pub fn entry(entries: &[NodeId]) -> Self {
        let opportunities: VecDeque<Edge> = entries
            .iter()
            .map(|id| Edge::control(ENTRY_NODE_ID, id.clone()))
            .collect();
        let current = opportunities
            .front()
            .cloned()
            .unwrap_or_else(|| Edge::control(ENTRY_NODE_ID, EMPTY_NODE_ID));
        Self::new(
            NodeDescriptor::new(EMPTY_NODE_ID, EMPTY_NODE_ID),
            Values::new(),
            Vec::new(),
            current,
            opportunities,
            Vec::new(),
            EdgeStateStore::new(),
            BTreeMap::new(),
        )
    }

    pub fn is_entry(&self) -> bool {
        self.descriptor.id == EMPTY_NODE_ID
    }

    /// Reject snapshots whose fields contradict each other.
    pub fn validate(&self) -> Result<()> {
        if self.skip != !self.missing_inputs.is_empty() {
            return Err(BoardwalkError::Serialization(format!(
                "result for node \"{}\" has skip={} but {} missing input(s)",
                self.descriptor.id,
                self.skip,
                self.missing_inputs.len()
            )));
        }
        Ok(())
    }

    /// Stalled nodes in id order, for error reports.
    pub fn stalled_nodes(&self) -> Vec<StalledNode> {
        self.stalled
            .iter()
            .map(|(node, missing)| StalledNode {
                node: node.clone(),
                missing: missing.clone(),
            })
            .collect()
    }
}
