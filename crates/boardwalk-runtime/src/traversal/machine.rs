use tracing::{debug, trace};

use boardwalk_core::error::{BoardwalkError, Result};
use boardwalk_core::types::{Edge, GraphDescriptor, PortName, Values, ERROR_PORT, WILDCARD_PORT};

use super::graph::GraphRepresentation;
use super::result::TraversalResult;

/// Walks a graph one node at a time.
///
/// Every call to [`next`](Self::next) first processes the previous result
/// (consuming its inputs and wiring its outputs, or propagating past it when
/// it was skipped), then pops the next opportunity off the queue and computes
/// the inputs available to its target node. The caller invokes the node and
/// hands the outputs back with [`set_outputs`](Self::set_outputs) before
/// asking for the next step.
pub struct TraversalMachine {
    graph: GraphRepresentation,
    current: TraversalResult,
    done: bool,
}

impl TraversalMachine {
    /// Start a traversal at the graph's entry nodes.
    pub fn new(descriptor: &GraphDescriptor) -> Result<Self> {
        let graph = GraphRepresentation::new(descriptor);
        if graph.entries().is_empty() && !descriptor.nodes.is_empty() {
            return Err(BoardwalkError::NoEntryNode);
        }
        let current = TraversalResult::entry(graph.entries());
        Ok(Self {
            graph,
            current,
            done: false,
        })
    }

    /// Continue a traversal from a previously produced result.
    pub fn resume(descriptor: &GraphDescriptor, result: TraversalResult) -> Result<Self> {
        result.validate()?;
        let graph = GraphRepresentation::new(descriptor);
        if !result.is_entry() && graph.node(&result.descriptor.id).is_none() {
            return Err(BoardwalkError::Serialization(format!(
                "saved state refers to node \"{}\" which is not in the graph",
                result.descriptor.id
            )));
        }
        Ok(Self {
            graph,
            current: result,
            done: false,
        })
    }

    /// The most recently produced result.
    pub fn current(&self) -> &TraversalResult {
        &self.current
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Record the outputs of the current node.
    pub fn set_outputs(&mut self, outputs: Values) {
        self.current.outputs = Some(outputs);
    }

    /// Record the partial outputs accumulated so far by a streaming handler.
    pub fn set_partial_outputs(&mut self, partial: Values) {
        self.current.partial_outputs = Some(partial);
    }

    /// Advance to the next node. Returns `None` once no opportunities remain.
    pub fn next(&mut self) -> Result<Option<&TraversalResult>> {
        if self.done {
            return Ok(None);
        }
        self.process_current()?;

        let Some(opportunity) = self.current.opportunities.pop_front() else {
            debug!("No opportunities left, traversal complete");
            self.done = true;
            return Ok(None);
        };

        let to = opportunity.to.clone();
        let descriptor = self
            .graph
            .node(&to)
            .cloned()
            .ok_or_else(|| BoardwalkError::NodeNotFound(to.clone()))?;

        let mut inputs = descriptor.configuration.clone();
        inputs.extend(self.current.state.get_available_inputs(&to));
        let mut missing_inputs = compute_missing_inputs(self.graph.incoming(&to), &inputs);
        // Reached over a portless edge from a skipped node with nothing
        // delivered: the node is skipped too, so the chain keeps stalling.
        if missing_inputs.is_empty()
            && opportunity.target_port().is_none()
            && self.current.stalled.contains_key(&opportunity.from)
            && self.current.state.get_available_inputs(&to).is_empty()
        {
            let port = opportunity
                .in_port
                .clone()
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| WILDCARD_PORT.to_string());
            missing_inputs.push(port);
        }
        let new_opportunities = self.graph.outgoing(&to).to_vec();

        trace!(node_id = %to, missing = missing_inputs.len(), "Traversal step");

        let opportunities = std::mem::take(&mut self.current.opportunities);
        let state = std::mem::take(&mut self.current.state);
        let stalled = std::mem::take(&mut self.current.stalled);
        self.current = TraversalResult::new(
            descriptor,
            inputs,
            missing_inputs,
            opportunity,
            opportunities,
            new_opportunities,
            state,
            stalled,
        );
        Ok(Some(&self.current))
    }

    fn process_current(&mut self) -> Result<()> {
        let current = &mut self.current;
        let id = current.descriptor.id.clone();

        if current.skip {
            // Propagate past a skipped node once per distinct set of missing
            // ports; without this a cycle of skipped nodes never drains.
            if current.stalled.get(&id) != Some(&current.missing_inputs) {
                current.stalled.insert(id, current.missing_inputs.clone());
                let next = current.new_opportunities.clone();
                current.opportunities.extend(next);
            }
            return Ok(());
        }

        if let Some(error) = current.outputs.as_ref().and_then(|o| o.get(ERROR_PORT)) {
            let handled = current
                .new_opportunities
                .iter()
                .any(|e| e.out.as_deref() == Some(ERROR_PORT));
            if !handled {
                return Err(BoardwalkError::handler(id, describe_error(error)));
            }
        }

        let outputs = current.outputs.take().unwrap_or_default();
        current.stalled.remove(&id);
        current.state.use_inputs(&id, &current.inputs);
        current
            .opportunities
            .extend(current.new_opportunities.iter().cloned());
        current.state.wire_outputs(&current.new_opportunities, &outputs);
        Ok(())
    }
}

/// Required ports (named, non-optional incoming edges) not present in `inputs`,
/// in edge declaration order.
pub fn compute_missing_inputs(incoming: &[Edge], inputs: &Values) -> Vec<PortName> {
    let mut missing: Vec<PortName> = Vec::new();
    for edge in incoming.iter().filter(|e| !e.optional) {
        if let Some(port) = edge.target_port() {
            if !inputs.contains_key(port) && !missing.iter().any(|m| m == port) {
                missing.push(port.to_string());
            }
        }
    }
    missing
}

fn describe_error(error: &serde_json::Value) -> String {
    error
        .get("message")
        .and_then(|m| m.as_str())
        .or_else(|| error.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}
