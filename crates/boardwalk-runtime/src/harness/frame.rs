use std::sync::Arc;

use boardwalk_core::error::Result;
use boardwalk_core::event::EventOrigin;
use boardwalk_core::types::{GraphDescriptor, NodeId, Values};

use crate::snapshot::{FrameInfo, ParentFrame};
use crate::traversal::{TraversalMachine, TraversalResult};

/// One level of the run's call stack: a board being traversed.
///
/// The bottom frame runs the top-level board; each `invoke` node pushes a
/// frame for its nested board and pops it when the child produces output or
/// runs out of work.
pub(crate) struct Frame {
    pub graph: Arc<GraphDescriptor>,
    pub machine: TraversalMachine,
    /// Path of the `invoke` node that opened this frame.
    pub path: Vec<usize>,
    /// Ids of the enclosing `invoke` nodes, outermost first.
    pub sources: Vec<NodeId>,
    /// Values that answer this frame's input nodes.
    pub args: Values,
    /// Steps taken so far; the next node visited gets this index.
    pub invocation_id: usize,
    pub produced_output: bool,
}

impl Frame {
    pub fn root(graph: Arc<GraphDescriptor>, args: Values) -> Result<Self> {
        let machine = TraversalMachine::new(&graph)?;
        Ok(Self {
            graph,
            machine,
            path: Vec::new(),
            sources: Vec::new(),
            args,
            invocation_id: 0,
            produced_output: false,
        })
    }

    pub fn child(
        graph: Arc<GraphDescriptor>,
        path: Vec<usize>,
        sources: Vec<NodeId>,
        args: Values,
    ) -> Result<Self> {
        let machine = TraversalMachine::new(&graph)?;
        Ok(Self {
            graph,
            machine,
            path,
            sources,
            args,
            invocation_id: 0,
            produced_output: false,
        })
    }

    /// Rebuild a frame from its saved position.
    pub fn restore(graph: Arc<GraphDescriptor>, info: FrameInfo, state: TraversalResult) -> Result<Self> {
        let machine = TraversalMachine::resume(&graph, state)?;
        Ok(Self {
            graph,
            machine,
            path: info.path,
            sources: info.sources,
            args: info.args,
            invocation_id: info.invocation_id,
            produced_output: info.produced_output,
        })
    }

    pub fn nesting(&self) -> usize {
        self.sources.len()
    }

    /// Record a step and return the path of the node it visits.
    pub fn next_path(&mut self) -> Vec<usize> {
        let path = self.path_at(self.invocation_id);
        self.invocation_id += 1;
        path
    }

    /// Path of the node most recently visited.
    pub fn current_path(&self) -> Vec<usize> {
        self.path_at(self.invocation_id.saturating_sub(1))
    }

    fn path_at(&self, index: usize) -> Vec<usize> {
        let mut path = self.path.clone();
        path.push(index);
        path
    }

    pub fn node_origin(&self) -> EventOrigin {
        EventOrigin {
            path: self.current_path(),
            nesting: self.nesting(),
            sources: self.sources.clone(),
        }
    }

    pub fn graph_origin(&self) -> EventOrigin {
        EventOrigin {
            path: self.path.clone(),
            nesting: self.nesting(),
            sources: self.sources.clone(),
        }
    }

    /// Saved form; the board is written for nested frames only.
    pub fn info(&self) -> FrameInfo {
        FrameInfo {
            graph: (self.nesting() > 0).then(|| self.graph.as_ref().clone()),
            path: self.path.clone(),
            invocation_id: self.invocation_id,
            sources: self.sources.clone(),
            // Top-level arguments travel as the snapshot's `inputs`.
            args: if self.nesting() > 0 {
                self.args.clone()
            } else {
                Values::new()
            },
            produced_output: self.produced_output,
        }
    }

    pub fn to_parent(&self) -> ParentFrame {
        ParentFrame {
            frame: self.info(),
            state: self.machine.current().clone(),
        }
    }
}
