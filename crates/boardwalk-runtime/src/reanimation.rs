use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use boardwalk_core::types::{NodeId, Values};

/// Serializable record of the path last taken to reach each visited node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReanimationState {
    /// `[node, path]` pairs in first-visit order.
    #[serde(default)]
    pub visits: Vec<(NodeId, Vec<usize>)>,
}

/// Records one path per node as a run progresses.
///
/// A node reached again (a loop, or a second wire into it) overwrites its
/// earlier path, so only the most recent visit survives.
#[derive(Debug, Clone, Default)]
pub struct VisitTracker {
    visits: Vec<(NodeId, Vec<usize>)>,
}

impl VisitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: ReanimationState) -> Self {
        Self {
            visits: state.visits,
        }
    }

    pub fn visit(&mut self, node: &str, path: &[usize]) {
        match self.visits.iter_mut().find(|(id, _)| id == node) {
            Some((_, last)) => *last = path.to_vec(),
            None => self.visits.push((node.to_string(), path.to_vec())),
        }
    }

    pub fn path_for(&self, node: &str) -> Option<&[usize]> {
        self.visits
            .iter()
            .find(|(id, _)| id == node)
            .map(|(_, path)| path.as_slice())
    }

    pub fn state(&self) -> ReanimationState {
        ReanimationState {
            visits: self.visits.clone(),
        }
    }
}

/// Answers input requests that a previous run already satisfied.
///
/// An answer is given when the requesting node was recorded at exactly the
/// same path. Each answer is handed out once. As soon as the run reaches a
/// path beyond the last recorded one, the reanimator goes quiet for good.
#[derive(Debug, Clone)]
pub struct Reanimator {
    recorded: VisitTracker,
    horizon: Option<Vec<usize>>,
    known: BTreeMap<NodeId, Values>,
    exhausted: bool,
}

impl Reanimator {
    pub fn new(state: ReanimationState, known_inputs: BTreeMap<NodeId, Values>) -> Self {
        let horizon = state.visits.iter().map(|(_, path)| path.clone()).max();
        Self {
            recorded: VisitTracker::from_state(state),
            horizon,
            known: known_inputs,
            exhausted: false,
        }
    }

    /// The values previously supplied to `node`, if this request is a replay.
    pub fn replay(&mut self, node: &str, path: &[usize]) -> Option<Values> {
        if self.exhausted {
            return None;
        }
        match &self.horizon {
            Some(horizon) if path <= horizon.as_slice() => {}
            _ => {
                debug!(node_id = %node, ?path, "Run passed the recorded prefix");
                self.exhausted = true;
                return None;
            }
        }
        if self.recorded.path_for(node) != Some(path) {
            return None;
        }
        let values = self.known.remove(node)?;
        debug!(node_id = %node, ?path, "Replaying recorded input");
        Some(values)
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}
