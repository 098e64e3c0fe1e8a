pub mod graph;
pub mod machine;
pub mod result;
pub mod state;

pub use graph::GraphRepresentation;
pub use machine::{compute_missing_inputs, TraversalMachine};
pub use result::TraversalResult;
pub use state::EdgeStateStore;
