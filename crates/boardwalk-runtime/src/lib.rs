pub mod harness;
pub mod invoke;
pub mod kit;
pub mod loader;
pub mod reanimation;
pub mod run_log;
pub mod snapshot;
pub mod traversal;

pub use harness::{Harness, PendingRequest, Run};
pub use invoke::{HandlerRegistry, Kit, NodeAction};
pub use kit::core_kit;
pub use loader::FileLoader;
pub use reanimation::{ReanimationState, Reanimator, VisitTracker};
pub use run_log::RunLogger;
pub use snapshot::{RunSnapshot, SnapshotKind};
pub use traversal::{EdgeStateStore, TraversalMachine, TraversalResult};
