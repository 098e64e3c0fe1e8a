mod frame;
mod run;

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use boardwalk_core::config::HarnessConfig;
use boardwalk_core::error::{BoardwalkError, Result};
use boardwalk_core::event::EventBus;
use boardwalk_core::traits::GraphLoader;
use boardwalk_core::types::{GraphDescriptor, NodeId, Values};

use crate::invoke::HandlerRegistry;
use crate::reanimation::{ReanimationState, Reanimator, VisitTracker};
use crate::snapshot::RunSnapshot;

use frame::Frame;
pub use run::{PendingRequest, Run};

/// Starts and resumes runs of boards.
///
/// A harness is cheap to clone; every run it starts shares the handler
/// registry, loader, event bus and cancellation token.
#[derive(Clone)]
pub struct Harness {
    registry: Arc<HandlerRegistry>,
    config: HarnessConfig,
    loader: Option<Arc<dyn GraphLoader>>,
    bus: Option<Arc<EventBus>>,
    base: Option<String>,
    cancel: CancellationToken,
}

impl Harness {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            config: HarnessConfig::default(),
            loader: None,
            bus: None,
            base: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: HarnessConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_loader(mut self, loader: impl GraphLoader) -> Self {
        self.loader = Some(Arc::new(loader));
        self
    }

    /// Publish every event to `bus` as well.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Location relative board paths resolve against.
    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn run(&self, graph: GraphDescriptor) -> Run {
        Run::start(self.clone(), Arc::new(graph), Values::new(), None)
    }

    /// Run with values that answer top-level input nodes whose required keys
    /// they contain.
    pub fn run_with_inputs(&self, graph: GraphDescriptor, inputs: Values) -> Run {
        Run::start(self.clone(), Arc::new(graph), inputs, None)
    }

    /// Run `graph` from the start, answering the input requests recorded in
    /// `state` from `known_inputs` instead of suspending again.
    pub fn reanimate(
        &self,
        graph: GraphDescriptor,
        state: ReanimationState,
        known_inputs: BTreeMap<NodeId, Values>,
    ) -> Run {
        let reanimator = Reanimator::new(state, known_inputs);
        Run::start(self.clone(), Arc::new(graph), Values::new(), Some(reanimator))
    }

    /// Continue a saved run, with `values` as the outputs of the node it was
    /// waiting on.
    pub fn resume(&self, graph: GraphDescriptor, snapshot: RunSnapshot, values: Values) -> Result<Run> {
        snapshot.validate()?;
        graph.validate()?;
        let root = Arc::new(graph);

        let RunSnapshot {
            state,
            frame,
            parents,
            reanimation,
            inputs,
            ..
        } = snapshot;
        let mut levels: Vec<_> = parents.into_iter().map(|p| (p.frame, p.state)).collect();
        levels.push((frame, state));

        let mut frames = Vec::with_capacity(levels.len());
        for (depth, (mut info, state)) in levels.into_iter().enumerate() {
            let graph = if depth == 0 {
                root.clone()
            } else {
                let nested = info.graph.take().ok_or_else(|| {
                    BoardwalkError::Serialization(format!(
                        "nested frame at depth {} is missing its board",
                        depth
                    ))
                })?;
                Arc::new(nested)
            };
            let mut restored = Frame::restore(graph, info, state)?;
            if depth == 0 {
                restored.args = inputs.clone();
            }
            frames.push(restored);
        }

        Ok(Run::restored(
            self.clone(),
            root,
            frames,
            VisitTracker::from_state(reanimation),
            values,
        ))
    }

    /// Run until the first top-level output and return it.
    ///
    /// Input nodes are answered from `inputs`; a request `inputs` cannot
    /// answer is an error.
    pub async fn run_once(&self, graph: GraphDescriptor, inputs: Values) -> Result<Values> {
        let mut harness = self.clone();
        harness.config.stop_on_output = true;
        let mut run = harness.run_with_inputs(graph, inputs);
        while run.next().await.is_some() {}

        if let Some(error) = run.take_error() {
            return Err(error);
        }
        if let Some(request) = run.pending() {
            return Err(BoardwalkError::RunState(format!(
                "node \"{}\" is waiting for {:?}",
                request.node.id, request.kind
            )));
        }
        run.outputs()
            .first()
            .cloned()
            .ok_or_else(|| BoardwalkError::RunState("board finished without output".into()))
    }
}
