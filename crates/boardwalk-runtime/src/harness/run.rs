use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use boardwalk_core::config::Diagnostics;
use boardwalk_core::error::{BoardwalkError, Result};
use boardwalk_core::event::{
    EndData, ErrorData, EventOrigin, GraphData, InputData, NodeData, OutputData, PauseData,
    RunEvent, SecretData, SkipData, StartData,
};
use boardwalk_core::traits::NodeHandler;
use boardwalk_core::types::{
    node_types, GraphDescriptor, NodeDescriptor, NodeHandlerContext, RunId, Values,
};

use super::frame::Frame;
use super::Harness;
use crate::invoke::{invoke_handler, required_input_keys, secret_keys, NodeAction};
use crate::reanimation::{ReanimationState, Reanimator, VisitTracker};
use crate::snapshot::{RunSnapshot, SnapshotKind, SNAPSHOT_VERSION};

/// Key of the `invoke` input naming the nested board.
const BOARD_PORT: &str = "$board";

/// A request the run is suspended on.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub kind: SnapshotKind,
    pub node: NodeDescriptor,
    pub inputs: Values,
    /// Secret names, for `secret` requests.
    pub keys: Vec<String>,
    pub path: Vec<usize>,
    pub nesting: usize,
}

enum Status {
    /// Not started; `resumed` runs announce themselves with a `resume` event.
    Ready { resumed: bool },
    /// Restored from a snapshot; the values answer the waiting node.
    Restored(Values),
    /// Could not be set up; reported on the first call to `next`.
    Failed(BoardwalkError),
    Running,
    Waiting(PendingRequest),
    Finished,
}

/// One execution of a board.
///
/// Pull events with [`next`](Self::next). `None` means the run either
/// finished or is waiting for values; [`pending`](Self::pending) tells
/// which. Errors never escape as `Err`: they end the run with an `error`
/// event followed by `end`.
pub struct Run {
    harness: Harness,
    run_id: RunId,
    root: Arc<GraphDescriptor>,
    frames: Vec<Frame>,
    queue: VecDeque<RunEvent>,
    status: Status,
    tracker: VisitTracker,
    reanimator: Option<Reanimator>,
    steps: usize,
    outputs: Vec<Values>,
    error: Option<BoardwalkError>,
}

impl Run {
    pub(crate) fn start(
        harness: Harness,
        root: Arc<GraphDescriptor>,
        inputs: Values,
        reanimator: Option<Reanimator>,
    ) -> Self {
        let resumed = reanimator.is_some();
        let (frames, status) = match root.validate().and_then(|_| Frame::root(root.clone(), inputs)) {
            Ok(frame) => (vec![frame], Status::Ready { resumed }),
            Err(e) => (Vec::new(), Status::Failed(e)),
        };
        Self::assemble(harness, root, frames, status, VisitTracker::new(), reanimator)
    }

    pub(crate) fn restored(
        harness: Harness,
        root: Arc<GraphDescriptor>,
        frames: Vec<Frame>,
        tracker: VisitTracker,
        values: Values,
    ) -> Self {
        Self::assemble(harness, root, frames, Status::Restored(values), tracker, None)
    }

    fn assemble(
        harness: Harness,
        root: Arc<GraphDescriptor>,
        frames: Vec<Frame>,
        status: Status,
        tracker: VisitTracker,
        reanimator: Option<Reanimator>,
    ) -> Self {
        Self {
            harness,
            run_id: RunId::new(),
            root,
            frames,
            queue: VecDeque::new(),
            status,
            tracker,
            reanimator,
            steps: 0,
            outputs: Vec::new(),
            error: None,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Next lifecycle event, or `None` when finished or suspended.
    pub async fn next(&mut self) -> Option<RunEvent> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                return Some(event);
            }
            if matches!(self.status, Status::Waiting(_) | Status::Finished) {
                return None;
            }
            if let Err(e) = self.advance().await {
                self.fail(e);
            }
        }
    }

    /// The request the run is suspended on, if any.
    pub fn pending(&self) -> Option<&PendingRequest> {
        match &self.status {
            Status::Waiting(request) => Some(request),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, Status::Finished) && self.queue.is_empty()
    }

    /// Answer a pending `input` request; the values become the node's outputs.
    pub fn provide_input(&mut self, values: Values) -> Result<()> {
        self.answer(SnapshotKind::Input, values)
    }

    /// Answer a pending `secret` request.
    pub fn provide_secrets(&mut self, values: Values) -> Result<()> {
        self.answer(SnapshotKind::Secret, values)
    }

    /// Outputs of the top-level board, in the order they were produced.
    pub fn outputs(&self) -> &[Values] {
        &self.outputs
    }

    /// The error that ended the run, if any.
    pub fn error(&self) -> Option<&BoardwalkError> {
        self.error.as_ref()
    }

    pub fn take_error(&mut self) -> Option<BoardwalkError> {
        self.error.take()
    }

    pub fn reanimation_state(&self) -> ReanimationState {
        self.tracker.state()
    }

    /// Capture a suspended run so it can be continued with
    /// [`Harness::resume`](super::Harness::resume).
    pub fn save(&self) -> Result<RunSnapshot> {
        let Status::Waiting(request) = &self.status else {
            return Err(BoardwalkError::RunState(
                "only a suspended run can be saved".into(),
            ));
        };
        let (top, parents) = self
            .frames
            .split_last()
            .ok_or_else(|| BoardwalkError::RunState("run has no frames".into()))?;
        Ok(RunSnapshot {
            kind: request.kind,
            version: SNAPSHOT_VERSION,
            state: top.machine.current().clone(),
            frame: top.info(),
            parents: parents.iter().map(Frame::to_parent).collect(),
            reanimation: self.tracker.state(),
            inputs: self.frames[0].args.clone(),
        })
    }

    fn answer(&mut self, kind: SnapshotKind, values: Values) -> Result<()> {
        match &self.status {
            Status::Waiting(request) if request.kind == kind => {}
            Status::Waiting(request) => {
                return Err(BoardwalkError::RunState(format!(
                    "node \"{}\" is waiting for {:?}, not {:?}",
                    request.node.id, request.kind, kind
                )))
            }
            _ => {
                return Err(BoardwalkError::RunState(
                    "run is not waiting for values".into(),
                ))
            }
        }
        self.status = Status::Running;
        self.emit_resume();
        self.complete_node(values);
        Ok(())
    }

    async fn advance(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.status, Status::Running) {
            Status::Ready { resumed } => {
                self.emit_start();
                if resumed {
                    self.emit_resume();
                }
                if let Some(frame) = self.frames.last() {
                    let event = RunEvent::GraphStart(graph_data(frame));
                    self.emit(event);
                }
                Ok(())
            }
            Status::Restored(values) => {
                self.emit_start();
                self.emit_resume();
                self.complete_node(values);
                Ok(())
            }
            Status::Failed(error) => {
                self.emit_start();
                Err(error)
            }
            Status::Running => self.step().await,
            other => {
                self.status = other;
                Ok(())
            }
        }
    }

    async fn step(&mut self) -> Result<()> {
        if self.harness.cancel.is_cancelled() {
            return Err(BoardwalkError::Cancelled);
        }
        let frame = self
            .frames
            .last_mut()
            .ok_or_else(|| BoardwalkError::RunState("run has no frames".into()))?;
        let visited = frame.machine.next()?.map(|r| {
            (
                r.descriptor.clone(),
                r.inputs.clone(),
                r.skip,
                r.missing_inputs.clone(),
            )
        });
        let Some((node, inputs, skip, missing)) = visited else {
            return self.finish_frame();
        };

        self.steps += 1;
        let max_steps = self.harness.config.max_steps;
        if max_steps > 0 && self.steps > max_steps {
            return Err(BoardwalkError::StepLimitExceeded(max_steps));
        }

        let path = frame.next_path();
        let origin = frame.node_origin();
        self.tracker.visit(&node.id, &path);

        if skip {
            debug!(node_id = %node.id, ?missing, "Skipping node");
            self.emit(RunEvent::Skip(SkipData {
                node,
                inputs,
                missing_inputs: missing,
                origin,
                timestamp: Utc::now(),
            }));
            return Ok(());
        }

        debug!(node_id = %node.id, node_type = %node.node_type, ?path, "Running node");
        self.emit(RunEvent::NodeStart(NodeData {
            node: node.clone(),
            inputs: inputs.clone(),
            outputs: None,
            origin: origin.clone(),
            timestamp: Utc::now(),
        }));

        match self.harness.registry.resolve(&node.node_type)? {
            NodeAction::Input => {
                self.handle_input(node, inputs, path, origin);
                Ok(())
            }
            NodeAction::Secrets => {
                let keys = secret_keys(&inputs);
                self.suspend(SnapshotKind::Secret, node, inputs, keys, path, origin);
                Ok(())
            }
            NodeAction::Output => self.handle_output(node, inputs, origin),
            NodeAction::Invoke => self.handle_invoke(node, inputs, path).await,
            NodeAction::Handler(handler) => self.call_handler(handler, node, inputs, path, origin).await,
        }
    }

    fn handle_input(&mut self, node: NodeDescriptor, inputs: Values, path: Vec<usize>, origin: EventOrigin) {
        let args = self.frames.last().map(|f| f.args.clone()).unwrap_or_default();
        let required = required_input_keys(&inputs);
        if !args.is_empty() && required.iter().all(|k| args.contains_key(k)) {
            if origin.nesting == 0 {
                self.emit(RunEvent::Input(InputData {
                    node,
                    inputs,
                    bubbled: false,
                    origin,
                    timestamp: Utc::now(),
                }));
            }
            self.complete_node(args);
            return;
        }

        let replayed = self
            .reanimator
            .as_mut()
            .and_then(|r| r.replay(&node.id, &path));
        if let Some(values) = replayed {
            self.complete_node(values);
            return;
        }

        self.suspend(SnapshotKind::Input, node, inputs, Vec::new(), path, origin);
    }

    fn suspend(
        &mut self,
        kind: SnapshotKind,
        node: NodeDescriptor,
        inputs: Values,
        keys: Vec<String>,
        path: Vec<usize>,
        origin: EventOrigin,
    ) {
        let nesting = origin.nesting;
        let timestamp = Utc::now();
        let event = match kind {
            SnapshotKind::Input => RunEvent::Input(InputData {
                node: node.clone(),
                inputs: inputs.clone(),
                bubbled: nesting > 0,
                origin: origin.clone(),
                timestamp,
            }),
            SnapshotKind::Secret => RunEvent::Secret(SecretData {
                node: node.clone(),
                keys: keys.clone(),
                origin: origin.clone(),
                timestamp,
            }),
        };
        self.emit(event);
        self.emit(RunEvent::Pause(PauseData { origin, timestamp }));
        info!(node_id = %node.id, ?kind, nesting, "Run suspended");
        self.status = Status::Waiting(PendingRequest {
            kind,
            node,
            inputs,
            keys,
            path,
            nesting,
        });
    }

    fn handle_output(&mut self, node: NodeDescriptor, inputs: Values, origin: EventOrigin) -> Result<()> {
        if origin.nesting > 0 {
            self.complete_node(Values::new());
            return self.finish_child(inputs);
        }

        if let Some(frame) = self.frames.last_mut() {
            frame.produced_output = true;
        }
        self.outputs.push(inputs.clone());
        self.emit(RunEvent::Output(OutputData {
            node,
            outputs: inputs,
            bubbled: false,
            origin,
            timestamp: Utc::now(),
        }));
        self.complete_node(Values::new());
        if self.harness.config.stop_on_output {
            debug!("Stopping at first output");
            self.finish_root();
        }
        Ok(())
    }

    async fn handle_invoke(&mut self, node: NodeDescriptor, mut inputs: Values, path: Vec<usize>) -> Result<()> {
        let board = inputs.remove(BOARD_PORT).ok_or_else(|| {
            BoardwalkError::handler(&node.id, format!("invoke node needs a \"{}\"", BOARD_PORT))
        })?;
        let graph = self.resolve_board(&node.id, board).await?;

        let parent = self
            .frames
            .last()
            .ok_or_else(|| BoardwalkError::RunState("run has no frames".into()))?;
        let mut sources = parent.sources.clone();
        sources.push(node.id.clone());
        let child = Frame::child(Arc::new(graph), path, sources, inputs)?;
        debug!(node_id = %node.id, nesting = child.nesting(), "Entering nested board");

        let event = RunEvent::GraphStart(graph_data(&child));
        self.frames.push(child);
        self.emit(event);
        Ok(())
    }

    async fn resolve_board(&self, node_id: &str, board: Value) -> Result<GraphDescriptor> {
        match board {
            Value::String(location) if location.starts_with('#') => {
                let id = &location[1..];
                self.frames
                    .last()
                    .and_then(|f| f.graph.graphs.get(id))
                    .or_else(|| self.root.graphs.get(id))
                    .cloned()
                    .ok_or_else(|| BoardwalkError::GraphLoad {
                        url: location.clone(),
                        message: "no nested board with that id".into(),
                    })
            }
            Value::String(location) => {
                let loader = self.harness.loader.clone().ok_or_else(|| BoardwalkError::GraphLoad {
                    url: location.clone(),
                    message: "no graph loader configured".into(),
                })?;
                let base = self.board_base();
                loader.load(&location, base.as_deref()).await
            }
            Value::Object(_) => {
                let graph: GraphDescriptor =
                    serde_json::from_value(board).map_err(|e| BoardwalkError::GraphLoad {
                        url: format!("{}#inline", node_id),
                        message: e.to_string(),
                    })?;
                graph.validate()?;
                Ok(graph)
            }
            other => Err(BoardwalkError::handler(
                node_id,
                format!("unsupported {} value {}", BOARD_PORT, other),
            )),
        }
    }

    /// Location relative boards resolve against: the innermost nested board
    /// that has a URL, else the harness base, else the root board's URL.
    fn board_base(&self) -> Option<String> {
        self.frames
            .iter()
            .skip(1)
            .rev()
            .find_map(|f| f.graph.url.clone())
            .or_else(|| self.harness.base.clone())
            .or_else(|| self.root.url.clone())
    }

    async fn call_handler(
        &mut self,
        handler: Arc<dyn NodeHandler>,
        node: NodeDescriptor,
        inputs: Values,
        path: Vec<usize>,
        origin: EventOrigin,
    ) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut ctx = NodeHandlerContext::new(node.clone(), self.root.clone()).with_output_sink(tx);
        ctx.invocation_path = path;
        ctx.base = self.board_base();
        ctx.loader = self.harness.loader.clone();
        ctx.cancel = self.harness.cancel.clone();

        let frame = self
            .frames
            .last_mut()
            .ok_or_else(|| BoardwalkError::RunState("run has no frames".into()))?;
        let outputs = invoke_handler(handler.as_ref(), inputs, ctx, |partial| {
            frame.machine.set_partial_outputs(partial.clone())
        })
        .await?;

        while let Ok(values) = rx.try_recv() {
            self.emit(RunEvent::Output(OutputData {
                node: node.clone(),
                outputs: values,
                bubbled: true,
                origin: origin.clone(),
                timestamp: Utc::now(),
            }));
        }
        self.complete_node(outputs);
        Ok(())
    }

    /// Hand `outputs` to the node the top frame is on and report it finished.
    fn complete_node(&mut self, outputs: Values) {
        let Some(frame) = self.frames.last_mut() else {
            return;
        };
        let current = frame.machine.current();
        let event = RunEvent::NodeEnd(NodeData {
            node: current.descriptor.clone(),
            inputs: current.inputs.clone(),
            outputs: Some(outputs.clone()),
            origin: frame.node_origin(),
            timestamp: Utc::now(),
        });
        frame.machine.set_outputs(outputs);
        self.emit(event);
    }

    fn finish_frame(&mut self) -> Result<()> {
        if self.frames.len() > 1 {
            return self.finish_child(Values::new());
        }
        let frame = self
            .frames
            .last()
            .ok_or_else(|| BoardwalkError::RunState("run has no frames".into()))?;
        let outputs = frame.graph.nodes_of_type(node_types::OUTPUT);
        if !outputs.is_empty() && !frame.produced_output {
            return Err(BoardwalkError::OutputUnreachable {
                outputs,
                stalled: frame.machine.current().stalled_nodes(),
            });
        }
        self.finish_root();
        Ok(())
    }

    fn finish_child(&mut self, outputs: Values) -> Result<()> {
        let child = self
            .frames
            .pop()
            .ok_or_else(|| BoardwalkError::RunState("run has no frames".into()))?;
        debug!(nesting = child.nesting(), "Leaving nested board");
        self.emit(RunEvent::GraphEnd(graph_data(&child)));
        self.complete_node(outputs);
        Ok(())
    }

    fn finish_root(&mut self) {
        if let Some(frame) = self.frames.last() {
            let event = RunEvent::GraphEnd(graph_data(frame));
            self.emit(event);
        }
        self.emit_end();
        info!(run_id = %self.run_id, steps = self.steps, outputs = self.outputs.len(), "Run complete");
    }

    fn fail(&mut self, error: BoardwalkError) {
        let (node, origin) = match self.frames.last() {
            Some(frame) => {
                let current = frame.machine.current();
                let node = match &error {
                    BoardwalkError::HandlerInvocation { node, .. } => Some(node.clone()),
                    BoardwalkError::HandlerNotFound(_)
                    | BoardwalkError::GraphLoad { .. }
                    | BoardwalkError::NodeNotFound(_)
                        if !current.is_entry() =>
                    {
                        Some(current.descriptor.id.clone())
                    }
                    _ => None,
                };
                (node, frame.node_origin())
            }
            None => (None, EventOrigin::default()),
        };
        error!(run_id = %self.run_id, kind = error.kind(), error = %error, "Run failed");
        self.emit(RunEvent::Error(ErrorData {
            kind: error.kind().to_string(),
            message: error.to_string(),
            node,
            origin,
            timestamp: Utc::now(),
        }));
        self.emit_end();
        self.error = Some(error);
    }

    fn emit_start(&mut self) {
        info!(run_id = %self.run_id, url = ?self.root.url, "Run started");
        self.emit(RunEvent::Start(StartData {
            run_id: self.run_id.clone(),
            url: self.root.url.clone(),
            timestamp: Utc::now(),
        }));
    }

    fn emit_resume(&mut self) {
        let origin = self
            .frames
            .last()
            .map(Frame::node_origin)
            .unwrap_or_default();
        self.emit(RunEvent::Resume(PauseData {
            origin,
            timestamp: Utc::now(),
        }));
    }

    fn emit_end(&mut self) {
        self.emit(RunEvent::End(EndData {
            run_id: self.run_id.clone(),
            timestamp: Utc::now(),
        }));
        self.status = Status::Finished;
    }

    fn emit(&mut self, event: RunEvent) {
        if self.suppressed(&event) {
            return;
        }
        if let Some(bus) = &self.harness.bus {
            bus.publish(event.clone());
        }
        self.queue.push_back(event);
    }

    /// Nested lifecycle noise hidden under `Diagnostics::Top`.
    fn suppressed(&self, event: &RunEvent) -> bool {
        self.harness.config.diagnostics == Diagnostics::Top
            && event.origin().is_some_and(|o| o.nesting > 0)
            && matches!(
                event,
                RunEvent::GraphStart(_)
                    | RunEvent::GraphEnd(_)
                    | RunEvent::NodeStart(_)
                    | RunEvent::NodeEnd(_)
                    | RunEvent::Skip(_)
            )
    }
}

fn graph_data(frame: &Frame) -> GraphData {
    GraphData {
        url: frame.graph.url.clone(),
        title: frame.graph.title.clone(),
        origin: frame.graph_origin(),
        timestamp: Utc::now(),
    }
}
