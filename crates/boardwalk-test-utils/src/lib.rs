//! Shared test utilities for Boardwalk crates.
//!
//! Mock handlers, board fixtures and helpers for inspecting event streams.

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::stream;
use serde_json::{json, Value};

use boardwalk_core::error::{BoardwalkError, Result};
use boardwalk_core::event::RunEvent;
use boardwalk_core::traits::{NodeHandler, NodeOutput};
use boardwalk_core::types::{Edge, GraphDescriptor, NodeDescriptor, NodeHandlerContext, Values};

/// Build a `Values` map from a JSON object literal.
///
/// Panics when `value` is not an object.
pub fn values(value: Value) -> Values {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {}", other),
    }
}

// ── Handlers ────────────────────────────────────────────────────

/// `{in} -> {out: in}`.
pub struct PassthroughHandler;

impl NodeHandler for PassthroughHandler {
    fn invoke(&self, inputs: Values, _ctx: NodeHandlerContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let mut out = Values::new();
            if let Some(value) = inputs.get("in") {
                out.insert("out".into(), value.clone());
            }
            Ok(NodeOutput::Complete(out))
        })
    }

    fn description(&self) -> &str {
        "Copies `in` to `out`"
    }
}

/// `{in: "abc"} -> {out: "cba"}`.
pub struct ReverserHandler;

impl NodeHandler for ReverserHandler {
    fn invoke(&self, inputs: Values, ctx: NodeHandlerContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let text = inputs
                .get("in")
                .and_then(|v| v.as_str())
                .ok_or_else(|| BoardwalkError::handler(&ctx.descriptor.id, "`in` must be a string"))?;
            let mut out = Values::new();
            out.insert("out".into(), json!(text.chars().rev().collect::<String>()));
            Ok(NodeOutput::Complete(out))
        })
    }
}

/// Records the id of every node it runs, then behaves like [`PassthroughHandler`].
/// Nodes without an `in` value output `{out: <node id>}`.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    calls: Arc<Mutex<Vec<String>>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Node ids in invocation order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl NodeHandler for RecordingHandler {
    fn invoke(&self, inputs: Values, ctx: NodeHandlerContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(ctx.descriptor.id.clone());
            let mut out = Values::new();
            let value = inputs
                .get("in")
                .cloned()
                .unwrap_or_else(|| json!(ctx.descriptor.id));
            out.insert("out".into(), value);
            Ok(NodeOutput::Complete(out))
        })
    }
}

/// Always fails with the given message.
pub struct FailingHandler(pub String);

impl NodeHandler for FailingHandler {
    fn invoke(&self, _inputs: Values, _ctx: NodeHandlerContext) -> BoxFuture<'_, Result<NodeOutput>> {
        let message = self.0.clone();
        Box::pin(async move { Err(BoardwalkError::RunState(message)) })
    }
}

/// Streams the given chunks as partial outputs.
pub struct StreamingHandler(pub Vec<Values>);

impl NodeHandler for StreamingHandler {
    fn invoke(&self, _inputs: Values, _ctx: NodeHandlerContext) -> BoxFuture<'_, Result<NodeOutput>> {
        let chunks: Vec<Result<Values>> = self.0.iter().cloned().map(Ok).collect();
        Box::pin(async move { Ok(NodeOutput::Stream(Box::pin(stream::iter(chunks)))) })
    }
}

/// Provides `{progress: n}` for n in 1..=count through the context before
/// returning `{out: "done"}`.
pub struct ProgressHandler(pub usize);

impl NodeHandler for ProgressHandler {
    fn invoke(&self, _inputs: Values, ctx: NodeHandlerContext) -> BoxFuture<'_, Result<NodeOutput>> {
        let count = self.0;
        Box::pin(async move {
            for n in 1..=count {
                ctx.provide_output(values(json!({ "progress": n })));
            }
            Ok(NodeOutput::Complete(values(json!({ "out": "done" }))))
        })
    }
}

// ── Boards ──────────────────────────────────────────────────────

/// Schema asking for one string property `text`.
pub fn text_schema() -> Value {
    json!({
        "type": "object",
        "properties": { "text": { "type": "string" } },
        "required": ["text"]
    })
}

/// `a(input) -> b(passthrough) -> c(output)` wired `a.text -> b.in`, `b.out -> c.text`.
pub fn linear_board() -> GraphDescriptor {
    GraphDescriptor::new(
        vec![
            NodeDescriptor::new("a", "input").with_config("schema", text_schema()),
            NodeDescriptor::new("b", "passthrough"),
            NodeDescriptor::new("c", "output"),
        ],
        vec![
            Edge::new("a", "text", "b", "in"),
            Edge::new("b", "out", "c", "text"),
        ],
    )
}

/// Like [`linear_board`] but `a.text` is wired into `b.bar`, a port the
/// reverser never receives, so `c` can never run.
pub fn unreachable_board() -> GraphDescriptor {
    GraphDescriptor::new(
        vec![
            NodeDescriptor::new("a", "input"),
            NodeDescriptor::new("b", "reverser").with_config("in", json!("foo")),
            NodeDescriptor::new("c", "output"),
        ],
        vec![
            Edge::new("a", "text", "b", "bar"),
            Edge::new("b", "out", "c", "text"),
        ],
    )
}

/// A diamond of recording nodes: `s -> {l, r} -> j -> out(output)`.
pub fn diamond_board() -> GraphDescriptor {
    GraphDescriptor::new(
        vec![
            NodeDescriptor::new("s", "record"),
            NodeDescriptor::new("l", "record"),
            NodeDescriptor::new("r", "record"),
            NodeDescriptor::new("j", "record"),
            NodeDescriptor::new("out", "output"),
        ],
        vec![
            Edge::new("s", "out", "l", "in"),
            Edge::new("s", "out", "r", "in"),
            Edge::new("l", "out", "j", "in"),
            Edge::new("r", "out", "j", "in"),
            Edge::new("j", "out", "out", "result"),
        ],
    )
}

// ── Events ──────────────────────────────────────────────────────

/// Wire names of `events`, in order.
pub fn event_names(events: &[RunEvent]) -> Vec<&'static str> {
    events.iter().map(RunEvent::name).collect()
}

/// Ids of the nodes that started, in order.
pub fn started_nodes(events: &[RunEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            RunEvent::NodeStart(d) => Some(d.node.id.clone()),
            _ => None,
        })
        .collect()
}

/// Events with the given wire name.
pub fn events_named<'a>(events: &'a [RunEvent], name: &str) -> Vec<&'a RunEvent> {
    events.iter().filter(|e| e.name() == name).collect()
}
