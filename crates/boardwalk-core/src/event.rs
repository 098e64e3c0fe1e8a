use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{NodeDescriptor, NodeId, PortName, RunId, Values};

/// Where in the (possibly nested) run an event originated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventOrigin {
    /// Invocation path: one index per nesting level.
    pub path: Vec<usize>,
    /// Depth of the frame, 0 for the top-level graph.
    pub nesting: usize,
    /// Ids of the `invoke` nodes enclosing the frame, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartData {
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(flatten)]
    pub origin: EventOrigin,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeData {
    pub node: NodeDescriptor,
    pub inputs: Values,
    /// Present on `nodeend`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Values>,
    #[serde(flatten)]
    pub origin: EventOrigin,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipData {
    pub node: NodeDescriptor,
    pub inputs: Values,
    pub missing_inputs: Vec<PortName>,
    #[serde(flatten)]
    pub origin: EventOrigin,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputData {
    pub node: NodeDescriptor,
    /// The node's inputs, typically carrying a `schema`.
    pub inputs: Values,
    /// True when a nested graph could not answer the request from its arguments.
    #[serde(default)]
    pub bubbled: bool,
    #[serde(flatten)]
    pub origin: EventOrigin,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputData {
    pub node: NodeDescriptor,
    pub outputs: Values,
    /// True when a handler provided the values mid-invocation.
    #[serde(default)]
    pub bubbled: bool,
    #[serde(flatten)]
    pub origin: EventOrigin,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretData {
    pub node: NodeDescriptor,
    pub keys: Vec<String>,
    #[serde(flatten)]
    pub origin: EventOrigin,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    /// Stable error kind (`HandlerNotFound`, `OutputUnreachable`, ...).
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeId>,
    #[serde(flatten)]
    pub origin: EventOrigin,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseData {
    #[serde(flatten)]
    pub origin: EventOrigin,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndData {
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
}

/// Lifecycle event emitted by a run, serialized as `{type, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum RunEvent {
    Start(StartData),
    GraphStart(GraphData),
    NodeStart(NodeData),
    Input(InputData),
    Secret(SecretData),
    Output(OutputData),
    Pause(PauseData),
    Resume(PauseData),
    NodeEnd(NodeData),
    Skip(SkipData),
    GraphEnd(GraphData),
    Error(ErrorData),
    End(EndData),
}

impl RunEvent {
    /// The wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start(_) => "start",
            Self::GraphStart(_) => "graphstart",
            Self::NodeStart(_) => "nodestart",
            Self::Input(_) => "input",
            Self::Secret(_) => "secret",
            Self::Output(_) => "output",
            Self::Pause(_) => "pause",
            Self::Resume(_) => "resume",
            Self::NodeEnd(_) => "nodeend",
            Self::Skip(_) => "skip",
            Self::GraphEnd(_) => "graphend",
            Self::Error(_) => "error",
            Self::End(_) => "end",
        }
    }

    /// Origin of the event, if it belongs to a specific frame.
    pub fn origin(&self) -> Option<&EventOrigin> {
        match self {
            Self::GraphStart(d) | Self::GraphEnd(d) => Some(&d.origin),
            Self::NodeStart(d) | Self::NodeEnd(d) => Some(&d.origin),
            Self::Input(d) => Some(&d.origin),
            Self::Secret(d) => Some(&d.origin),
            Self::Output(d) => Some(&d.origin),
            Self::Pause(d) | Self::Resume(d) => Some(&d.origin),
            Self::Skip(d) => Some(&d.origin),
            Self::Error(d) => Some(&d.origin),
            Self::Start(_) | Self::End(_) => None,
        }
    }

    /// Id of the node the event is about, if any.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::NodeStart(d) | Self::NodeEnd(d) => Some(&d.node.id),
            Self::Input(d) => Some(&d.node.id),
            Self::Secret(d) => Some(&d.node.id),
            Self::Output(d) => Some(&d.node.id),
            Self::Skip(d) => Some(&d.node.id),
            Self::Error(d) => d.node.as_deref(),
            _ => None,
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: RunEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
