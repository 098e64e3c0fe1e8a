use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tracing::debug;

use boardwalk_core::error::{BoardwalkError, Result};
use boardwalk_core::traits::{NodeHandler, NodeOutput};
use boardwalk_core::types::{node_types, NodeHandlerContext, Values};

/// A named bundle of handlers, registered together.
pub struct Kit {
    pub name: String,
    handlers: Vec<(String, Arc<dyn NodeHandler>)>,
}

impl Kit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: Vec::new(),
        }
    }

    pub fn with(mut self, node_type: impl Into<String>, handler: impl NodeHandler) -> Self {
        self.handlers.push((node_type.into(), Arc::new(handler)));
        self
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.handlers.iter().map(|(t, _)| t.as_str())
    }
}

/// Registry of node handlers keyed by node type.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler, replacing any existing one for the type.
    pub fn register(&mut self, node_type: impl Into<String>, handler: impl NodeHandler) {
        self.handlers.insert(node_type.into(), Arc::new(handler));
    }

    /// Register every handler of a kit. Types that are already registered
    /// keep their handler.
    pub fn register_kit(&mut self, kit: Kit) {
        for (node_type, handler) in kit.handlers {
            if self.handlers.contains_key(&node_type) {
                debug!(kit = %kit.name, node_type = %node_type, "Type already registered, keeping earlier handler");
                continue;
            }
            self.handlers.insert(node_type, handler);
        }
    }

    pub fn unregister(&mut self, node_type: &str) -> bool {
        self.handlers.remove(node_type).is_some()
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(node_type).cloned()
    }

    /// Registered types, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(|s| s.as_str()).collect();
        types.sort_unstable();
        types
    }

    /// Decide how a node of `node_type` is run.
    ///
    /// The reserved types are answered by the harness and never reach a
    /// registered handler.
    pub fn resolve(&self, node_type: &str) -> Result<NodeAction> {
        match node_type {
            node_types::INPUT => Ok(NodeAction::Input),
            node_types::OUTPUT => Ok(NodeAction::Output),
            node_types::SECRETS => Ok(NodeAction::Secrets),
            node_types::INVOKE => Ok(NodeAction::Invoke),
            other => self
                .get(other)
                .map(NodeAction::Handler)
                .ok_or_else(|| BoardwalkError::HandlerNotFound(other.to_string())),
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// How the harness runs a node.
pub enum NodeAction {
    /// Suspend for values supplied from outside the graph.
    Input,
    /// Hand the node's inputs to the caller.
    Output,
    /// Suspend for the secrets named in `keys`.
    Secrets,
    /// Run a nested board.
    Invoke,
    Handler(Arc<dyn NodeHandler>),
}

/// Call a handler and fold its result into one output map.
///
/// `on_partial` sees the accumulated outputs after every streamed chunk.
pub async fn invoke_handler(
    handler: &dyn NodeHandler,
    inputs: Values,
    ctx: NodeHandlerContext,
    on_partial: impl FnMut(&Values),
) -> Result<Values> {
    let node = ctx.descriptor.id.clone();
    let output = handler
        .invoke(inputs, ctx)
        .await
        .map_err(|e| invocation_failure(&node, e))?;
    collect_outputs(output, on_partial)
        .await
        .map_err(|e| invocation_failure(&node, e))
}

/// Fold a handler result; later chunks overwrite earlier keys.
pub async fn collect_outputs(output: NodeOutput, mut on_partial: impl FnMut(&Values)) -> Result<Values> {
    match output {
        NodeOutput::Complete(values) => Ok(values),
        NodeOutput::Stream(mut stream) => {
            let mut folded = Values::new();
            while let Some(chunk) = stream.next().await {
                folded.extend(chunk?);
                on_partial(&folded);
            }
            Ok(folded)
        }
    }
}

fn invocation_failure(node: &str, error: BoardwalkError) -> BoardwalkError {
    match error {
        e @ (BoardwalkError::HandlerInvocation { .. } | BoardwalkError::Cancelled) => e,
        other => BoardwalkError::handler(node, other),
    }
}

/// Keys an `input` node needs answered, taken from its `schema`:
/// `required` when present, else every declared property.
pub fn required_input_keys(inputs: &Values) -> Vec<String> {
    let Some(schema) = inputs.get("schema") else {
        return Vec::new();
    };
    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        return required
            .iter()
            .filter_map(|k| k.as_str().map(str::to_string))
            .collect();
    }
    schema
        .get("properties")
        .and_then(|p| p.as_object())
        .map(|props| props.keys().cloned().collect())
        .unwrap_or_default()
}

/// Keys listed by a `secrets` node.
pub fn secret_keys(inputs: &Values) -> Vec<String> {
    inputs
        .get("keys")
        .and_then(|k| k.as_array())
        .map(|keys| {
            keys.iter()
                .filter_map(|k| k.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
