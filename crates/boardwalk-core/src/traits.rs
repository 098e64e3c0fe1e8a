use std::future::Future;

use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::types::{GraphDescriptor, NodeHandlerContext, Values};

/// What a handler produced: a complete output map or a stream of partial maps.
pub enum NodeOutput {
    Complete(Values),
    /// Partial outputs, folded into one map (later keys overwrite earlier ones).
    Stream(BoxStream<'static, Result<Values>>),
}

impl From<Values> for NodeOutput {
    fn from(values: Values) -> Self {
        Self::Complete(values)
    }
}

impl std::fmt::Debug for NodeOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete(values) => f.debug_tuple("Complete").field(values).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Node handler: what a node of a given type computes.
pub trait NodeHandler: Send + Sync + 'static {
    /// Invoke the handler with the node's assembled inputs.
    fn invoke(&self, inputs: Values, ctx: NodeHandlerContext) -> BoxFuture<'_, Result<NodeOutput>>;

    /// Human-readable description.
    fn description(&self) -> &str {
        ""
    }
}

/// Adapts an async closure into a [`NodeHandler`].
pub struct FnHandler<F> {
    f: F,
}

/// Build a handler from `|inputs, ctx| async move { ... }`.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Values, NodeHandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Values>> + Send + 'static,
{
    FnHandler { f }
}

impl<F, Fut> NodeHandler for FnHandler<F>
where
    F: Fn(Values, NodeHandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Values>> + Send + 'static,
{
    fn invoke(&self, inputs: Values, ctx: NodeHandlerContext) -> BoxFuture<'_, Result<NodeOutput>> {
        let fut = (self.f)(inputs, ctx);
        Box::pin(async move { fut.await.map(NodeOutput::Complete) })
    }
}

/// Graph loader: resolves a board location (path or URL) into a descriptor.
pub trait GraphLoader: Send + Sync + 'static {
    fn load<'a>(
        &'a self,
        location: &'a str,
        base: Option<&'a str>,
    ) -> BoxFuture<'a, Result<GraphDescriptor>>;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::types::NodeDescriptor;

    #[tokio::test]
    async fn test_handler_fn() {
        let handler = handler_fn(|inputs: Values, _ctx| async move {
            let mut out = Values::new();
            out.insert("echo".into(), serde_json::Value::Object(inputs));
            Ok(out)
        });
        let ctx = NodeHandlerContext::new(
            NodeDescriptor::new("n", "echo"),
            Arc::new(GraphDescriptor::default()),
        );
        let mut inputs = Values::new();
        inputs.insert("x".into(), serde_json::json!(1));
        match handler.invoke(inputs, ctx).await.unwrap() {
            NodeOutput::Complete(out) => assert_eq!(out["echo"]["x"], 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_provide_output_without_sink() {
        let ctx = NodeHandlerContext::new(
            NodeDescriptor::new("n", "echo"),
            Arc::new(GraphDescriptor::default()),
        );
        assert!(!ctx.provide_output(Values::new()));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = ctx.with_output_sink(tx);
        assert!(ctx.provide_output(Values::new()));
        assert!(rx.recv().await.is_some());
    }
}
