use boardwalk_core::error::BoardwalkError;
use boardwalk_core::traits::handler_fn;
use boardwalk_core::types::{Values, ERROR_PORT};

use crate::invoke::Kit;

/// Handlers every registry can rely on.
///
/// - `passthrough`: outputs its inputs unchanged.
/// - `fail`: reports `message` on the `$error` port.
pub fn core_kit() -> Kit {
    Kit::new("core")
        .with(
            "passthrough",
            handler_fn(|inputs: Values, _ctx| async move { Ok(inputs) }),
        )
        .with(
            "fail",
            handler_fn(|inputs: Values, ctx| async move {
                let message = inputs
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
                    .ok_or_else(|| {
                        BoardwalkError::handler(&ctx.descriptor.id, "fail node needs a \"message\"")
                    })?;
                let mut out = Values::new();
                out.insert(ERROR_PORT.into(), serde_json::json!({ "message": message }));
                Ok(out)
            }),
        )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::invoke::{invoke_handler, HandlerRegistry};
    use boardwalk_core::types::{GraphDescriptor, NodeDescriptor, NodeHandlerContext};
    use serde_json::json;

    fn ctx() -> NodeHandlerContext {
        NodeHandlerContext::new(NodeDescriptor::new("n", "x"), Arc::new(GraphDescriptor::default()))
    }

    #[tokio::test]
    async fn test_passthrough_is_identity() {
        let mut registry = HandlerRegistry::new();
        registry.register_kit(core_kit());
        let handler = registry.get("passthrough").unwrap();
        let inputs: Values = serde_json::from_value(json!({"a": 1, "b": "two"})).unwrap();
        let out = invoke_handler(handler.as_ref(), inputs.clone(), ctx(), |_| {})
            .await
            .unwrap();
        assert_eq!(out, inputs);
    }

    #[tokio::test]
    async fn test_fail_reports_error_port() {
        let kit = core_kit();
        assert_eq!(kit.types().collect::<Vec<_>>(), vec!["passthrough", "fail"]);
        let mut registry = HandlerRegistry::new();
        registry.register_kit(kit);
        let handler = registry.get("fail").unwrap();
        let inputs: Values = serde_json::from_value(json!({"message": "nope"})).unwrap();
        let out = invoke_handler(handler.as_ref(), inputs, ctx(), |_| {})
            .await
            .unwrap();
        assert_eq!(out["$error"]["message"], "nope");

        let err = invoke_handler(handler.as_ref(), Values::new(), ctx(), |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "HandlerInvocationFailure");
    }
}
