use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A node that was skipped and never became ready again, with the ports it lacked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StalledNode {
    pub node: String,
    pub missing: Vec<String>,
}

impl fmt::Display for StalledNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} missing [{}]", self.node, self.missing.join(", "))
    }
}

fn list_stalled(stalled: &[StalledNode]) -> String {
    stalled
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum BoardwalkError {
    // Graph errors
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("No node found for id \"{0}\"")]
    NodeNotFound(String),

    #[error("No entry node found in graph")]
    NoEntryNode,

    #[error("Failed to load graph {url}: {message}")]
    GraphLoad { url: String, message: String },

    // Handler errors
    #[error("No handler for node type \"{0}\"")]
    HandlerNotFound(String),

    #[error("Handler for node \"{node}\" failed: {message}")]
    HandlerInvocation { node: String, message: String },

    // Traversal errors
    #[error(
        "Output unreachable: no path to output node(s) [{}]; stalled: {}",
        outputs.join(", "),
        list_stalled(stalled)
    )]
    OutputUnreachable {
        outputs: Vec<String>,
        stalled: Vec<StalledNode>,
    },

    #[error("Run exceeded max steps ({0})")]
    StepLimitExceeded(usize),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Run state error: {0}")]
    RunState(String),

    // Reanimation errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BoardwalkError {
    /// Stable name of the error variant, carried by `error` events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidGraph(_) => "InvalidGraph",
            Self::NodeNotFound(_) => "NodeNotFound",
            Self::NoEntryNode => "NoEntryNode",
            Self::GraphLoad { .. } => "GraphLoad",
            Self::HandlerNotFound(_) => "HandlerNotFound",
            Self::HandlerInvocation { .. } => "HandlerInvocationFailure",
            Self::OutputUnreachable { .. } => "OutputUnreachable",
            Self::StepLimitExceeded(_) => "StepLimitExceeded",
            Self::Cancelled => "Cancelled",
            Self::RunState(_) => "RunState",
            Self::Serialization(_) => "SerializationError",
            Self::Config(_) | Self::ConfigNotFound(_) => "Config",
            Self::Io(_) => "Io",
            Self::Json(_) => "Json",
        }
    }

    /// Shorthand for a handler failure attributed to `node`.
    pub fn handler(node: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::HandlerInvocation {
            node: node.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BoardwalkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_unreachable_message() {
        let err = BoardwalkError::OutputUnreachable {
            outputs: vec!["c".into()],
            stalled: vec![StalledNode {
                node: "b".into(),
                missing: vec!["bar".into()],
            }],
        };
        let msg = err.to_string();
        assert!(msg.contains("[c]"));
        assert!(msg.contains("b missing [bar]"));
        assert_eq!(err.kind(), "OutputUnreachable");
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(
            BoardwalkError::HandlerNotFound("x".into()).kind(),
            "HandlerNotFound"
        );
        assert_eq!(
            BoardwalkError::handler("n", "boom").kind(),
            "HandlerInvocationFailure"
        );
        assert_eq!(
            BoardwalkError::Serialization("bad".into()).kind(),
            "SerializationError"
        );
    }
}
