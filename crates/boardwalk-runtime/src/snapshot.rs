use serde::{Deserialize, Serialize};

use boardwalk_core::error::{BoardwalkError, Result};
use boardwalk_core::types::{GraphDescriptor, NodeId, Values};

use crate::reanimation::ReanimationState;
use crate::traversal::TraversalResult;

/// Version written into every snapshot; anything else is rejected on load.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Serde adapter writing ordered maps as `{"$type":"Map","value":[[k,v],...]}`.
///
/// Plain JSON objects are rejected on read so a store written by another
/// tool without tagging fails loudly instead of loading empty.
pub mod tagged_map {
    use std::collections::BTreeMap;

    use serde::de::Error as _;
    use serde::ser::SerializeStruct;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    const MAP_TAG: &str = "Map";

    pub fn serialize<K, V, S>(map: &BTreeMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        K: Serialize,
        V: Serialize,
        S: Serializer,
    {
        let entries: Vec<(&K, &V)> = map.iter().collect();
        let mut tagged = serializer.serialize_struct("Map", 2)?;
        tagged.serialize_field("$type", MAP_TAG)?;
        tagged.serialize_field("value", &entries)?;
        tagged.end()
    }

    pub fn deserialize<'de, K, V, D>(deserializer: D) -> Result<BTreeMap<K, V>, D::Error>
    where
        K: Deserialize<'de> + Ord,
        V: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Tagged<K, V> {
            #[serde(rename = "$type")]
            tag: String,
            value: Vec<(K, V)>,
        }

        let tagged = Tagged::<K, V>::deserialize(deserializer)?;
        if tagged.tag != MAP_TAG {
            return Err(D::Error::custom(format!(
                "expected $type \"{}\", found \"{}\"",
                MAP_TAG, tagged.tag
            )));
        }
        Ok(tagged.value.into_iter().collect())
    }
}

/// What the run was waiting for when it was saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    Input,
    Secret,
}

/// Position of one harness frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameInfo {
    /// Board run by the frame; absent for the top-level frame, whose board
    /// is supplied again on resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<GraphDescriptor>,
    /// Path of the `invoke` node that opened the frame (empty at top level).
    #[serde(default)]
    pub path: Vec<usize>,
    /// Number of traversal steps taken in the frame so far.
    #[serde(default)]
    pub invocation_id: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<NodeId>,
    /// Arguments answering the frame's input nodes.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub args: Values,
    #[serde(default)]
    pub produced_output: bool,
}

/// An enclosing frame together with its own traversal position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentFrame {
    #[serde(flatten)]
    pub frame: FrameInfo,
    pub state: TraversalResult,
}

/// Everything needed to continue a suspended run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    #[serde(rename = "type")]
    pub kind: SnapshotKind,
    pub version: u32,
    /// Result of the waiting frame; its descriptor is the node asking for values.
    pub state: TraversalResult,
    pub frame: FrameInfo,
    /// Enclosing frames, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<ParentFrame>,
    #[serde(default)]
    pub reanimation: ReanimationState,
    /// Inputs preset for the top-level run.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub inputs: Values,
}

impl RunSnapshot {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| BoardwalkError::Serialization(e.to_string()))
    }

    /// Parse and check a saved snapshot.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| BoardwalkError::Serialization(e.to_string()))?;
        check_version(&value)?;
        let snapshot: Self = serde_json::from_value(value)
            .map_err(|e| BoardwalkError::Serialization(e.to_string()))?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Node the run is waiting on.
    pub fn waiting_node(&self) -> &str {
        &self.state.descriptor.id
    }

    pub fn validate(&self) -> Result<()> {
        if self.version != SNAPSHOT_VERSION {
            return Err(unsupported_version(self.version));
        }
        self.state.validate()?;
        if self.state.is_entry() || self.state.skip {
            return Err(BoardwalkError::Serialization(format!(
                "snapshot is not waiting on a runnable node (found \"{}\")",
                self.state.descriptor.id
            )));
        }
        for parent in &self.parents {
            parent.state.validate()?;
        }
        if !self.parents.is_empty() && self.frame.graph.is_none() {
            return Err(BoardwalkError::Serialization(
                "nested frame is missing its board".into(),
            ));
        }
        Ok(())
    }
}

fn check_version(value: &serde_json::Value) -> Result<()> {
    match value.get("version").and_then(|v| v.as_u64()) {
        Some(v) if v == u64::from(SNAPSHOT_VERSION) => Ok(()),
        Some(v) => Err(unsupported_version(v)),
        None => Err(BoardwalkError::Serialization(
            "snapshot has no version".into(),
        )),
    }
}

fn unsupported_version(version: impl std::fmt::Display) -> BoardwalkError {
    BoardwalkError::Serialization(format!(
        "unsupported snapshot version {} (expected {})",
        version, SNAPSHOT_VERSION
    ))
}

/// Serialize a single traversal result.
pub fn save(result: &TraversalResult) -> Result<String> {
    serde_json::to_string(result).map_err(|e| BoardwalkError::Serialization(e.to_string()))
}

/// Parse a traversal result written by [`save`].
pub fn load(text: &str) -> Result<TraversalResult> {
    let result: TraversalResult =
        serde_json::from_str(text).map_err(|e| BoardwalkError::Serialization(e.to_string()))?;
    result.validate()?;
    Ok(result)
}
