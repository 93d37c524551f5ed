//! Artifacts and per-execution recorded node outputs.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::errors::Result;

/// Artifact payload kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ArtifactKind {
    GeneratedText,
}

/// One message inside a generated-text artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMessage {
    pub role: String,
    pub content: String,
}

/// Tagged artifact payload. Generated text is the one kind currently
/// modeled; the tag keeps the persisted shape open for more.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ArtifactObject {
    GeneratedText {
        title: String,
        content: String,
        messages: Vec<ArtifactMessage>,
    },
}

impl ArtifactObject {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            ArtifactObject::GeneratedText { .. } => ArtifactKind::GeneratedText,
        }
    }
}

/// A recorded output produced by one node during one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ArtifactKind,
    pub creator_node_id: String,
    pub object: ArtifactObject,
}

impl Artifact {
    pub fn new(creator_node_id: impl Into<String>, object: ArtifactObject) -> Self {
        Self {
            id: cuid2::create_id(),
            kind: object.kind(),
            creator_node_id: creator_node_id.into(),
            object,
        }
    }
}

/// Recorded node output messages for one execution.
///
/// The dependency resolver stops recursing at a node once a message exists
/// for it. Cloning shares the underlying map, so concurrently running steps
/// observe each other's recordings.
#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    data: Arc<DashMap<String, Value>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self {
            data: Arc::new(DashMap::new()),
        }
    }

    pub fn record<T: Serialize>(&self, node_id: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.data.insert(node_id.to_string(), value);
        Ok(())
    }

    pub fn get(&self, node_id: &str) -> Option<Value> {
        self.data.get(node_id).map(|entry| entry.value().clone())
    }

    pub fn has_message(&self, node_id: &str) -> bool {
        self.data.contains_key(node_id)
    }

    /// Drops the recorded message for one node, forcing re-resolution.
    pub fn purge(&self, node_id: &str) {
        self.data.remove(node_id);
    }

    /// Seeds messages from previously recorded artifacts, so a retry does
    /// not re-run nodes whose outputs were carried over.
    pub fn seed_from_artifacts(&self, artifacts: &[Artifact]) -> Result<()> {
        for artifact in artifacts {
            self.record(&artifact.creator_node_id, &artifact.object)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn generated(title: &str) -> ArtifactObject {
        ArtifactObject::GeneratedText {
            title: title.to_string(),
            content: "body".to_string(),
            messages: vec![ArtifactMessage {
                role: "assistant".to_string(),
                content: "body".to_string(),
            }],
        }
    }

    #[test]
    fn test_artifact_kind_matches_object() {
        let artifact = Artifact::new("node1", generated("t"));
        assert_eq!(artifact.kind, ArtifactKind::GeneratedText);
        assert_eq!(artifact.creator_node_id, "node1");
        assert!(!artifact.id.is_empty());
    }

    #[test]
    fn test_artifact_json_shape() {
        let artifact = Artifact::new("node1", generated("story"));
        let json = serde_json::to_value(&artifact).unwrap();
        assert_eq!(json["type"], "generatedText");
        assert_eq!(json["creatorNodeId"], "node1");
        assert_eq!(json["object"]["type"], "generatedText");
        assert_eq!(json["object"]["title"], "story");
    }

    #[test]
    fn test_message_store_record_and_purge() {
        let store = MessageStore::new();
        assert!(!store.has_message("a"));
        store.record("a", &json!({"k": 1})).unwrap();
        assert!(store.has_message("a"));
        assert_eq!(store.get("a").unwrap()["k"], 1);

        let shared = store.clone();
        shared.purge("a");
        assert!(!store.has_message("a"));
    }

    #[test]
    fn test_seed_from_artifacts() {
        let store = MessageStore::new();
        let artifacts = vec![
            Artifact::new("a", generated("one")),
            Artifact::new("b", generated("two")),
        ];
        store.seed_from_artifacts(&artifacts).unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.has_message("a"));
        assert!(store.has_message("b"));
    }
}
