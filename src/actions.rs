//! Agent-proposed refinement actions
//!
//! Plans arrive as untrusted JSON. Each action is decoded on its own into
//! a [`RefinementAction`]; the `type` tag is matched case-insensitively and
//! unknown tags are rejected instead of ignored. Id fields default to empty
//! so that missing ids surface as validation errors, not decode failures.

use crate::error::{MemoryError, Result};
use crate::types::MemoryId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionKind {
    Update,
    Delete,
    Merge,
    Create,
}

impl ActionKind {
    pub const ALL: &[ActionKind] = &[
        ActionKind::Update,
        ActionKind::Delete,
        ActionKind::Merge,
        ActionKind::Create,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Update => "UPDATE",
            ActionKind::Delete => "DELETE",
            ActionKind::Merge => "MERGE",
            ActionKind::Create => "CREATE",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        let tag = tag.trim().to_ascii_uppercase();
        Self::ALL.iter().copied().find(|k| k.as_str() == tag)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAction {
    #[serde(default)]
    pub id: MemoryId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_update: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_updates: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeleteAction {
    #[serde(default)]
    pub delete_ids: Vec<MemoryId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MergeAction {
    #[serde(default)]
    pub target_id: MemoryId,
    #[serde(default)]
    pub merge_source_ids: Vec<MemoryId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_metadata: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_memory: Option<NewMemory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Payload of a CREATE action
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewMemory {
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_from_ids: Option<Vec<MemoryId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// One mutation proposed by an external planner
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum RefinementAction {
    Update(UpdateAction),
    Delete(DeleteAction),
    Merge(MergeAction),
    Create(CreateAction),
}

impl RefinementAction {
    /// Decode one untrusted action
    pub fn decode(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| MemoryError::Validation("action must be a JSON object".to_string()))?;

        let tag = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| MemoryError::Validation("action is missing its type".to_string()))?;

        let kind = ActionKind::parse(tag)
            .ok_or_else(|| MemoryError::Validation(format!("unknown action type '{tag}'")))?;

        let mut object = object.clone();
        object.insert("type".to_string(), Value::String(kind.as_str().to_string()));

        serde_json::from_value(Value::Object(object))
            .map_err(|e| MemoryError::Validation(format!("malformed {kind} action: {e}")))
    }

    /// Best-effort tag of an undecodable action, for reporting
    pub fn peek_kind(value: &Value) -> Option<ActionKind> {
        value.get("type").and_then(Value::as_str).and_then(ActionKind::parse)
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            RefinementAction::Update(_) => ActionKind::Update,
            RefinementAction::Delete(_) => ActionKind::Delete,
            RefinementAction::Merge(_) => ActionKind::Merge,
            RefinementAction::Create(_) => ActionKind::Create,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            RefinementAction::Update(a) => a.reason.as_deref(),
            RefinementAction::Delete(a) => a.reason.as_deref(),
            RefinementAction::Merge(a) => a.reason.as_deref(),
            RefinementAction::Create(a) => a.reason.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_each_kind() {
        let update = RefinementAction::decode(&json!({
            "type": "UPDATE",
            "id": "m1",
            "textUpdate": "new text",
            "reason": "typo"
        }))
        .unwrap();
        assert_eq!(update.kind(), ActionKind::Update);
        assert_eq!(update.reason(), Some("typo"));

        let merge = RefinementAction::decode(&json!({
            "type": "merge",
            "targetId": "t",
            "mergeSourceIds": ["a", "b"],
            "mergedMetadata": { "importance": "high" }
        }))
        .unwrap();
        let RefinementAction::Merge(merge) = merge else {
            panic!("expected MERGE");
        };
        assert_eq!(merge.merge_source_ids, vec!["a", "b"]);
        assert!(merge.merged_metadata.is_some());

        let create = RefinementAction::decode(&json!({
            "type": "Create",
            "newMemory": { "text": "insight", "derivedFromIds": ["a"] }
        }))
        .unwrap();
        assert_eq!(create.kind(), ActionKind::Create);
    }

    #[test]
    fn missing_ids_decode_as_empty() {
        let action = RefinementAction::decode(&json!({ "type": "DELETE" })).unwrap();
        let RefinementAction::Delete(delete) = action else {
            panic!("expected DELETE");
        };
        assert!(delete.delete_ids.is_empty());
    }

    #[test]
    fn rejects_unknown_and_missing_tags() {
        let err = RefinementAction::decode(&json!({ "type": "RENAME", "id": "x" })).unwrap_err();
        assert!(err.to_string().contains("unknown action type 'RENAME'"));

        assert!(RefinementAction::decode(&json!({ "id": "x" })).is_err());
        assert!(RefinementAction::decode(&json!("UPDATE")).is_err());
    }

    #[test]
    fn rejects_malformed_payloads() {
        let err = RefinementAction::decode(&json!({ "type": "DELETE", "deleteIds": "a,b" })).unwrap_err();
        assert!(err.to_string().contains("malformed DELETE action"));
        assert_eq!(
            RefinementAction::peek_kind(&json!({ "type": "delete" })),
            Some(ActionKind::Delete)
        );
    }
}
