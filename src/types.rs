//! Memory records, bitemporal dynamics and relationship edges

use crate::error::{MemoryError, Result};
use crate::temporal::TemporalPolicy;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Unique identifier for memories
pub type MemoryId = String;

/// Legacy reserved prefix for system-owned records
pub const SYSTEM_ID_PREFIX: &str = "sys_";

/// `source` value marking a record as system-owned
pub const SYSTEM_SOURCE: &str = "system";

/// Whether an id carries the reserved system prefix
pub fn is_reserved_id(id: &str) -> bool {
    id.starts_with(SYSTEM_ID_PREFIX)
}

/// A stored memory: identity, content and metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRecord {
    /// Unique identifier
    pub id: MemoryId,
    /// The memory content
    pub text: String,
    /// Classification, dynamics and graph edges
    #[serde(default)]
    pub metadata: MemoryMetadata,
}

impl MemoryRecord {
    /// Create a new record stamped with the current time
    pub fn new(text: impl Into<String>, memory_type: MemoryType) -> Self {
        Self::new_at(text, memory_type, Utc::now())
    }

    /// Create a new record as if ingested at `now`
    pub fn new_at(text: impl Into<String>, memory_type: MemoryType, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            metadata: MemoryMetadata {
                memory_type,
                dynamics: MemoryDynamics::created_at(now),
                ..MemoryMetadata::default()
            },
        }
    }

    pub fn with_id(mut self, id: impl Into<MemoryId>) -> Self {
        self.id = id.into();
        self
    }

    /// Set narrative time (when the fact was true in-world)
    pub fn with_valid_at(mut self, valid_at: DateTime<Utc>) -> Self {
        self.metadata.dynamics.valid_at = Some(valid_at);
        self
    }

    pub fn with_importance(mut self, importance: Importance) -> Self {
        self.metadata.importance = Some(importance);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.metadata.source = Some(source.into());
        self
    }

    pub fn with_stability(mut self, stability: Stability) -> Self {
        self.metadata.dynamics.stability = stability;
        self
    }

    pub fn with_protection(mut self, protection: ProtectionClass) -> Self {
        self.metadata.protection = protection;
        self
    }

    pub fn with_relationship(mut self, relationship: Relationship) -> Self {
        self.metadata
            .relationships
            .get_or_insert_with(Vec::new)
            .push(relationship);
        self
    }

    /// Narrative timestamp: `validAt`, falling back to `createdAt`
    pub fn narrative_time(&self) -> Option<DateTime<Utc>> {
        let dynamics = &self.metadata.dynamics;
        dynamics.valid_at.or(dynamics.created_at)
    }

    /// System-owned records can never be touched by agent plans
    pub fn is_protected(&self) -> bool {
        self.metadata.protection == ProtectionClass::System
            || self.metadata.source.as_deref() == Some(SYSTEM_SOURCE)
            || is_reserved_id(&self.id)
    }

    /// Soft-deleted by supersession
    pub fn is_superseded(&self) -> bool {
        self.metadata.superseded_by_id.is_some()
    }

    /// Outgoing edges, empty when none are loaded
    pub fn relationships(&self) -> &[Relationship] {
        self.metadata.relationships.as_deref().unwrap_or(&[])
    }

    /// Merge an untrusted metadata patch into this record.
    ///
    /// Objects merge recursively, `null` removes a key, everything else
    /// replaces. A `priority` key overrides `currentPriority`. The merged
    /// metadata must still decode into [`MemoryMetadata`].
    pub fn apply_metadata_patch(&mut self, patch: &Map<String, Value>) -> Result<()> {
        let mut patch = patch.clone();
        let priority = patch.remove("priority");

        let mut current = serde_json::to_value(&self.metadata)?;
        merge_json(&mut current, &Value::Object(patch));

        let mut metadata: MemoryMetadata = serde_json::from_value(current).map_err(|e| {
            MemoryError::Validation(format!("metadata does not fit the record schema: {e}"))
        })?;

        if let Some(priority) = priority {
            let value = priority
                .as_f64()
                .filter(|p| p.is_finite() && (0.0..=1.0).contains(p))
                .ok_or_else(|| {
                    MemoryError::Validation(format!("priority must be a number in [0,1], got {priority}"))
                })?;
            metadata.dynamics.current_priority = value;
        }

        self.metadata = metadata;
        Ok(())
    }
}

/// Record metadata (camelCase on the wire)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryMetadata {
    #[serde(default, deserialize_with = "lenient_memory_type")]
    pub memory_type: MemoryType,
    #[serde(default)]
    pub kind: MemoryKind,
    #[serde(default, alias = "protectionClass")]
    pub protection: ProtectionClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_importance",
        skip_serializing_if = "Option::is_none"
    )]
    pub importance: Option<Importance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotional_intensity: Option<f64>,
    #[serde(default)]
    pub dynamics: MemoryDynamics,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub derived_from_ids: Vec<MemoryId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by_id: Option<MemoryId>,
    /// `None` means "not loaded": an upsert leaves stored edges untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationships: Option<Vec<Relationship>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consolidation: Option<ConsolidationInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Unknown keys, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Salience and bitemporal bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryDynamics {
    #[serde(default = "default_priority")]
    pub initial_priority: f64,
    #[serde(default = "default_priority")]
    pub current_priority: f64,
    /// System time the record was created
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
    /// Narrative time; drives decay
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub valid_at: Option<DateTime<Utc>>,
    /// System time the fact was ingested
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub recorded_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_accessed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub access_count: i64,
    #[serde(default)]
    pub max_access_count: i64,
    #[serde(default)]
    pub stability: Stability,
    #[serde(default)]
    pub sleep_cycles: i64,
    #[serde(default = "default_time_confidence")]
    pub time_confidence: f64,
}

fn default_priority() -> f64 {
    0.5
}

fn default_time_confidence() -> f64 {
    1.0
}

impl MemoryDynamics {
    pub fn created_at(now: DateTime<Utc>) -> Self {
        Self {
            created_at: Some(now),
            recorded_at: Some(now),
            ..Self::default()
        }
    }
}

impl Default for MemoryDynamics {
    fn default() -> Self {
        Self {
            initial_priority: default_priority(),
            current_priority: default_priority(),
            created_at: None,
            valid_at: None,
            recorded_at: None,
            last_accessed_at: None,
            access_count: 0,
            max_access_count: 0,
            stability: Stability::default(),
            sleep_cycles: 0,
            time_confidence: default_time_confidence(),
        }
    }
}

/// Semantic type; selects the decay weights
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// Statements about the agent itself
    #[serde(rename = "self")]
    Identity,
    Belief,
    Pattern,
    Episodic,
    #[default]
    Semantic,
}

impl MemoryType {
    pub const ALL: &[MemoryType] = &[
        MemoryType::Identity,
        MemoryType::Belief,
        MemoryType::Pattern,
        MemoryType::Episodic,
        MemoryType::Semantic,
    ];

    /// Parse a type label; unknown labels are `None`
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "self" | "identity" => Some(MemoryType::Identity),
            "belief" => Some(MemoryType::Belief),
            "pattern" => Some(MemoryType::Pattern),
            "episodic" => Some(MemoryType::Episodic),
            "semantic" => Some(MemoryType::Semantic),
            _ => None,
        }
    }

    /// Identity and belief statements get the canonical priority floor
    pub fn is_self_or_belief(&self) -> bool {
        matches!(self, MemoryType::Identity | MemoryType::Belief)
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryType::Identity => write!(f, "self"),
            MemoryType::Belief => write!(f, "belief"),
            MemoryType::Pattern => write!(f, "pattern"),
            MemoryType::Episodic => write!(f, "episodic"),
            MemoryType::Semantic => write!(f, "semantic"),
        }
    }
}

/// How a record came to exist
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    #[default]
    Raw,
    Summary,
    Derived,
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryKind::Raw => write!(f, "raw"),
            MemoryKind::Summary => write!(f, "summary"),
            MemoryKind::Derived => write!(f, "derived"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stability {
    #[default]
    Tentative,
    Stable,
    Canonical,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionClass {
    #[default]
    None,
    System,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    High,
    Medium,
    Low,
}

impl Importance {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Some(Importance::High),
            "medium" => Some(Importance::Medium),
            "low" => Some(Importance::Low),
            _ => None,
        }
    }
}

impl std::fmt::Display for Importance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Importance::High => write!(f, "high"),
            Importance::Medium => write!(f, "medium"),
            Importance::Low => write!(f, "low"),
        }
    }
}

/// Directed edge from the owning record to `target_id`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub target_id: MemoryId,
    #[serde(rename = "type")]
    pub rel_type: RelationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub valid_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub recorded_at: Option<DateTime<Utc>>,
    /// Set by the temporal validator; `None` means unchecked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporal_ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporal_reason: Option<String>,
}

impl Relationship {
    pub fn new(target_id: impl Into<MemoryId>, rel_type: RelationType) -> Self {
        Self {
            target_id: target_id.into(),
            rel_type,
            weight: None,
            valid_at: None,
            recorded_at: None,
            temporal_ok: None,
            temporal_reason: None,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight.clamp(0.0, 1.0));
        self
    }
}

/// Fixed relationship vocabulary
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    Summarizes,
    ExampleOf,
    IsGeneralizationOf,
    Supports,
    Contradicts,
    Causes,
    SimilarTo,
    HistoricalVersionOf,
    DerivedFrom,
    LeadsTo,
    Informs,
    Consolidates,
    EvolvesInto,
}

impl RelationType {
    pub const ALL: &[RelationType] = &[
        RelationType::Summarizes,
        RelationType::ExampleOf,
        RelationType::IsGeneralizationOf,
        RelationType::Supports,
        RelationType::Contradicts,
        RelationType::Causes,
        RelationType::SimilarTo,
        RelationType::HistoricalVersionOf,
        RelationType::DerivedFrom,
        RelationType::LeadsTo,
        RelationType::Informs,
        RelationType::Consolidates,
        RelationType::EvolvesInto,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::Summarizes => "summarizes",
            RelationType::ExampleOf => "example_of",
            RelationType::IsGeneralizationOf => "is_generalization_of",
            RelationType::Supports => "supports",
            RelationType::Contradicts => "contradicts",
            RelationType::Causes => "causes",
            RelationType::SimilarTo => "similar_to",
            RelationType::HistoricalVersionOf => "historical_version_of",
            RelationType::DerivedFrom => "derived_from",
            RelationType::LeadsTo => "leads_to",
            RelationType::Informs => "informs",
            RelationType::Consolidates => "consolidates",
            RelationType::EvolvesInto => "evolves_into",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == s)
    }
}

impl std::fmt::Display for RelationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bookkeeping stored on consolidation summaries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationInfo {
    pub window_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus: Option<String>,
    pub source_count: usize,
    /// Idempotency hash over sources, bounds and focus
    pub hash: String,
    pub format_version: u32,
    pub policy: TemporalPolicy,
    pub consolidated_at: DateTime<Utc>,
}

/// A supersession applied to storage: `source_id` is replaced by `superseded_by_id`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SupersededPair {
    pub source_id: MemoryId,
    pub superseded_by_id: MemoryId,
}

/// Parse an RFC 3339 timestamp or a bare `YYYY-MM-DD` date
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Unparseable timestamps decode as absent instead of failing the record
fn lenient_timestamp<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(Value::String(s)) => parse_timestamp(&s),
        Some(Value::Number(n)) => n.as_i64().and_then(DateTime::<Utc>::from_timestamp_millis),
        _ => None,
    })
}

fn lenient_importance<'de, D>(deserializer: D) -> std::result::Result<Option<Importance>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(Value::as_str).and_then(Importance::parse))
}

fn lenient_memory_type<'de, D>(deserializer: D) -> std::result::Result<MemoryType, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw
        .as_ref()
        .and_then(Value::as_str)
        .and_then(MemoryType::parse)
        .unwrap_or_default())
}

/// Recursive JSON merge: objects merge, `null` deletes, other values replace
fn merge_json(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    target.remove(key);
                } else {
                    merge_json(target.entry(key.clone()).or_insert(Value::Null), value);
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn unparseable_timestamps_decode_as_absent() {
        let metadata: MemoryMetadata = serde_json::from_value(json!({
            "memoryType": "episodic",
            "dynamics": { "validAt": "not a date", "createdAt": "2025-01-05" }
        }))
        .unwrap();

        assert_eq!(metadata.memory_type, MemoryType::Episodic);
        assert_eq!(metadata.dynamics.valid_at, None);
        assert_eq!(
            metadata.dynamics.created_at,
            Some(Utc.with_ymd_and_hms(2025, 1, 5, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn unknown_type_and_importance_fall_back() {
        let metadata: MemoryMetadata = serde_json::from_value(json!({
            "memoryType": "gossip",
            "importance": "urgent"
        }))
        .unwrap();

        assert_eq!(metadata.memory_type, MemoryType::Semantic);
        assert_eq!(metadata.importance, None);
    }

    #[test]
    fn self_type_round_trips_as_self() {
        let record = MemoryRecord::new("I prefer terse answers", MemoryType::Identity);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["metadata"]["memoryType"], "self");
    }

    #[test]
    fn narrative_time_falls_back_to_creation() {
        let created = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let record = MemoryRecord::new_at("x", MemoryType::Semantic, created);
        assert_eq!(record.narrative_time(), Some(created));

        let valid = Utc.with_ymd_and_hms(2024, 12, 24, 0, 0, 0).unwrap();
        assert_eq!(record.with_valid_at(valid).narrative_time(), Some(valid));
    }

    #[test]
    fn protection_checks_field_source_and_prefix() {
        let plain = MemoryRecord::new("x", MemoryType::Semantic).with_id("abc");
        assert!(!plain.is_protected());
        assert!(plain.clone().with_protection(ProtectionClass::System).is_protected());
        assert!(plain.clone().with_source(SYSTEM_SOURCE).is_protected());
        assert!(plain.with_id("sys_abc").is_protected());
    }

    #[test]
    fn metadata_patch_merges_and_preserves_unknown_keys() {
        let mut record = MemoryRecord::new("x", MemoryType::Semantic);
        record.metadata.extra.insert("topic".into(), json!("rust"));

        let patch = json!({
            "importance": "high",
            "dynamics": { "stability": "stable" },
            "priority": 0.8,
            "topic": null,
            "project": "refinery"
        });
        record
            .apply_metadata_patch(patch.as_object().unwrap())
            .unwrap();

        assert_eq!(record.metadata.importance, Some(Importance::High));
        assert_eq!(record.metadata.dynamics.stability, Stability::Stable);
        assert_eq!(record.metadata.dynamics.current_priority, 0.8);
        assert!(record.metadata.dynamics.created_at.is_some());
        assert!(!record.metadata.extra.contains_key("topic"));
        assert_eq!(record.metadata.extra["project"], "refinery");
    }

    #[test]
    fn metadata_patch_rejects_schema_breaks() {
        let mut record = MemoryRecord::new("x", MemoryType::Semantic);
        let patch = json!({ "dynamics": { "stability": "wobbly" } });
        assert!(record
            .apply_metadata_patch(patch.as_object().unwrap())
            .is_err());

        let patch = json!({ "priority": 1.5 });
        assert!(record
            .apply_metadata_patch(patch.as_object().unwrap())
            .is_err());
    }

    #[test]
    fn relation_types_parse_from_wire_names() {
        for rel in RelationType::ALL {
            assert_eq!(RelationType::parse(rel.as_str()), Some(*rel));
        }
        assert_eq!(RelationType::parse("related_to"), None);
    }
}
