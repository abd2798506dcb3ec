//! Reconsolidation of memories surfaced by a retrieval
//!
//! A plan may only touch ids the triggering retrieval actually returned.
//! References outside that set are dropped and noted, never applied. The
//! executor is best-effort: it always returns a report, and a storage failure
//! only truncates the steps that had not run yet.

use crate::actions::NewMemory;
use crate::error::Result;
use crate::refine::derived_record;
use crate::report::ConsolidationReport;
use crate::storage::MemoryStorage;
use crate::temporal::TemporalValidator;
use crate::types::{MemoryId, SupersededPair};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Plan proposed after a retrieval
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReconsolidationPlan {
    #[serde(default)]
    pub derived_memories: Vec<NewMemory>,
    #[serde(default)]
    pub supersessions: Vec<SupersessionPair>,
    #[serde(default)]
    pub sleep_cycle_targets: Vec<MemoryId>,
}

/// `sourceId` is replaced by `supersededById`, which is either a memory id or
/// a 0-based index into the plan's derived memories
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SupersessionPair {
    pub source_id: MemoryId,
    pub superseded_by_id: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupersessionTarget {
    ById(MemoryId),
    ByIndex(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SupersessionError {
    #[error("supersededById must be a memory id or a non-negative integer index, got {0}")]
    Malformed(String),

    #[error("derived index {index} is out of range ({len} derived memories)")]
    OutOfRange { index: usize, len: usize },

    #[error("derived memory {0} was not created")]
    NotCreated(usize),
}

impl SupersessionTarget {
    pub fn parse(value: &Value) -> std::result::Result<Self, SupersessionError> {
        match value {
            Value::String(id) if !id.trim().is_empty() => Ok(SupersessionTarget::ById(id.clone())),
            Value::Number(n) => n
                .as_u64()
                .and_then(|i| usize::try_from(i).ok())
                .map(SupersessionTarget::ByIndex)
                .ok_or_else(|| SupersessionError::Malformed(n.to_string())),
            other => Err(SupersessionError::Malformed(other.to_string())),
        }
    }

    /// Resolve against the derived list, where `None` marks entries that
    /// were not created
    pub fn resolve(&self, created: &[Option<MemoryId>]) -> std::result::Result<MemoryId, SupersessionError> {
        match self {
            SupersessionTarget::ById(id) => Ok(id.clone()),
            SupersessionTarget::ByIndex(index) => match created.get(*index) {
                Some(Some(id)) => Ok(id.clone()),
                Some(None) => Err(SupersessionError::NotCreated(*index)),
                None => Err(SupersessionError::OutOfRange {
                    index: *index,
                    len: created.len(),
                }),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconsolidationConfig {
    /// Runs slower than this get a note in the report
    pub slow_threshold_ms: u64,
}

impl Default for ReconsolidationConfig {
    fn default() -> Self {
        Self {
            slow_threshold_ms: 500,
        }
    }
}

pub struct ReconsolidationExecutor {
    storage: Arc<dyn MemoryStorage>,
    validator: TemporalValidator,
    config: ReconsolidationConfig,
}

impl ReconsolidationExecutor {
    pub fn new(
        storage: Arc<dyn MemoryStorage>,
        validator: TemporalValidator,
        config: ReconsolidationConfig,
    ) -> Self {
        Self {
            storage,
            validator,
            config,
        }
    }

    pub async fn execute(
        &self,
        plan: &ReconsolidationPlan,
        index: &str,
        valid_ids: &[MemoryId],
    ) -> ConsolidationReport {
        self.execute_at(plan, index, valid_ids, Utc::now()).await
    }

    pub async fn execute_at(
        &self,
        plan: &ReconsolidationPlan,
        index: &str,
        valid_ids: &[MemoryId],
        now: DateTime<Utc>,
    ) -> ConsolidationReport {
        let started = Instant::now();
        let valid: HashSet<&str> = valid_ids.iter().map(String::as_str).collect();
        let mut report = ConsolidationReport::default();
        let mut notes = Vec::new();

        if let Err(e) = self
            .run(plan, index, &valid, now, &mut report, &mut notes)
            .await
        {
            tracing::warn!("Reconsolidation of '{}' stopped early: {}", index, e);
            notes.push(format!("stopped early: {e}"));
        }

        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        if report.duration_ms > self.config.slow_threshold_ms {
            tracing::warn!(
                "Reconsolidation of '{}' took {}ms (threshold {}ms)",
                index,
                report.duration_ms,
                self.config.slow_threshold_ms
            );
            notes.push(format!(
                "took {}ms, over the {}ms threshold",
                report.duration_ms, self.config.slow_threshold_ms
            ));
        }

        tracing::info!(
            "Reconsolidated '{}': {} created, {} superseded, {} sleep cycles",
            index,
            report.created_memory_ids.len(),
            report.superseded_pairs.len(),
            report.sleep_cycle_incremented_ids.len()
        );
        report.notes = (!notes.is_empty()).then(|| notes.join("; "));
        report
    }

    async fn run(
        &self,
        plan: &ReconsolidationPlan,
        index: &str,
        valid: &HashSet<&str>,
        now: DateTime<Utc>,
        report: &mut ConsolidationReport,
        notes: &mut Vec<String>,
    ) -> Result<()> {
        let created = self.create_derived(plan, index, valid, now, report, notes).await?;
        self.apply_supersessions(plan, index, valid, &created, report, notes)
            .await?;
        self.bump_sleep_cycles(plan, index, valid, report, notes)
            .await
    }

    /// Step one: returns one slot per planned derived memory, `None` where
    /// the entry was rejected
    async fn create_derived(
        &self,
        plan: &ReconsolidationPlan,
        index: &str,
        valid: &HashSet<&str>,
        now: DateTime<Utc>,
        report: &mut ConsolidationReport,
        notes: &mut Vec<String>,
    ) -> Result<Vec<Option<MemoryId>>> {
        let mut slots = Vec::with_capacity(plan.derived_memories.len());
        let mut records = Vec::new();

        for (pos, derived) in plan.derived_memories.iter().enumerate() {
            let origin_ids = derived.derived_from_ids.as_deref().unwrap_or_default();
            if origin_ids.is_empty() {
                notes.push(format!("derived memory {pos} has no derivedFromIds"));
                slots.push(None);
                continue;
            }

            let rejected = outside(origin_ids, valid);
            if !rejected.is_empty() {
                tracing::warn!("Dropping derived memory {}: unknown origins {:?}", pos, rejected);
                notes.push(format!(
                    "derived memory {pos} cites ids outside the retrieval: {}",
                    rejected.join(", ")
                ));
                slots.push(None);
                continue;
            }
            if derived.text.trim().is_empty() {
                notes.push(format!("derived memory {pos} has blank text"));
                slots.push(None);
                continue;
            }

            let origins = self.storage.get_memories(index, origin_ids).await?;
            let record = derived_record(&self.validator, derived, &origins, now)?;
            slots.push(Some(record.id.clone()));
            records.push(record);
        }

        if !records.is_empty() {
            report.created_memory_ids = self.storage.upsert_memories(index, &records, None).await?;
        }
        Ok(slots)
    }

    async fn apply_supersessions(
        &self,
        plan: &ReconsolidationPlan,
        index: &str,
        valid: &HashSet<&str>,
        created: &[Option<MemoryId>],
        report: &mut ConsolidationReport,
        notes: &mut Vec<String>,
    ) -> Result<()> {
        let mut pairs = Vec::new();

        for (pos, pair) in plan.supersessions.iter().enumerate() {
            if !valid.contains(pair.source_id.as_str()) {
                tracing::warn!("Dropping supersession {}: '{}' not retrieved", pos, pair.source_id);
                notes.push(format!(
                    "supersession {pos} source '{}' is outside the retrieval",
                    pair.source_id
                ));
                continue;
            }

            let target = SupersessionTarget::parse(&pair.superseded_by_id).and_then(|t| t.resolve(created));
            let target = match target {
                Ok(target) => target,
                Err(e) => {
                    notes.push(format!("supersession {pos}: {e}"));
                    continue;
                }
            };
            if target == pair.source_id {
                notes.push(format!("supersession {pos}: '{target}' cannot supersede itself"));
                continue;
            }

            pairs.push(SupersededPair {
                source_id: pair.source_id.clone(),
                superseded_by_id: target,
            });
        }

        if !pairs.is_empty() {
            self.storage.mark_memories_superseded(index, &pairs).await?;
            report.superseded_pairs = pairs;
        }
        Ok(())
    }

    async fn bump_sleep_cycles(
        &self,
        plan: &ReconsolidationPlan,
        index: &str,
        valid: &HashSet<&str>,
        report: &mut ConsolidationReport,
        notes: &mut Vec<String>,
    ) -> Result<()> {
        let rejected = outside(&plan.sleep_cycle_targets, valid);
        if !rejected.is_empty() {
            tracing::warn!("Dropping sleep-cycle targets {:?}", rejected);
            notes.push(format!(
                "sleepCycleTargets outside the retrieval: {}",
                rejected.join(", ")
            ));
        }

        let mut targets: Vec<MemoryId> = Vec::new();
        let accepted = plan
            .sleep_cycle_targets
            .iter()
            .filter(|id| valid.contains(id.as_str()))
            .chain(report.created_memory_ids.iter());
        for id in accepted {
            if !targets.contains(id) {
                targets.push(id.clone());
            }
        }

        if !targets.is_empty() {
            self.storage.increment_sleep_cycles(index, &targets).await?;
            report.sleep_cycle_incremented_ids = targets;
        }
        Ok(())
    }
}

fn outside<'a>(ids: &'a [MemoryId], valid: &HashSet<&str>) -> Vec<&'a str> {
    ids.iter()
        .map(String::as_str)
        .filter(|id| !valid.contains(id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::types::{MemoryKind, MemoryRecord, MemoryType};
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    const INDEX: &str = "recall";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    async fn seeded() -> Arc<SqliteStore> {
        let store = SqliteStore::connect_in_memory().await.unwrap();
        let at = now() - Duration::days(3);
        let records: Vec<MemoryRecord> = ["x", "y", "z", "w"]
            .iter()
            .map(|id| MemoryRecord::new_at(format!("memory {id}"), MemoryType::Episodic, at).with_id(*id))
            .collect();
        store.upsert_memories(INDEX, &records, None).await.unwrap();
        store
    }

    fn executor(store: Arc<SqliteStore>) -> ReconsolidationExecutor {
        ReconsolidationExecutor::new(store, TemporalValidator::default(), ReconsolidationConfig::default())
    }

    fn valid(ids: &[&str]) -> Vec<MemoryId> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    fn plan(value: Value) -> ReconsolidationPlan {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn parses_and_resolves_targets() {
        let created = vec![Some("d0".to_string()), None];

        let by_index = SupersessionTarget::parse(&json!(0)).unwrap();
        assert_eq!(by_index, SupersessionTarget::ByIndex(0));
        assert_eq!(by_index.resolve(&created).unwrap(), "d0");

        let by_id = SupersessionTarget::parse(&json!("m7")).unwrap();
        assert_eq!(by_id.resolve(&created).unwrap(), "m7");

        assert_eq!(
            SupersessionTarget::parse(&json!(1)).unwrap().resolve(&created),
            Err(SupersessionError::NotCreated(1))
        );
        assert_eq!(
            SupersessionTarget::parse(&json!(5)).unwrap().resolve(&created),
            Err(SupersessionError::OutOfRange { index: 5, len: 2 })
        );
        assert!(SupersessionTarget::parse(&json!(-1)).is_err());
        assert!(SupersessionTarget::parse(&json!(1.5)).is_err());
        assert!(SupersessionTarget::parse(&json!(null)).is_err());
        assert!(SupersessionTarget::parse(&json!("  ")).is_err());
    }

    #[tokio::test]
    async fn derived_memory_citing_unretrieved_id_is_dropped() {
        let store = seeded().await;
        let exec = executor(store.clone());

        let report = exec
            .execute_at(
                &plan(json!({
                    "derivedMemories": [{ "text": "x and z together", "derivedFromIds": ["x", "z"] }]
                })),
                INDEX,
                &valid(&["x", "y"]),
                now(),
            )
            .await;

        assert!(report.created_memory_ids.is_empty());
        assert!(report.sleep_cycle_incremented_ids.is_empty());
        let notes = report.notes.unwrap();
        assert!(notes.contains('z'));
        assert!(notes.contains("outside the retrieval"));
        assert_eq!(store.list_memories(INDEX, None).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn applies_gated_plan() {
        let store = seeded().await;
        let exec = executor(store.clone());

        let report = exec
            .execute_at(
                &plan(json!({
                    "derivedMemories": [
                        { "text": "x then y", "derivedFromIds": ["x", "y"], "memoryType": "pattern" },
                        { "text": "leaks w", "derivedFromIds": ["w"] }
                    ],
                    "supersessions": [
                        { "sourceId": "x", "supersededById": 0 },
                        { "sourceId": "y", "supersededById": 1 },
                        { "sourceId": "y", "supersededById": 9 },
                        { "sourceId": "y", "supersededById": "y" },
                        { "sourceId": "w", "supersededById": 0 }
                    ],
                    "sleepCycleTargets": ["y", "q"]
                })),
                INDEX,
                &valid(&["x", "y"]),
                now(),
            )
            .await;

        assert_eq!(report.created_memory_ids.len(), 1);
        let derived_id = report.created_memory_ids[0].clone();
        assert_eq!(
            report.superseded_pairs,
            vec![SupersededPair {
                source_id: "x".into(),
                superseded_by_id: derived_id.clone()
            }]
        );
        assert_eq!(report.sleep_cycle_incremented_ids, vec!["y".to_string(), derived_id.clone()]);

        let notes = report.notes.unwrap();
        assert!(notes.contains("derived memory 1 cites ids outside the retrieval: w"));
        assert!(notes.contains("derived memory 1 was not created"));
        assert!(notes.contains("out of range"));
        assert!(notes.contains("cannot supersede itself"));
        assert!(notes.contains("source 'w' is outside the retrieval"));
        assert!(notes.contains("sleepCycleTargets outside the retrieval: q"));

        let derived = store.get_memory(INDEX, &derived_id).await.unwrap().unwrap();
        assert_eq!(derived.metadata.kind, MemoryKind::Derived);
        assert_eq!(derived.metadata.memory_type, MemoryType::Pattern);
        assert_eq!(derived.metadata.derived_from_ids, vec!["x", "y"]);
        assert_eq!(derived.metadata.dynamics.sleep_cycles, 1);

        let x = store.get_memory(INDEX, "x").await.unwrap().unwrap();
        assert_eq!(x.metadata.superseded_by_id, Some(derived_id));
        let y = store.get_memory(INDEX, "y").await.unwrap().unwrap();
        assert_eq!(y.metadata.dynamics.sleep_cycles, 1);
        let w = store.get_memory(INDEX, "w").await.unwrap().unwrap();
        assert!(w.metadata.superseded_by_id.is_none());
    }

    #[tokio::test]
    async fn storage_failure_is_reported_not_raised() {
        let store = seeded().await;
        let exec = executor(store.clone());
        store.pool().close().await;

        let report = exec
            .execute_at(
                &plan(json!({ "sleepCycleTargets": ["x"] })),
                INDEX,
                &valid(&["x"]),
                now(),
            )
            .await;

        assert!(report.sleep_cycle_incremented_ids.is_empty());
        assert!(report.notes.unwrap().contains("stopped early"));
    }
}
