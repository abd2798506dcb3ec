//! Budgeted execution of agent action plans
//!
//! Actions are decoded, validated and applied strictly in plan order. Invalid
//! actions are skipped with their errors; the batch continues past them. The
//! budget counts accepted actions, and once it is spent the rest of the plan
//! is dropped and the run ends as `budget_reached`.

use crate::actions::{CreateAction, DeleteAction, MergeAction, NewMemory, RefinementAction, UpdateAction};
use crate::error::{MemoryError, Result};
use crate::priority::PriorityModel;
use crate::report::{ActionOutcome, ActionStatus, RefineMemoriesResult, RefineStatus};
use crate::storage::MemoryStorage;
use crate::temporal::TemporalValidator;
use crate::types::{MemoryId, MemoryKind, MemoryRecord, MemoryType, RelationType, Relationship, SupersededPair};
use crate::validation::{ActionPlanValidator, ValidationContext};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// What happens to MERGE sources once the target absorbed them
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MergeDisposal {
    /// Keep the sources, marked as superseded by the target
    #[default]
    Supersede,
    Delete,
}

/// Refinement configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RefineConfig {
    /// Whether DELETE actions may run at all
    pub allow_delete: bool,
    /// Accepted actions per batch
    pub max_actions: usize,
    pub merge_disposal: MergeDisposal,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            allow_delete: false,
            max_actions: 20,
            merge_disposal: MergeDisposal::Supersede,
        }
    }
}

/// Builder for refinement config
pub struct RefineConfigBuilder {
    config: RefineConfig,
}

impl RefineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RefineConfig::default(),
        }
    }

    pub fn allow_delete(mut self, allow: bool) -> Self {
        self.config.allow_delete = allow;
        self
    }

    pub fn max_actions(mut self, max: usize) -> Self {
        self.config.max_actions = max;
        self
    }

    pub fn merge_disposal(mut self, disposal: MergeDisposal) -> Self {
        self.config.merge_disposal = disposal;
        self
    }

    pub fn build(self) -> RefineConfig {
        self.config
    }
}

impl Default for RefineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RefinementExecutor {
    storage: Arc<dyn MemoryStorage>,
    validator: TemporalValidator,
    config: RefineConfig,
}

impl RefinementExecutor {
    pub fn new(storage: Arc<dyn MemoryStorage>, validator: TemporalValidator, config: RefineConfig) -> Self {
        Self {
            storage,
            validator,
            config,
        }
    }

    pub fn config(&self) -> &RefineConfig {
        &self.config
    }

    /// Validate and (unless `dry_run`) apply a plan of raw actions
    pub async fn execute(&self, actions: &[Value], index: &str, dry_run: bool) -> RefineMemoriesResult {
        self.execute_at(actions, index, dry_run, Utc::now()).await
    }

    pub async fn execute_at(
        &self,
        actions: &[Value],
        index: &str,
        dry_run: bool,
        now: DateTime<Utc>,
    ) -> RefineMemoriesResult {
        let mut result = RefineMemoriesResult::new(index, dry_run);
        let mut outcomes = Vec::with_capacity(actions.len());
        let mut new_ids = Vec::new();
        let (mut accepted, mut applied) = (0usize, 0usize);

        for (pos, raw) in actions.iter().enumerate() {
            if accepted >= self.config.max_actions {
                result.status = RefineStatus::BudgetReached;
                let message = format!("action budget of {} reached", self.config.max_actions);
                outcomes.extend(drop_remaining(actions, pos, &message));
                tracing::warn!("Budget reached on '{}', dropping {} actions", index, actions.len() - pos);
                break;
            }

            let action = match RefinementAction::decode(raw) {
                Ok(action) => action,
                Err(e) => {
                    outcomes.push(ActionOutcome::skipped(
                        pos,
                        RefinementAction::peek_kind(raw),
                        vec![e.to_string()],
                    ));
                    continue;
                }
            };

            let ctx = ValidationContext {
                index,
                storage: self.storage.as_ref(),
                config: &self.config,
                now,
            };
            let verdict = ActionPlanValidator::validate(&action, &ctx).await;

            let mut outcome = ActionOutcome::skipped(pos, Some(action.kind()), verdict.errors);
            outcome.reason = action.reason().map(str::to_string);
            outcome.warnings = verdict.warnings;
            if !verdict.valid {
                outcomes.push(outcome);
                continue;
            }
            accepted += 1;

            if dry_run {
                outcome.status = ActionStatus::Planned;
                outcome.memory_ids = planned_ids(&action);
                outcomes.push(outcome);
                continue;
            }

            match self.apply(&action, index, now).await {
                Ok(ids) => {
                    tracing::debug!("Applied {} action {} on '{}'", action.kind(), pos, index);
                    applied += 1;
                    if matches!(action, RefinementAction::Create(_)) {
                        new_ids.extend(ids.iter().cloned());
                    }
                    outcome.status = ActionStatus::Applied;
                    outcome.memory_ids = ids;
                    outcomes.push(outcome);
                }
                Err(e) => {
                    tracing::warn!("{} action {} failed on '{}': {}", action.kind(), pos, index, e);
                    result.status = RefineStatus::Error;
                    result.error = Some(format!("action {pos} ({}) failed: {e}", action.kind()));
                    outcome.errors.push(e.to_string());
                    outcomes.push(outcome);
                    outcomes.extend(drop_remaining(actions, pos + 1, "not attempted after an earlier failure"));
                    break;
                }
            }
        }

        let skipped = outcomes
            .iter()
            .filter(|o| o.status == ActionStatus::Skipped)
            .count();
        result.summary = Some(if dry_run {
            format!("{accepted} of {} actions planned, {skipped} skipped", actions.len())
        } else {
            format!("{applied} of {} actions applied, {skipped} skipped", actions.len())
        });
        tracing::info!("Refinement of '{}': {}", index, result.summary.as_deref().unwrap_or_default());

        result.applied_actions_count = Some(applied);
        result.skipped_actions_count = Some(skipped);
        result.new_memory_ids = Some(new_ids);
        result.actions = Some(outcomes);
        result
    }

    async fn apply(&self, action: &RefinementAction, index: &str, now: DateTime<Utc>) -> Result<Vec<MemoryId>> {
        match action {
            RefinementAction::Update(update) => self.apply_update(update, index, now).await,
            RefinementAction::Delete(delete) => self.apply_delete(delete, index).await,
            RefinementAction::Merge(merge) => self.apply_merge(merge, index, now).await,
            RefinementAction::Create(create) => self.apply_create(create, index, now).await,
        }
    }

    async fn apply_update(&self, action: &UpdateAction, index: &str, now: DateTime<Utc>) -> Result<Vec<MemoryId>> {
        let mut record = self.require(index, &action.id).await?;

        if let Some(text) = &action.text_update {
            record.text = text.clone();
        }
        patch_and_rescore(&mut record, action.metadata_updates.as_ref(), now)?;

        self.storage
            .upsert_memories(index, std::slice::from_ref(&record), None)
            .await?;
        Ok(vec![record.id])
    }

    async fn apply_delete(&self, action: &DeleteAction, index: &str) -> Result<Vec<MemoryId>> {
        let deleted = self.storage.delete_memories(index, &action.delete_ids).await?;
        tracing::debug!("Deleted {} of {} requested records", deleted, action.delete_ids.len());
        Ok(action.delete_ids.clone())
    }

    async fn apply_merge(&self, action: &MergeAction, index: &str, now: DateTime<Utc>) -> Result<Vec<MemoryId>> {
        let mut target = self.require(index, &action.target_id).await?;
        let sources = self.storage.get_memories(index, &action.merge_source_ids).await?;
        if let Some(missing) = action
            .merge_source_ids
            .iter()
            .find(|id| !sources.iter().any(|s| &s.id == *id))
        {
            return Err(MemoryError::NotFound(missing.clone()));
        }

        if let Some(text) = &action.merged_text {
            target.text = text.clone();
        }

        let dynamics = &mut target.metadata.dynamics;
        for source in &sources {
            dynamics.access_count = dynamics
                .access_count
                .saturating_add(source.metadata.dynamics.access_count);
            dynamics.max_access_count = dynamics.max_access_count.max(source.metadata.dynamics.max_access_count);
        }
        for source in &sources {
            if !target.metadata.derived_from_ids.contains(&source.id) {
                target.metadata.derived_from_ids.push(source.id.clone());
            }
        }
        patch_and_rescore(&mut target, action.merged_metadata.as_ref(), now)?;

        self.storage
            .upsert_memories(index, std::slice::from_ref(&target), None)
            .await?;

        let source_ids: Vec<MemoryId> = sources.iter().map(|s| s.id.clone()).collect();
        match self.config.merge_disposal {
            MergeDisposal::Supersede => {
                let pairs: Vec<SupersededPair> = source_ids
                    .iter()
                    .map(|id| SupersededPair {
                        source_id: id.clone(),
                        superseded_by_id: target.id.clone(),
                    })
                    .collect();
                self.storage.mark_memories_superseded(index, &pairs).await?;
            }
            MergeDisposal::Delete => {
                self.storage.delete_memories(index, &source_ids).await?;
            }
        }

        let mut ids = vec![target.id];
        ids.extend(source_ids);
        Ok(ids)
    }

    async fn apply_create(&self, action: &CreateAction, index: &str, now: DateTime<Utc>) -> Result<Vec<MemoryId>> {
        let new_memory = action
            .new_memory
            .as_ref()
            .ok_or_else(|| MemoryError::Validation("CREATE requires newMemory".to_string()))?;

        let origin_ids = new_memory.derived_from_ids.clone().unwrap_or_default();
        let origins = self.storage.get_memories(index, &origin_ids).await?;
        let record = derived_record(&self.validator, new_memory, &origins, now)?;

        self.storage
            .upsert_memories(index, std::slice::from_ref(&record), None)
            .await?;
        Ok(vec![record.id])
    }

    async fn require(&self, index: &str, id: &str) -> Result<MemoryRecord> {
        self.storage
            .get_memory(index, id)
            .await?
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))
    }
}

/// Build a new record from a planner payload, linked to `origins` by
/// `derived_from` edges stamped with the temporal check result
pub(crate) fn derived_record(
    validator: &TemporalValidator,
    new_memory: &NewMemory,
    origins: &[MemoryRecord],
    now: DateTime<Utc>,
) -> Result<MemoryRecord> {
    let memory_type = new_memory
        .memory_type
        .as_deref()
        .and_then(MemoryType::parse)
        .unwrap_or_default();
    let mut record = MemoryRecord::new_at(new_memory.text.clone(), memory_type, now);
    if let Some(metadata) = &new_memory.metadata {
        record.apply_metadata_patch(metadata)?;
    }

    let mut edges = record.metadata.relationships.take().unwrap_or_default();
    for origin in origins {
        let check = validator.check_edge(&record, origin, RelationType::DerivedFrom);
        let mut edge = Relationship::new(origin.id.clone(), RelationType::DerivedFrom);
        edge.recorded_at = Some(now);
        edge.temporal_ok = Some(check.ok);
        edge.temporal_reason = check.reason;
        edges.push(edge);
    }

    if !origins.is_empty() {
        record.metadata.kind = MemoryKind::Derived;
    }
    record.metadata.derived_from_ids = origins.iter().map(|o| o.id.clone()).collect();
    record.metadata.relationships = Some(edges);

    let explicit_priority = new_memory
        .metadata
        .as_ref()
        .is_some_and(|m| m.contains_key("priority"));
    if !explicit_priority {
        PriorityModel::refresh(&mut record, now);
    }
    record.metadata.dynamics.initial_priority = record.metadata.dynamics.current_priority;
    Ok(record)
}

/// Merge a metadata patch, keep stored edges unless the patch rewrites them,
/// and recompute priority unless the patch pins it
fn patch_and_rescore(record: &mut MemoryRecord, patch: Option<&Map<String, Value>>, now: DateTime<Utc>) -> Result<()> {
    if let Some(patch) = patch {
        record.apply_metadata_patch(patch)?;
    }
    if !patch.is_some_and(|p| p.contains_key("relationships")) {
        record.metadata.relationships = None;
    }
    if !patch.is_some_and(|p| p.contains_key("priority")) {
        PriorityModel::refresh(record, now);
    }
    Ok(())
}

fn planned_ids(action: &RefinementAction) -> Vec<MemoryId> {
    match action {
        RefinementAction::Update(update) => vec![update.id.clone()],
        RefinementAction::Delete(delete) => delete.delete_ids.clone(),
        RefinementAction::Merge(merge) => std::iter::once(merge.target_id.clone())
            .chain(merge.merge_source_ids.iter().cloned())
            .collect(),
        RefinementAction::Create(_) => Vec::new(),
    }
}

fn drop_remaining(actions: &[Value], from: usize, message: &str) -> Vec<ActionOutcome> {
    actions
        .iter()
        .enumerate()
        .skip(from)
        .map(|(pos, raw)| ActionOutcome::skipped(pos, RefinementAction::peek_kind(raw), vec![message.to_string()]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::UpsertDefaults;
    use crate::store::SqliteStore;
    use crate::types::Importance;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    const INDEX: &str = "notes";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
    }

    async fn seeded() -> Arc<SqliteStore> {
        let store = SqliteStore::connect_in_memory().await.unwrap();
        let at = now() - Duration::days(10);
        let mut source1 = MemoryRecord::new_at("likes tea", MemoryType::Semantic, at).with_id("source1");
        source1.metadata.dynamics.access_count = 3;
        let mut source2 = MemoryRecord::new_at("drinks green tea", MemoryType::Semantic, at).with_id("source2");
        source2.metadata.dynamics.access_count = 4;
        let records = vec![
            MemoryRecord::new_at("tea preference", MemoryType::Semantic, at)
                .with_id("target")
                .with_relationship(Relationship::new("source1", RelationType::Supports)),
            source1,
            source2,
            MemoryRecord::new_at("other", MemoryType::Episodic, at).with_id("other"),
        ];
        store.upsert_memories(INDEX, &records, None).await.unwrap();
        store
    }

    fn executor(store: Arc<dyn MemoryStorage>, config: RefineConfig) -> RefinementExecutor {
        RefinementExecutor::new(store, TemporalValidator::default(), config)
    }

    #[tokio::test]
    async fn protected_delete_is_rejected_even_when_deletes_are_allowed() {
        let store = seeded().await;
        let exec = executor(store.clone(), RefineConfigBuilder::new().allow_delete(true).build());

        let result = exec
            .execute_at(&[json!({ "type": "DELETE", "deleteIds": ["sys_abc"] })], INDEX, false, now())
            .await;

        assert_eq!(result.status, RefineStatus::Ok);
        assert_eq!(result.applied_actions_count, Some(0));
        assert_eq!(result.skipped_actions_count, Some(1));
        let outcome = &result.actions.unwrap()[0];
        assert!(outcome.errors.iter().any(|e| e.contains("protected")));
    }

    #[tokio::test]
    async fn merge_rewrites_target_and_supersedes_sources() {
        let store = seeded().await;
        let exec = executor(store.clone(), RefineConfig::default());

        let plan = vec![json!({
            "type": "MERGE",
            "targetId": "target",
            "mergeSourceIds": ["source1", "source2"],
            "mergedText": "prefers green tea",
            "mergedMetadata": { "importance": "high", "topic": "drinks" },
            "reason": "duplicates"
        })];
        let result = exec.execute_at(&plan, INDEX, false, now()).await;
        assert_eq!(result.applied_actions_count, Some(1));

        let target = store.get_memory(INDEX, "target").await.unwrap().unwrap();
        assert_eq!(target.text, "prefers green tea");
        assert_eq!(target.metadata.importance, Some(Importance::High));
        assert_eq!(target.metadata.extra["topic"], "drinks");
        assert_eq!(target.metadata.derived_from_ids, vec!["source1", "source2"]);
        assert_eq!(target.metadata.dynamics.access_count, 7);
        // Existing edges survive a merge that does not touch them
        assert_eq!(target.relationships().len(), 1);

        let live: Vec<String> = store
            .list_memories(INDEX, None)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert!(!live.contains(&"source1".to_string()));
        assert!(!live.contains(&"source2".to_string()));
        let source = store.get_memory(INDEX, "source1").await.unwrap().unwrap();
        assert_eq!(source.metadata.superseded_by_id.as_deref(), Some("target"));
    }

    #[tokio::test]
    async fn merge_can_delete_sources() {
        let store = seeded().await;
        let exec = executor(
            store.clone(),
            RefineConfigBuilder::new()
                .merge_disposal(MergeDisposal::Delete)
                .build(),
        );

        let plan = vec![json!({ "type": "MERGE", "targetId": "target", "mergeSourceIds": ["source1", "source2"] })];
        exec.execute_at(&plan, INDEX, false, now()).await;

        assert!(store.get_memory(INDEX, "source1").await.unwrap().is_none());
        assert!(store.get_memory(INDEX, "source2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn budget_counts_accepted_actions() {
        let store = seeded().await;
        let exec = executor(store.clone(), RefineConfigBuilder::new().max_actions(2).build());

        let plan = vec![
            json!({ "type": "UPDATE", "id": "ghost", "textUpdate": "x" }),
            json!({ "type": "UPDATE", "id": "target", "textUpdate": "one" }),
            json!({ "type": "UPDATE", "id": "other", "textUpdate": "two" }),
            json!({ "type": "UPDATE", "id": "source1", "textUpdate": "three" }),
        ];
        let result = exec.execute_at(&plan, INDEX, false, now()).await;

        assert_eq!(result.status, RefineStatus::BudgetReached);
        assert_eq!(result.applied_actions_count, Some(2));
        assert_eq!(result.skipped_actions_count, Some(2));
        let source1 = store.get_memory(INDEX, "source1").await.unwrap().unwrap();
        assert_eq!(source1.text, "likes tea");
    }

    #[tokio::test]
    async fn dry_run_plans_without_mutating() {
        let store = seeded().await;
        let exec = executor(store.clone(), RefineConfig::default());

        let plan = vec![
            json!({ "type": "UPDATE", "id": "target", "textUpdate": "changed" }),
            json!({ "type": "CREATE", "newMemory": { "text": "new insight" } }),
        ];
        let result = exec.execute_at(&plan, INDEX, true, now()).await;

        assert!(result.dry_run);
        assert_eq!(result.applied_actions_count, Some(0));
        let actions = result.actions.unwrap();
        assert!(actions.iter().all(|a| a.status == ActionStatus::Planned));
        assert_eq!(store.get_memory(INDEX, "target").await.unwrap().unwrap().text, "tea preference");
        assert_eq!(store.list_memories(INDEX, None).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn undecodable_actions_are_skipped_and_batch_continues() {
        let store = seeded().await;
        let exec = executor(store.clone(), RefineConfig::default());

        let plan = vec![
            json!({ "type": "RENAME", "id": "target" }),
            json!({ "type": "UPDATE", "id": "target", "textUpdate": "renamed" }),
        ];
        let result = exec.execute_at(&plan, INDEX, false, now()).await;

        assert_eq!(result.applied_actions_count, Some(1));
        let actions = result.actions.unwrap();
        assert_eq!(actions[0].status, ActionStatus::Skipped);
        assert!(actions[0].errors[0].contains("unknown action type"));
    }

    #[tokio::test]
    async fn update_keeps_edges_and_honours_priority_override() {
        let store = seeded().await;
        let exec = executor(store.clone(), RefineConfig::default());

        let plan = vec![json!({
            "type": "UPDATE",
            "id": "target",
            "metadataUpdates": { "priority": 0.9 }
        })];
        exec.execute_at(&plan, INDEX, false, now()).await;

        let target = store.get_memory(INDEX, "target").await.unwrap().unwrap();
        assert_eq!(target.metadata.dynamics.current_priority, 0.9);
        assert_eq!(target.relationships().len(), 1);

        let plan = vec![json!({
            "type": "UPDATE",
            "id": "target",
            "metadataUpdates": { "relationships": [] }
        })];
        exec.execute_at(&plan, INDEX, false, now()).await;
        assert!(store.get_relationships(INDEX, "target").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn patches_cannot_rewrite_lifecycle_state() {
        let store = seeded().await;
        let exec = executor(store.clone(), RefineConfig::default());

        let plan = vec![
            json!({
                "type": "UPDATE",
                "id": "target",
                "metadataUpdates": { "protection": "system", "supersededById": "ghost" }
            }),
            json!({
                "type": "MERGE",
                "targetId": "other",
                "mergeSourceIds": ["source2"],
                "mergedMetadata": { "source": "system" }
            }),
        ];
        let result = exec.execute_at(&plan, INDEX, false, now()).await;

        assert_eq!(result.applied_actions_count, Some(0));
        assert_eq!(result.skipped_actions_count, Some(2));
        let actions = result.actions.unwrap();
        assert!(actions.iter().all(|a| a.status == ActionStatus::Skipped && !a.errors.is_empty()));

        let target = store.get_memory(INDEX, "target").await.unwrap().unwrap();
        assert!(!target.is_protected());
        assert!(target.metadata.superseded_by_id.is_none());
        let live: Vec<String> = store
            .list_memories(INDEX, None)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(live.len(), 4);
        assert!(live.contains(&"target".to_string()));
        assert!(!store.get_memory(INDEX, "other").await.unwrap().unwrap().is_protected());
    }

    #[tokio::test]
    async fn create_links_origins() {
        let store = seeded().await;
        let exec = executor(store.clone(), RefineConfig::default());

        let plan = vec![json!({
            "type": "CREATE",
            "newMemory": {
                "text": "enjoys tea rituals",
                "memoryType": "pattern",
                "derivedFromIds": ["source1", "source2"]
            }
        })];
        let result = exec.execute_at(&plan, INDEX, false, now()).await;

        let new_ids = result.new_memory_ids.unwrap();
        assert_eq!(new_ids.len(), 1);
        let created = store.get_memory(INDEX, &new_ids[0]).await.unwrap().unwrap();
        assert_eq!(created.metadata.kind, MemoryKind::Derived);
        assert_eq!(created.metadata.memory_type, MemoryType::Pattern);
        assert_eq!(created.relationships().len(), 2);
        assert!(created
            .relationships()
            .iter()
            .all(|e| e.rel_type == RelationType::DerivedFrom && e.temporal_ok == Some(true)));
    }

    /// Reads from SQLite, refuses every write
    struct ReadOnly {
        inner: Arc<SqliteStore>,
    }

    #[async_trait]
    impl MemoryStorage for ReadOnly {
        fn backend_name(&self) -> &'static str {
            "read-only"
        }

        async fn get_memory(&self, index: &str, id: &str) -> Result<Option<MemoryRecord>> {
            self.inner.get_memory(index, id).await
        }

        async fn get_memories(&self, index: &str, ids: &[MemoryId]) -> Result<Vec<MemoryRecord>> {
            self.inner.get_memories(index, ids).await
        }

        async fn list_memories(&self, index: &str, limit: Option<i64>) -> Result<Vec<MemoryRecord>> {
            self.inner.list_memories(index, limit).await
        }

        async fn upsert_memories(
            &self,
            _index: &str,
            _records: &[MemoryRecord],
            _defaults: Option<&UpsertDefaults>,
        ) -> Result<Vec<MemoryId>> {
            Err(MemoryError::Storage("database is read-only".into()))
        }

        async fn delete_memories(&self, _index: &str, _ids: &[MemoryId]) -> Result<u64> {
            Err(MemoryError::Storage("database is read-only".into()))
        }

        async fn mark_memories_superseded(&self, _index: &str, _pairs: &[SupersededPair]) -> Result<u64> {
            Err(MemoryError::Storage("database is read-only".into()))
        }

        async fn increment_sleep_cycles(&self, _index: &str, _ids: &[MemoryId]) -> Result<u64> {
            Err(MemoryError::Storage("database is read-only".into()))
        }

        async fn get_relationships(&self, index: &str, source_id: &str) -> Result<Vec<Relationship>> {
            self.inner.get_relationships(index, source_id).await
        }
    }

    #[tokio::test]
    async fn storage_error_stops_the_batch() {
        let inner = seeded().await;
        let exec = executor(Arc::new(ReadOnly { inner }), RefineConfig::default());

        let plan = vec![
            json!({ "type": "UPDATE", "id": "target", "textUpdate": "one" }),
            json!({ "type": "UPDATE", "id": "other", "textUpdate": "two" }),
        ];
        let result = exec.execute_at(&plan, INDEX, false, now()).await;

        assert_eq!(result.status, RefineStatus::Error);
        assert!(result.error.unwrap().contains("read-only"));
        assert_eq!(result.applied_actions_count, Some(0));
        assert_eq!(result.skipped_actions_count, Some(2));
    }
}
