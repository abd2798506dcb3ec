//! Validation of untrusted refinement actions
//!
//! Every action is checked against shape, existence and protection rules
//! before anything is written. Errors are collected (deduplicated) rather
//! than returned early, so a planner sees every problem with its action at
//! once. Storage failures during lookups never abort validation: they turn
//! into error entries on the action being validated.

use crate::actions::{CreateAction, DeleteAction, MergeAction, RefinementAction, UpdateAction};
use crate::error::MemoryError;
use crate::priority::PriorityModel;
use crate::refine::RefineConfig;
use crate::storage::MemoryStorage;
use crate::types::{is_reserved_id, MemoryRecord, MemoryType, SYSTEM_SOURCE};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// Metadata keys an agent may never set
pub const FORBIDDEN_METADATA_KEYS: &[&str] = &["id", "index"];

/// Lifecycle metadata owned by the engine; planners may not write it
pub const LIFECYCLE_METADATA_KEYS: &[&str] = &[
    "protection",
    "protectionClass",
    "supersededById",
    "kind",
    "consolidation",
];

/// What a validator needs to look at the store
pub struct ValidationContext<'a> {
    pub index: &'a str,
    pub storage: &'a dyn MemoryStorage,
    pub config: &'a RefineConfig,
    pub now: DateTime<Utc>,
}

/// Verdict on one action
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Default)]
struct Findings {
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl Findings {
    fn error(&mut self, message: impl Into<String>) {
        let message = message.into();
        if !self.errors.contains(&message) {
            self.errors.push(message);
        }
    }

    fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        if !self.warnings.contains(&message) {
            self.warnings.push(message);
        }
    }

    fn finish(self) -> ValidationOutcome {
        ValidationOutcome {
            valid: self.errors.is_empty(),
            errors: self.errors,
            warnings: self.warnings,
        }
    }
}

pub struct ActionPlanValidator;

impl ActionPlanValidator {
    /// Validate one action against the store
    pub async fn validate(action: &RefinementAction, ctx: &ValidationContext<'_>) -> ValidationOutcome {
        let mut findings = Findings::default();
        match action {
            RefinementAction::Update(update) => validate_update(update, ctx, &mut findings).await,
            RefinementAction::Delete(delete) => validate_delete(delete, ctx, &mut findings).await,
            RefinementAction::Merge(merge) => validate_merge(merge, ctx, &mut findings).await,
            RefinementAction::Create(create) => validate_create(create, ctx, &mut findings).await,
        }

        let outcome = findings.finish();
        if !outcome.valid {
            tracing::debug!(
                "{} action rejected: {}",
                action.kind(),
                outcome.errors.join("; ")
            );
        }
        outcome
    }
}

async fn validate_update(action: &UpdateAction, ctx: &ValidationContext<'_>, findings: &mut Findings) {
    let id = action.id.trim();
    if id.is_empty() {
        findings.error("UPDATE requires an id");
    }
    if action.text_update.is_none() && action.metadata_updates.is_none() {
        findings.error("UPDATE requires textUpdate or metadataUpdates");
    }
    if action.text_update.as_deref().is_some_and(|t| t.trim().is_empty()) {
        findings.error("textUpdate must not be blank");
    }
    if let Some(patch) = &action.metadata_updates {
        check_metadata_patch(patch, "metadataUpdates", findings);
    }
    if id.is_empty() {
        return;
    }
    if is_reserved_id(id) {
        findings.error(protected_message(id));
        return;
    }

    let Some(record) = lookup(ctx, id, findings).await else {
        return;
    };
    if record.is_protected() {
        findings.error(protected_message(id));
        return;
    }

    if let Some(patch) = &action.metadata_updates {
        let Some(patched) = trial_patch(&record, patch, findings) else {
            return;
        };
        if touches_timestamps(patch) {
            let before = PriorityModel::priority(&record, ctx.now);
            let after = PriorityModel::priority(&patched, ctx.now);
            findings.warn(format!(
                "changing narrative time moves priority of '{id}' from {before:.3} to {after:.3}"
            ));
        }
    }
}

async fn validate_merge(action: &MergeAction, ctx: &ValidationContext<'_>, findings: &mut Findings) {
    let target_id = action.target_id.trim();
    if target_id.is_empty() {
        findings.error("MERGE requires a targetId");
    }
    if action.merge_source_ids.is_empty() {
        findings.error("MERGE requires at least one mergeSourceIds entry");
    }

    let mut unique: Vec<&str> = Vec::new();
    for source in &action.merge_source_ids {
        if source.trim().is_empty() {
            findings.error("mergeSourceIds must not contain blank ids");
        } else if unique.contains(&source.as_str()) {
            findings.error(format!("mergeSourceIds contains '{source}' more than once"));
        } else {
            unique.push(source);
        }
        if source == target_id && !target_id.is_empty() {
            findings.error(format!("MERGE target '{target_id}' cannot be one of its own sources"));
        }
    }
    if let Some(patch) = &action.merged_metadata {
        check_metadata_patch(patch, "mergedMetadata", findings);
    }
    if action.merged_text.as_deref().is_some_and(|t| t.trim().is_empty()) {
        findings.error("mergedText must not be blank");
    }

    if !target_id.is_empty() {
        if is_reserved_id(target_id) {
            findings.error(protected_message(target_id));
        } else if let Some(target) = lookup(ctx, target_id, findings).await {
            if target.is_protected() {
                findings.error(protected_message(target_id));
            } else if let Some(patch) = &action.merged_metadata {
                trial_patch(&target, patch, findings);
            }
        }
    }

    for source in unique {
        if source == target_id {
            continue;
        }
        if is_reserved_id(source) {
            findings.error(protected_message(source));
        } else if let Some(record) = lookup(ctx, source, findings).await {
            if record.is_protected() {
                findings.error(protected_message(source));
            }
        }
    }
}

async fn validate_create(action: &CreateAction, ctx: &ValidationContext<'_>, findings: &mut Findings) {
    let Some(new_memory) = &action.new_memory else {
        findings.error("CREATE requires newMemory");
        return;
    };

    if new_memory.text.trim().is_empty() {
        findings.error("newMemory.text must not be blank");
    }
    if let Some(label) = &new_memory.memory_type {
        if MemoryType::parse(label).is_none() {
            findings.warn(format!("unknown memoryType '{label}', stored as semantic"));
        }
    }

    if let Some(metadata) = &new_memory.metadata {
        check_metadata_patch(metadata, "newMemory.metadata", findings);

        let blank = MemoryRecord::new_at(new_memory.text.clone(), MemoryType::Semantic, ctx.now);
        trial_patch(&blank, metadata, findings);
    }

    for origin in new_memory.derived_from_ids.iter().flatten() {
        if origin.trim().is_empty() {
            findings.error("derivedFromIds must not contain blank ids");
            continue;
        }
        lookup(ctx, origin, findings).await;
    }
}

async fn validate_delete(action: &DeleteAction, ctx: &ValidationContext<'_>, findings: &mut Findings) {
    if !ctx.config.allow_delete {
        findings.error("DELETE is disabled by configuration");
        return;
    }
    if action.delete_ids.is_empty() {
        findings.error("DELETE requires at least one deleteIds entry");
        return;
    }

    for id in &action.delete_ids {
        if id.trim().is_empty() {
            findings.error("deleteIds must not contain blank ids");
            continue;
        }
        if is_reserved_id(id) {
            findings.error(protected_message(id));
            continue;
        }
        if let Some(record) = lookup(ctx, id, findings).await {
            if record.is_protected() {
                findings.error(protected_message(id));
            }
        }
    }
}

fn protected_message(id: &str) -> String {
    format!("memory '{id}' is system-protected")
}

/// Fetch `id`, recording why it is unusable when it is
async fn lookup(ctx: &ValidationContext<'_>, id: &str, findings: &mut Findings) -> Option<MemoryRecord> {
    match ctx.storage.get_memory(ctx.index, id).await {
        Ok(Some(record)) => Some(record),
        Ok(None) => {
            findings.error(format!("memory '{id}' does not exist in index '{}'", ctx.index));
            None
        }
        Err(e) => {
            findings.error(lookup_failure(id, &e));
            None
        }
    }
}

fn lookup_failure(id: &str, err: &MemoryError) -> String {
    match (err, err.diagnostics()) {
        (MemoryError::Search { message, .. }, Some(diagnostics)) => {
            tracing::warn!("Lookup of '{}' failed: {} ({})", id, message, diagnostics);
            format!("lookup of '{id}' failed: {message} ({diagnostics})")
        }
        _ => {
            tracing::warn!("Lookup of '{}' failed: {}", id, err);
            format!("could not validate '{id}': unexpected storage error")
        }
    }
}

fn check_metadata_patch(patch: &Map<String, Value>, field: &str, findings: &mut Findings) {
    for key in FORBIDDEN_METADATA_KEYS.iter().chain(LIFECYCLE_METADATA_KEYS) {
        if patch.contains_key(*key) {
            findings.error(format!("{field} may not set '{key}'"));
        }
    }
    if patch.get("source").and_then(Value::as_str) == Some(SYSTEM_SOURCE) {
        findings.error(format!("{field} may not mark a record system-protected"));
    }

    if let Some(priority) = patch.get("priority") {
        let in_range = priority
            .as_f64()
            .is_some_and(|p| p.is_finite() && (0.0..=1.0).contains(&p));
        if !in_range {
            findings.error(format!("{field}.priority must be a number in [0,1], got {priority}"));
        }
    }
}

/// Apply `patch` to a copy of `record`, reporting schema breaks
fn trial_patch(record: &MemoryRecord, patch: &Map<String, Value>, findings: &mut Findings) -> Option<MemoryRecord> {
    // Forbidden keys and priority were already reported
    let mut patch = patch.clone();
    patch.remove("priority");
    for key in FORBIDDEN_METADATA_KEYS.iter().chain(LIFECYCLE_METADATA_KEYS) {
        patch.remove(*key);
    }

    let mut trial = record.clone();
    match trial.apply_metadata_patch(&patch) {
        Ok(()) => Some(trial),
        Err(e) => {
            findings.error(e.to_string());
            None
        }
    }
}

fn touches_timestamps(patch: &Map<String, Value>) -> bool {
    patch
        .get("dynamics")
        .and_then(Value::as_object)
        .is_some_and(|d| d.contains_key("validAt") || d.contains_key("createdAt"))
}
