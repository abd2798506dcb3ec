//! Result shapes returned by refinement runs

use crate::actions::ActionKind;
use crate::temporal::TemporalPolicy;
use crate::types::{MemoryId, SupersededPair};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RefineStatus {
    #[default]
    Ok,
    Error,
    BudgetReached,
}

/// Outcome of a consolidation or action-plan run
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RefineMemoriesResult {
    pub status: RefineStatus,
    pub index: String,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<ActionOutcome>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_actions_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_actions_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_memory_ids: Option<Vec<MemoryId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub windows: Option<Vec<WindowReport>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RefineMemoriesResult {
    pub fn new(index: impl Into<String>, dry_run: bool) -> Self {
        Self {
            index: index.into(),
            dry_run,
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status != RefineStatus::Error
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Applied,
    /// Valid, but not applied (dry run)
    Planned,
    Skipped,
}

/// Per-action entry of a refinement result
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionOutcome {
    /// Position in the submitted plan
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ActionKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub status: ActionStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Records touched or created by this action
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub memory_ids: Vec<MemoryId>,
}

impl ActionOutcome {
    pub fn skipped(index: usize, kind: Option<ActionKind>, errors: Vec<String>) -> Self {
        Self {
            index,
            kind,
            reason: None,
            status: ActionStatus::Skipped,
            errors,
            warnings: Vec::new(),
            memory_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WindowStatus {
    Completed,
    Skipped,
    Failed,
    /// Summary built but not written (dry run)
    Planned,
}

/// Per-window entry of a consolidation result
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WindowReport {
    pub window_id: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focus: Option<String>,
    pub policy_applied: TemporalPolicy,
    pub source_count: usize,
    pub summary_count: usize,
    pub validator_warnings: Vec<String>,
    pub created_memory_ids: Vec<MemoryId>,
    pub created_edge_count: usize,
    pub status: WindowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Outcome of a reconsolidation plan
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationReport {
    pub created_memory_ids: Vec<MemoryId>,
    pub superseded_pairs: Vec<SupersededPair>,
    pub sleep_cycle_incremented_ids: Vec<MemoryId>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_serializes_camel_case_and_omits_absent_fields() {
        let mut result = RefineMemoriesResult::new("notes", true);
        result.status = RefineStatus::BudgetReached;
        result.applied_actions_count = Some(0);

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "budget_reached");
        assert_eq!(value["dryRun"], true);
        assert_eq!(value["appliedActionsCount"], 0);
        assert!(value.get("windows").is_none());
        assert!(value.get("error").is_none());
    }
}
