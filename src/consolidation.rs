//! Window-by-window consolidation of raw memories into summaries
//!
//! For each window the orchestrator gathers the sources inside its bounds,
//! runs the temporal checks under the requested policy, writes one summary
//! record carrying `consolidates` edges back to its sources, and finally
//! chains the summaries of adjacent completed windows with `leads_to`.

use crate::priority::PriorityModel;
use crate::report::{RefineMemoriesResult, RefineStatus, WindowReport, WindowStatus};
use crate::storage::MemoryStorage;
use crate::temporal::{TemporalPolicy, TemporalValidator};
use crate::types::{
    ConsolidationInfo, Importance, MemoryId, MemoryKind, MemoryRecord, MemoryType, Relationship,
    RelationType, Stability,
};
use crate::windowing::{ConsolidationWindow, WindowingStrategy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Bumped whenever the summary layout or hash inputs change
pub const SUMMARY_FORMAT_VERSION: u32 = 1;

/// Arguments of a consolidation run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsolidateArgs {
    /// Explicit windows; detected automatically when absent
    pub consolidation_windows: Option<Vec<ConsolidationWindow>>,
    pub temporal_policy: Option<TemporalPolicy>,
    pub dry_run: bool,
    /// Report windows whose summary already exists as skipped
    pub skip_existing: bool,
}

/// A summary written for one window, kept for cross-window linking
struct CompletedWindow {
    report_pos: usize,
    summary: MemoryRecord,
}

pub struct ConsolidationOrchestrator {
    storage: Arc<dyn MemoryStorage>,
    windowing: WindowingStrategy,
    validator: TemporalValidator,
    default_policy: TemporalPolicy,
}

impl ConsolidationOrchestrator {
    pub fn new(
        storage: Arc<dyn MemoryStorage>,
        windowing: WindowingStrategy,
        validator: TemporalValidator,
        default_policy: TemporalPolicy,
    ) -> Self {
        Self {
            storage,
            windowing,
            validator,
            default_policy,
        }
    }

    /// Consolidate `sources` into per-window summaries
    pub async fn execute(&self, args: &ConsolidateArgs, index: &str, sources: &[MemoryRecord]) -> RefineMemoriesResult {
        self.execute_at(args, index, sources, Utc::now()).await
    }

    pub async fn execute_at(
        &self,
        args: &ConsolidateArgs,
        index: &str,
        sources: &[MemoryRecord],
        now: DateTime<Utc>,
    ) -> RefineMemoriesResult {
        let policy = args.temporal_policy.unwrap_or(self.default_policy);
        let mut result = RefineMemoriesResult::new(index, args.dry_run);

        // Earlier summaries never feed new ones
        let raw: Vec<&MemoryRecord> = sources
            .iter()
            .filter(|m| m.metadata.kind != MemoryKind::Summary && !m.is_superseded())
            .collect();

        // Caller windows run in the order given; detected ones chronologically
        let windows = match &args.consolidation_windows {
            Some(windows) => windows.clone(),
            None => {
                let owned: Vec<MemoryRecord> = raw.iter().map(|m| (*m).clone()).collect();
                let mut detected = self.windowing.detect_windows(&owned).windows;
                detected.sort_by(|a, b| a.start_date.cmp(&b.start_date).then(a.end_date.cmp(&b.end_date)));
                detected
            }
        };

        let mut reports = Vec::with_capacity(windows.len());
        let mut completed = Vec::new();

        for (pos, window) in windows.iter().enumerate() {
            let members: Vec<MemoryRecord> = raw
                .iter()
                .filter(|m| m.narrative_time().is_some_and(|t| window.contains(t)))
                .map(|m| (*m).clone())
                .collect();

            let (report, summary) = self
                .consolidate_window(index, pos, window, members, policy, args, now)
                .await;
            tracing::debug!(
                "Window {} ({} sources): {:?}",
                report.window_id,
                report.source_count,
                report.status
            );

            if let Some(summary) = summary {
                completed.push(CompletedWindow {
                    report_pos: reports.len(),
                    summary,
                });
            }
            reports.push(report);
        }

        if !args.dry_run {
            self.link_adjacent(index, &mut completed, &mut reports, policy, now).await;
        }

        let count = |status: WindowStatus| reports.iter().filter(|r| r.status == status).count();
        let (done, planned, skipped, failed) = (
            count(WindowStatus::Completed),
            count(WindowStatus::Planned),
            count(WindowStatus::Skipped),
            count(WindowStatus::Failed),
        );

        let new_ids: Vec<MemoryId> = reports
            .iter()
            .flat_map(|r| r.created_memory_ids.iter().cloned())
            .collect();

        result.summary = Some(format!(
            "{} windows: {} consolidated, {} planned, {} skipped, {} failed",
            reports.len(),
            done,
            planned,
            skipped,
            failed
        ));
        if failed > 0 && done + planned == 0 {
            result.status = RefineStatus::Error;
            result.error = Some(format!("all {failed} attempted windows failed"));
        }

        tracing::info!(
            "Consolidation of '{}' ({}): {} summaries written, {} windows failed",
            index,
            policy,
            new_ids.len(),
            failed
        );

        result.new_memory_ids = Some(new_ids);
        result.windows = Some(reports);
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn consolidate_window(
        &self,
        index: &str,
        pos: usize,
        window: &ConsolidationWindow,
        members: Vec<MemoryRecord>,
        policy: TemporalPolicy,
        args: &ConsolidateArgs,
        now: DateTime<Utc>,
    ) -> (WindowReport, Option<MemoryRecord>) {
        let mut report = WindowReport {
            window_id: window.window_id(pos),
            start_date: window.start_date,
            end_date: window.end_date,
            focus: window.focus.clone(),
            policy_applied: policy,
            source_count: members.len(),
            summary_count: 0,
            validator_warnings: Vec::new(),
            created_memory_ids: Vec::new(),
            created_edge_count: 0,
            status: WindowStatus::Skipped,
            reason: None,
        };

        if members.is_empty() {
            report.reason = Some("no memories inside window".to_string());
            return (report, None);
        }

        let proposed = window.effective_consolidation_date();
        let verdict = self
            .validator
            .validate_consolidation(&members, proposed, window, policy);
        report.validator_warnings.extend(verdict.messages.iter().cloned());
        if !verdict.ok {
            report.status = WindowStatus::Failed;
            report.reason = Some(verdict.messages.join("; "));
            return (report, None);
        }

        let kept: Vec<MemoryRecord> = members
            .into_iter()
            .filter(|m| !verdict.excluded_ids.contains(&m.id))
            .collect();
        report.source_count = kept.len();

        let hash = consolidation_hash(&kept, window);
        let summary_id = summary_id_for(&hash);

        if args.skip_existing {
            match self.storage.get_memory(index, &summary_id).await {
                Ok(Some(_)) => {
                    report.reason = Some(format!("summary {summary_id} already exists"));
                    return (report, None);
                }
                Ok(None) => {}
                Err(e) => {
                    report.status = WindowStatus::Failed;
                    report.reason = Some(format!("existence check failed: {e}"));
                    return (report, None);
                }
            }
        }

        let valid_at = verdict.clamped_date.unwrap_or(proposed);
        let mut summaries = vec![build_summary(
            &summary_id,
            &kept,
            window,
            pos,
            hash,
            policy,
            valid_at,
            now,
        )];

        let edge_verdict = self
            .validator
            .validate_relationships(&mut summaries, &kept, policy);
        report.validator_warnings.extend(edge_verdict.messages.iter().cloned());
        if !edge_verdict.ok {
            report.status = WindowStatus::Failed;
            report.reason = Some(edge_verdict.messages.join("; "));
            return (report, None);
        }

        let Some(mut summary) = summaries.pop() else {
            return (report, None);
        };
        PriorityModel::refresh(&mut summary, now);
        report.summary_count = 1;

        if args.dry_run {
            report.status = WindowStatus::Planned;
            return (report, None);
        }

        match self
            .storage
            .upsert_memories(index, std::slice::from_ref(&summary), None)
            .await
        {
            Ok(_) => {
                report.status = WindowStatus::Completed;
                report.created_edge_count = summary.relationships().len();
                report.created_memory_ids.push(summary.id.clone());
                (report, Some(summary))
            }
            Err(e) => {
                tracing::warn!("Window {} failed to store its summary: {}", report.window_id, e);
                report.status = WindowStatus::Failed;
                report.summary_count = 0;
                report.reason = Some(format!("storage error: {e}"));
                (report, None)
            }
        }
    }

    /// Chain summaries of consecutive completed windows with `leads_to`
    async fn link_adjacent(
        &self,
        index: &str,
        completed: &mut [CompletedWindow],
        reports: &mut [WindowReport],
        policy: TemporalPolicy,
        now: DateTime<Utc>,
    ) {
        for i in 1..completed.len() {
            let (head, tail) = completed.split_at_mut(i);
            let (prev, next) = (&mut head[i - 1], &tail[0]);

            let mut edge = Relationship::new(next.summary.id.clone(), RelationType::LeadsTo).with_weight(1.0);
            edge.recorded_at = Some(now);

            if policy != TemporalPolicy::Off {
                let check = self
                    .validator
                    .check_edge(&prev.summary, &next.summary, RelationType::LeadsTo);
                if !check.ok && matches!(policy, TemporalPolicy::Strict | TemporalPolicy::WarnExclude) {
                    if let Some(reason) = check.reason {
                        reports[prev.report_pos].validator_warnings.push(reason);
                    }
                    continue;
                }
                edge.temporal_ok = Some(check.ok);
                edge.temporal_reason = check.reason;
            }

            let mut updated = prev.summary.clone();
            updated
                .metadata
                .relationships
                .get_or_insert_with(Vec::new)
                .push(edge);

            match self
                .storage
                .upsert_memories(index, std::slice::from_ref(&updated), None)
                .await
            {
                Ok(_) => {
                    prev.summary = updated;
                    reports[prev.report_pos].created_edge_count += 1;
                }
                Err(e) => {
                    tracing::warn!("Failed to link {} -> {}: {}", prev.summary.id, next.summary.id, e);
                    reports[prev.report_pos]
                        .validator_warnings
                        .push(format!("leads_to link to {} not stored: {e}", next.summary.id));
                }
            }
        }
    }
}

/// Stable hash over the summary's inputs, hex encoded
pub fn consolidation_hash(sources: &[MemoryRecord], window: &ConsolidationWindow) -> String {
    let mut ids: Vec<&str> = sources.iter().map(|m| m.id.as_str()).collect();
    ids.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(format!("v{SUMMARY_FORMAT_VERSION}|"));
    hasher.update(ids.join(","));
    hasher.update(format!(
        "|{}|{}|{}",
        window.start_date.to_rfc3339(),
        window.end_date.to_rfc3339(),
        window.focus.as_deref().unwrap_or("")
    ));
    hex::encode(hasher.finalize())
}

pub fn summary_id_for(hash: &str) -> MemoryId {
    format!("summary-{}", &hash[..hash.len().min(16)])
}

fn importance_rank(importance: Option<Importance>) -> u8 {
    match importance {
        Some(Importance::High) => 3,
        Some(Importance::Medium) => 2,
        Some(Importance::Low) => 1,
        None => 0,
    }
}

#[allow(clippy::too_many_arguments)]
fn build_summary(
    id: &str,
    sources: &[MemoryRecord],
    window: &ConsolidationWindow,
    pos: usize,
    hash: String,
    policy: TemporalPolicy,
    valid_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> MemoryRecord {
    let mut parts: Vec<&str> = Vec::new();
    for source in sources {
        let trimmed = source.text.trim();
        if !trimmed.is_empty() && !parts.contains(&trimmed) {
            parts.push(trimmed);
        }
    }

    let text = match &window.focus {
        Some(focus) => format!("Consolidated {} memories ({}): {}", sources.len(), focus, parts.join("; ")),
        None => format!("Consolidated {} memories: {}", sources.len(), parts.join("; ")),
    };

    let memory_type = match sources.first() {
        Some(first) if sources.iter().all(|m| m.metadata.memory_type == first.metadata.memory_type) => {
            first.metadata.memory_type
        }
        _ => MemoryType::Semantic,
    };

    let mut summary = MemoryRecord::new_at(text, memory_type, now)
        .with_id(id)
        .with_valid_at(valid_at)
        .with_stability(Stability::Stable);

    let metadata = &mut summary.metadata;
    metadata.kind = MemoryKind::Summary;
    metadata.importance = sources
        .iter()
        .map(|m| m.metadata.importance)
        .max_by_key(|i| importance_rank(*i))
        .flatten();
    metadata.dynamics.time_confidence = sources
        .iter()
        .map(|m| m.metadata.dynamics.time_confidence)
        .fold(1.0, f64::min);
    metadata.derived_from_ids = sources.iter().map(|m| m.id.clone()).collect();
    metadata.consolidation = Some(ConsolidationInfo {
        window_id: window.window_id(pos),
        window_start: window.start_date,
        window_end: window.end_date,
        focus: window.focus.clone(),
        source_count: sources.len(),
        hash,
        format_version: SUMMARY_FORMAT_VERSION,
        policy,
        consolidated_at: now,
    });
    metadata.relationships = Some(
        sources
            .iter()
            .map(|source| {
                let mut edge = Relationship::new(source.id.clone(), RelationType::Consolidates).with_weight(1.0);
                edge.valid_at = Some(valid_at);
                edge.recorded_at = Some(now);
                edge
            })
            .collect(),
    );

    summary
}
