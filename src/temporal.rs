//! Bitemporal consistency rules
//!
//! Narrative time (`validAt`, falling back to `createdAt`) must respect the
//! direction of causal and provenance edges:
//! - `leads_to`, `informs`, `evolves_into`: source no later than target
//! - `consolidates`: a summary is no earlier than what it consolidates
//! - `derived_from`: the origin strictly precedes the derived record
//!
//! The validator also finds `leads_to` cycles, checks that consolidation
//! sources fall inside their window, and escalates violations according
//! to a [`TemporalPolicy`].

use crate::types::{MemoryId, MemoryRecord, RelationType};
use crate::windowing::ConsolidationWindow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Escalation applied when a consolidation breaks ordering rules
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TemporalPolicy {
    /// Any violation fails the window
    Strict,
    /// Warn, keep offenders, clamp the summary date
    #[default]
    WarnClamp,
    /// Warn and drop offending sources and edges
    WarnExclude,
    /// No temporal checks
    Off,
}

impl TemporalPolicy {
    pub const ALL: &[TemporalPolicy] = &[
        TemporalPolicy::Strict,
        TemporalPolicy::WarnClamp,
        TemporalPolicy::WarnExclude,
        TemporalPolicy::Off,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TemporalPolicy::Strict => "strict",
            TemporalPolicy::WarnClamp => "warn-clamp",
            TemporalPolicy::WarnExclude => "warn-exclude",
            TemporalPolicy::Off => "off",
        }
    }
}

impl std::fmt::Display for TemporalPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TemporalPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| {
                format!("unknown temporal policy '{s}' (expected strict, warn-clamp, warn-exclude or off)")
            })
    }
}

/// Validator limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TemporalConfig {
    /// Graphs larger than this fail the cycle check closed
    pub max_graph_nodes: usize,
}

impl Default for TemporalConfig {
    fn default() -> Self {
        Self {
            max_graph_nodes: 10_000,
        }
    }
}

/// Outcome of a single edge check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeCheck {
    pub ok: bool,
    pub reason: Option<String>,
}

impl EdgeCheck {
    fn pass() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    fn fail(reason: String) -> Self {
        Self {
            ok: false,
            reason: Some(reason),
        }
    }
}

/// `leads_to` cycles found in a graph
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub ok: bool,
    /// Each cycle once, rotated to start at its smallest id
    pub cycles: Vec<Vec<MemoryId>>,
    /// The graph exceeded the node ceiling and was not traversed
    pub truncated: bool,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContainmentReport {
    pub ok: bool,
    pub offenders: Vec<MemoryId>,
}

/// Verdict on a window's sources and proposed summary date
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationValidation {
    pub ok: bool,
    pub messages: Vec<String>,
    /// Date the summary should carry; `None` when checks are off
    pub clamped_date: Option<DateTime<Utc>>,
    /// Sources dropped under warn-exclude
    pub excluded_ids: Vec<MemoryId>,
}

/// Verdict on summary edges
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipValidation {
    pub ok: bool,
    pub messages: Vec<String>,
    pub flagged_edges: usize,
    pub removed_edges: usize,
    pub cycles: Vec<Vec<MemoryId>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    Gray,
    Black,
}

/// Temporal rule checker
#[derive(Debug, Clone, Default)]
pub struct TemporalValidator {
    config: TemporalConfig,
}

impl TemporalValidator {
    pub fn new(config: TemporalConfig) -> Self {
        Self { config }
    }

    /// Check the narrative ordering of `source --rel--> target`
    pub fn check_edge(&self, source: &MemoryRecord, target: &MemoryRecord, rel: RelationType) -> EdgeCheck {
        let ordering = match rel {
            RelationType::LeadsTo | RelationType::Informs | RelationType::EvolvesInto => EdgeOrder::SourceFirst,
            RelationType::Consolidates => EdgeOrder::TargetFirst,
            RelationType::DerivedFrom => EdgeOrder::TargetStrictlyFirst,
            _ => return EdgeCheck::pass(),
        };

        let (Some(s), Some(t)) = (source.narrative_time(), target.narrative_time()) else {
            return EdgeCheck::fail(format!(
                "{rel} edge {} -> {} has no usable narrative time",
                source.id, target.id
            ));
        };

        let ok = match ordering {
            EdgeOrder::SourceFirst => s <= t,
            EdgeOrder::TargetFirst => t <= s,
            EdgeOrder::TargetStrictlyFirst => t < s,
        };

        if ok {
            EdgeCheck::pass()
        } else {
            EdgeCheck::fail(format!(
                "{rel} edge {} ({}) -> {} ({}) runs against narrative time",
                source.id,
                s.to_rfc3339(),
                target.id,
                t.to_rfc3339()
            ))
        }
    }

    /// Find every `leads_to` cycle among `memories`
    pub fn check_no_cycles_leads_to<'a>(
        &self,
        memories: impl IntoIterator<Item = &'a MemoryRecord>,
    ) -> CycleReport {
        let mut graph: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for memory in memories {
            graph.entry(memory.id.as_str()).or_default();
            for edge in memory.relationships() {
                if edge.rel_type == RelationType::LeadsTo {
                    graph
                        .entry(memory.id.as_str())
                        .or_default()
                        .push(edge.target_id.as_str());
                }
            }
        }
        let targets: Vec<&str> = graph.values().flatten().copied().collect();
        for target in targets {
            graph.entry(target).or_default();
        }
        for successors in graph.values_mut() {
            successors.sort_unstable();
            successors.dedup();
        }

        if graph.len() > self.config.max_graph_nodes {
            tracing::warn!(
                "leads_to graph has {} nodes, over the ceiling of {}; failing closed",
                graph.len(),
                self.config.max_graph_nodes
            );
            return CycleReport {
                ok: false,
                cycles: Vec::new(),
                truncated: true,
            };
        }

        let mut color: HashMap<&str, Color> = HashMap::with_capacity(graph.len());
        let mut seen: HashSet<Vec<&str>> = HashSet::new();
        let mut cycles = Vec::new();

        for &start in graph.keys() {
            if color.contains_key(start) {
                continue;
            }
            color.insert(start, Color::Gray);
            let mut stack: Vec<(&str, usize)> = vec![(start, 0)];

            while let Some(top) = stack.len().checked_sub(1) {
                let (node, next) = stack[top];
                let successors = graph.get(node).map(Vec::as_slice).unwrap_or(&[]);

                let Some(&succ) = successors.get(next) else {
                    color.insert(node, Color::Black);
                    stack.pop();
                    continue;
                };
                stack[top].1 += 1;

                match color.get(succ) {
                    None => {
                        color.insert(succ, Color::Gray);
                        stack.push((succ, 0));
                    }
                    Some(Color::Gray) => {
                        // Back edge: the cycle is the stack suffix from `succ`
                        let Some(pos) = stack.iter().position(|(n, _)| *n == succ) else {
                            continue;
                        };
                        let cycle = normalize_cycle(stack[pos..].iter().map(|(n, _)| *n).collect());
                        if seen.insert(cycle.clone()) {
                            cycles.push(cycle.into_iter().map(str::to_string).collect());
                        }
                    }
                    Some(Color::Black) => {}
                }
            }
        }

        CycleReport {
            ok: cycles.is_empty(),
            cycles,
            truncated: false,
        }
    }

    /// Sources whose narrative time falls outside `window` (or is missing)
    pub fn check_window_containment(
        &self,
        sources: &[MemoryRecord],
        window: &ConsolidationWindow,
    ) -> ContainmentReport {
        let offenders: Vec<MemoryId> = sources
            .iter()
            .filter(|m| !m.narrative_time().is_some_and(|t| window.contains(t)))
            .map(|m| m.id.clone())
            .collect();

        ContainmentReport {
            ok: offenders.is_empty(),
            offenders,
        }
    }

    /// Latest of `proposed` and the newest source
    pub fn compute_clamped_date(&self, sources: &[MemoryRecord], proposed: DateTime<Utc>) -> DateTime<Utc> {
        sources
            .iter()
            .filter_map(MemoryRecord::narrative_time)
            .fold(proposed, std::cmp::max)
    }

    /// Check a window's sources and proposed summary date under `policy`
    pub fn validate_consolidation(
        &self,
        sources: &[MemoryRecord],
        proposed: DateTime<Utc>,
        window: &ConsolidationWindow,
        policy: TemporalPolicy,
    ) -> ConsolidationValidation {
        let mut result = ConsolidationValidation {
            ok: true,
            ..ConsolidationValidation::default()
        };
        if policy == TemporalPolicy::Off {
            return result;
        }

        let containment = self.check_window_containment(sources, window);
        if !containment.ok {
            let listed = containment.offenders.join(", ");
            match policy {
                TemporalPolicy::Strict => {
                    result.ok = false;
                    result.messages.push(format!("sources outside window: {listed}"));
                }
                TemporalPolicy::WarnClamp => {
                    result.messages.push(format!("sources outside window kept: {listed}"));
                }
                TemporalPolicy::WarnExclude => {
                    result.messages.push(format!("sources outside window excluded: {listed}"));
                    result.excluded_ids = containment.offenders;
                }
                TemporalPolicy::Off => {}
            }
        }

        let kept: Vec<MemoryRecord> = sources
            .iter()
            .filter(|m| !result.excluded_ids.contains(&m.id))
            .cloned()
            .collect();
        if kept.is_empty() && !sources.is_empty() {
            result.ok = false;
            result.messages.push("every source was excluded".to_string());
        }

        let clamped = self.compute_clamped_date(&kept, proposed);
        // A summary never predates its newest source
        if clamped > proposed {
            result.messages.push(format!(
                "consolidation date clamped from {} to {}",
                proposed.to_rfc3339(),
                clamped.to_rfc3339()
            ));
        }
        result.clamped_date = Some(clamped);

        if !result.messages.is_empty() {
            tracing::warn!("Temporal check ({policy}): {}", result.messages.join("; "));
        }
        result
    }

    /// Stamp and police every edge carried by `summaries`
    pub fn validate_relationships(
        &self,
        summaries: &mut [MemoryRecord],
        sources: &[MemoryRecord],
        policy: TemporalPolicy,
    ) -> RelationshipValidation {
        let mut result = RelationshipValidation {
            ok: true,
            ..RelationshipValidation::default()
        };
        if policy == TemporalPolicy::Off {
            return result;
        }

        // Checks run against an immutable view before edges are rewritten
        let checks: Vec<Vec<EdgeCheck>> = {
            let lookup: HashMap<&str, &MemoryRecord> = sources
                .iter()
                .chain(summaries.iter())
                .map(|m| (m.id.as_str(), m))
                .collect();

            summaries
                .iter()
                .map(|summary| {
                    summary
                        .relationships()
                        .iter()
                        .map(|edge| match lookup.get(edge.target_id.as_str()) {
                            Some(target) => self.check_edge(summary, target, edge.rel_type),
                            None => EdgeCheck::fail(format!(
                                "{} edge {} -> {} points at an unknown record",
                                edge.rel_type, summary.id, edge.target_id
                            )),
                        })
                        .collect()
                })
                .collect()
        };

        for (summary, checks) in summaries.iter_mut().zip(checks) {
            let Some(edges) = summary.metadata.relationships.as_mut() else {
                continue;
            };

            let mut kept = Vec::with_capacity(edges.len());
            for (mut edge, check) in edges.drain(..).zip(checks) {
                edge.temporal_ok = Some(check.ok);
                edge.temporal_reason = check.reason.clone();

                if !check.ok {
                    result.flagged_edges += 1;
                    if let Some(reason) = check.reason {
                        result.messages.push(reason);
                    }
                    match policy {
                        TemporalPolicy::Strict => result.ok = false,
                        TemporalPolicy::WarnExclude => {
                            result.removed_edges += 1;
                            continue;
                        }
                        TemporalPolicy::WarnClamp | TemporalPolicy::Off => {}
                    }
                }
                kept.push(edge);
            }
            *edges = kept;
        }

        let cycles = self.check_no_cycles_leads_to(sources.iter().chain(summaries.iter()));
        if !cycles.ok {
            if cycles.truncated {
                result.messages.push("relationship graph too large to check for cycles".to_string());
            }
            for cycle in &cycles.cycles {
                result.messages.push(format!("leads_to cycle: {}", cycle.join(" -> ")));
            }
            if policy == TemporalPolicy::Strict || cycles.truncated {
                result.ok = false;
            }
        }
        result.cycles = cycles.cycles;

        result
    }
}

enum EdgeOrder {
    SourceFirst,
    TargetFirst,
    TargetStrictlyFirst,
}

/// Rotate a cycle so it starts at its smallest id
fn normalize_cycle(mut cycle: Vec<&str>) -> Vec<&str> {
    if let Some(min_pos) = cycle
        .iter()
        .enumerate()
        .min_by_key(|(_, id)| **id)
        .map(|(i, _)| i)
    {
        cycle.rotate_left(min_pos);
    }
    cycle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MemoryType, Relationship};
    use chrono::{Duration, TimeZone};

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, d, 0, 0, 0).unwrap()
    }

    fn memory(id: &str, valid_at: DateTime<Utc>) -> MemoryRecord {
        MemoryRecord::new_at(id, MemoryType::Episodic, day(1))
            .with_id(id)
            .with_valid_at(valid_at)
    }

    fn leads_to(mut record: MemoryRecord, targets: &[&str]) -> MemoryRecord {
        for target in targets {
            record = record.with_relationship(Relationship::new(*target, RelationType::LeadsTo));
        }
        record
    }

    #[test]
    fn policy_parses_both_spellings() {
        assert_eq!("warn-clamp".parse::<TemporalPolicy>(), Ok(TemporalPolicy::WarnClamp));
        assert_eq!("WARN_EXCLUDE".parse::<TemporalPolicy>(), Ok(TemporalPolicy::WarnExclude));
        assert!("lenient".parse::<TemporalPolicy>().is_err());
        assert_eq!(serde_json::to_value(TemporalPolicy::WarnClamp).unwrap(), "warn-clamp");
    }

    #[test]
    fn leads_to_must_point_forward() {
        let validator = TemporalValidator::default();
        let early = memory("a", day(1));
        let late = memory("b", day(5));

        assert!(validator.check_edge(&early, &late, RelationType::LeadsTo).ok);
        let backwards = validator.check_edge(&late, &early, RelationType::LeadsTo);
        assert!(!backwards.ok);
        assert!(backwards.reason.unwrap().contains("leads_to"));

        // Unordered relation types always pass
        assert!(validator.check_edge(&late, &early, RelationType::SimilarTo).ok);
    }

    #[test]
    fn provenance_edges_point_backward() {
        let validator = TemporalValidator::default();
        let origin = memory("o", day(1));
        let summary = memory("s", day(5));

        assert!(validator.check_edge(&summary, &origin, RelationType::Consolidates).ok);
        assert!(!validator.check_edge(&origin, &summary, RelationType::Consolidates).ok);

        assert!(validator.check_edge(&summary, &origin, RelationType::DerivedFrom).ok);
        let same_instant = memory("twin", day(1));
        assert!(!validator.check_edge(&same_instant, &origin, RelationType::DerivedFrom).ok);
        assert!(validator.check_edge(&same_instant, &origin, RelationType::Consolidates).ok);
    }

    #[test]
    fn missing_time_fails_closed() {
        let validator = TemporalValidator::default();
        let mut undated = memory("u", day(1));
        undated.metadata.dynamics.valid_at = None;
        undated.metadata.dynamics.created_at = None;

        let check = validator.check_edge(&undated, &memory("b", day(2)), RelationType::Informs);
        assert!(!check.ok);
    }

    #[test]
    fn three_node_cycle_is_reported_once() {
        let graph = vec![
            leads_to(memory("b", day(2)), &["c"]),
            leads_to(memory("a", day(1)), &["b"]),
            leads_to(memory("c", day(3)), &["a"]),
        ];

        let report = TemporalValidator::default().check_no_cycles_leads_to(&graph);
        assert!(!report.ok);
        assert_eq!(report.cycles, vec![vec!["a", "b", "c"]]);
    }

    #[test]
    fn acyclic_graph_and_self_loop() {
        let validator = TemporalValidator::default();
        let chain = vec![
            leads_to(memory("a", day(1)), &["b", "c"]),
            leads_to(memory("b", day(2)), &["c"]),
            memory("c", day(3)),
        ];
        assert!(validator.check_no_cycles_leads_to(&chain).ok);

        let looped = vec![leads_to(memory("x", day(1)), &["x"])];
        assert_eq!(validator.check_no_cycles_leads_to(&looped).cycles, vec![vec!["x"]]);
    }

    #[test]
    fn deep_chain_does_not_recurse() {
        let chain: Vec<MemoryRecord> = (0..5_000)
            .map(|i| {
                let id = format!("n{i:05}");
                let next = format!("n{:05}", (i + 1) % 5_000);
                leads_to(memory(&id, day(1)), &[&next])
            })
            .collect();

        let report = TemporalValidator::default().check_no_cycles_leads_to(&chain);
        assert_eq!(report.cycles.len(), 1);
        assert_eq!(report.cycles[0].len(), 5_000);
        assert_eq!(report.cycles[0][0], "n00000");
    }

    #[test]
    fn node_ceiling_fails_closed() {
        let validator = TemporalValidator::new(TemporalConfig { max_graph_nodes: 2 });
        let graph = vec![leads_to(memory("a", day(1)), &["b", "c"])];
        let report = validator.check_no_cycles_leads_to(&graph);
        assert!(!report.ok);
        assert!(report.truncated);
    }

    #[test]
    fn clamped_date_is_never_before_newest_source() {
        let validator = TemporalValidator::default();
        let sources = vec![memory("a", day(1)), memory("b", day(9))];
        assert_eq!(validator.compute_clamped_date(&sources, day(3)), day(9));
        assert_eq!(validator.compute_clamped_date(&sources, day(20)), day(20));
    }

    #[test]
    fn policies_escalate_differently() {
        let validator = TemporalValidator::default();
        let window = ConsolidationWindow::new(day(1), day(10));
        let sources = vec![memory("in", day(2)), memory("out", day(15))];

        let strict = validator.validate_consolidation(&sources, day(5), &window, TemporalPolicy::Strict);
        assert!(!strict.ok);

        let clamp = validator.validate_consolidation(&sources, day(5), &window, TemporalPolicy::WarnClamp);
        assert!(clamp.ok);
        assert!(clamp.excluded_ids.is_empty());
        assert_eq!(clamp.clamped_date, Some(day(15)));

        let exclude = validator.validate_consolidation(&sources, day(5), &window, TemporalPolicy::WarnExclude);
        assert!(exclude.ok);
        assert_eq!(exclude.excluded_ids, vec!["out"]);
        assert_eq!(exclude.clamped_date, Some(day(5)));

        let off = validator.validate_consolidation(&sources, day(5), &window, TemporalPolicy::Off);
        assert!(off.ok);
        assert!(off.messages.is_empty());
        assert_eq!(off.clamped_date, None);
    }

    #[test]
    fn excluding_every_source_fails() {
        let validator = TemporalValidator::default();
        let window = ConsolidationWindow::new(day(1), day(3));
        let sources = vec![memory("late", day(20))];
        let result = validator.validate_consolidation(&sources, day(2), &window, TemporalPolicy::WarnExclude);
        assert!(!result.ok);
    }

    #[test]
    fn strict_clamps_early_proposed_date() {
        let validator = TemporalValidator::default();
        let window = ConsolidationWindow::new(day(1), day(10));
        let sources = vec![memory("a", day(2)), memory("b", day(8))];
        let result = validator.validate_consolidation(&sources, day(4), &window, TemporalPolicy::Strict);
        assert!(result.ok);
        assert!(result.messages[0].contains("clamped"));
        assert_eq!(result.clamped_date, Some(day(8)));
    }

    #[test]
    fn relationship_validation_stamps_and_excludes() {
        let validator = TemporalValidator::default();
        let sources = vec![memory("old", day(2)), memory("future", day(20))];
        let summary = memory("sum", day(10))
            .with_relationship(Relationship::new("old", RelationType::Consolidates))
            .with_relationship(Relationship::new("future", RelationType::Consolidates));

        let mut clamp = vec![summary.clone()];
        let result = validator.validate_relationships(&mut clamp, &sources, TemporalPolicy::WarnClamp);
        assert!(result.ok);
        assert_eq!(result.flagged_edges, 1);
        let edges = clamp[0].relationships();
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].temporal_ok, Some(true));
        assert_eq!(edges[1].temporal_ok, Some(false));
        assert!(edges[1].temporal_reason.is_some());

        let mut exclude = vec![summary.clone()];
        let result = validator.validate_relationships(&mut exclude, &sources, TemporalPolicy::WarnExclude);
        assert_eq!(result.removed_edges, 1);
        assert_eq!(exclude[0].relationships().len(), 1);

        let mut strict = vec![summary.clone()];
        assert!(!validator
            .validate_relationships(&mut strict, &sources, TemporalPolicy::Strict)
            .ok);

        let mut off = vec![summary];
        let result = validator.validate_relationships(&mut off, &sources, TemporalPolicy::Off);
        assert!(result.ok);
        assert!(off[0].relationships().iter().all(|e| e.temporal_ok.is_none()));
    }

    #[test]
    fn relationship_validation_reports_cycles() {
        let validator = TemporalValidator::default();
        let sources = vec![leads_to(memory("a", day(1)), &["b"])];
        let mut summaries = vec![leads_to(memory("b", day(1) + Duration::hours(1)), &["a"])];

        let result = validator.validate_relationships(&mut summaries, &sources, TemporalPolicy::WarnClamp);
        assert!(result.ok);
        assert_eq!(result.cycles.len(), 1);

        let result = validator.validate_relationships(&mut summaries, &sources, TemporalPolicy::Strict);
        assert!(!result.ok);
    }
}
