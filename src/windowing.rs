//! Consolidation windows by density clustering on narrative time
//!
//! Memories are placed on a 1-D time axis and clustered DBSCAN-style: two
//! memories are neighbours when their narrative timestamps are at most
//! `epsilon_days` apart, and a memory with at least `min_memories` neighbours
//! (itself included) is a core point that grows a cluster. Every cluster
//! becomes a [`ConsolidationWindow`]; noise points are left unassigned.

use crate::types::{MemoryId, MemoryRecord};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Natural alignment snaps to months up to this span, quarters beyond
const MONTH_ALIGNMENT_MAX_DAYS: i64 = 60;

const MONTH_NAMES: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

/// A time span whose member memories are merged into one summary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationWindow {
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consolidation_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_summary_count: Option<usize>,
}

impl ConsolidationWindow {
    pub fn new(start_date: DateTime<Utc>, end_date: DateTime<Utc>) -> Self {
        Self {
            start_date,
            end_date,
            consolidation_date: None,
            focus: None,
            expected_summary_count: None,
        }
    }

    pub fn with_focus(mut self, focus: impl Into<String>) -> Self {
        self.focus = Some(focus.into());
        self
    }

    pub fn with_consolidation_date(mut self, date: DateTime<Utc>) -> Self {
        self.consolidation_date = Some(date);
        self
    }

    /// Midpoint of the bounds, never past the end
    pub fn midpoint(&self) -> DateTime<Utc> {
        let mid = self.start_date + (self.end_date - self.start_date) / 2;
        mid.min(self.end_date)
    }

    /// Explicit consolidation date, or the midpoint
    pub fn effective_consolidation_date(&self) -> DateTime<Utc> {
        self.consolidation_date.unwrap_or_else(|| self.midpoint())
    }

    /// Inclusive bounds check
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start_date && timestamp <= self.end_date
    }

    /// Stable identifier used in reports
    pub fn window_id(&self, position: usize) -> String {
        format!(
            "w{position}:{}..{}",
            self.start_date.format("%Y-%m-%d"),
            self.end_date.format("%Y-%m-%d")
        )
    }
}

/// Snap detected bounds to calendar boundaries or keep them exact
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WindowAlignment {
    #[default]
    Exact,
    Natural,
}

/// Windowing configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WindowingConfig {
    /// Maximum gap between neighbours, in days
    pub epsilon_days: f64,
    /// Neighbours (self included) required for a core point
    pub min_memories: usize,
    pub alignment: WindowAlignment,
}

impl Default for WindowingConfig {
    fn default() -> Self {
        Self {
            epsilon_days: 14.0,
            min_memories: 2,
            alignment: WindowAlignment::Exact,
        }
    }
}

/// Builder for windowing config
pub struct WindowingConfigBuilder {
    config: WindowingConfig,
}

impl WindowingConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: WindowingConfig::default(),
        }
    }

    pub fn epsilon_days(mut self, days: f64) -> Self {
        self.config.epsilon_days = days;
        self
    }

    pub fn min_memories(mut self, count: usize) -> Self {
        self.config.min_memories = count;
        self
    }

    pub fn alignment(mut self, alignment: WindowAlignment) -> Self {
        self.config.alignment = alignment;
        self
    }

    pub fn build(self) -> WindowingConfig {
        self.config
    }
}

impl Default for WindowingConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters from one detection run
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WindowingStats {
    pub total_memories: usize,
    /// Memories without a usable narrative timestamp
    pub discarded: usize,
    pub clusters: usize,
    pub noise: usize,
}

/// Result of window detection
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WindowDetection {
    pub windows: Vec<ConsolidationWindow>,
    /// Noise memories, never summarized automatically
    pub unassigned: Vec<MemoryId>,
    /// Member ids per window, same order as `windows`
    pub members: Vec<Vec<MemoryId>>,
    pub stats: WindowingStats,
}

/// Density-based windowing over narrative time
#[derive(Debug, Clone, Default)]
pub struct WindowingStrategy {
    config: WindowingConfig,
}

impl WindowingStrategy {
    pub fn new(config: WindowingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WindowingConfig {
        &self.config
    }

    /// Cluster `memories` into consolidation windows
    pub fn detect_windows(&self, memories: &[MemoryRecord]) -> WindowDetection {
        let mut stats = WindowingStats {
            total_memories: memories.len(),
            ..WindowingStats::default()
        };

        // (timestamp, id), ordered so that traversal never depends on input order
        let mut points: Vec<(DateTime<Utc>, &str)> = memories
            .iter()
            .filter_map(|m| m.narrative_time().map(|t| (t, m.id.as_str())))
            .collect();
        stats.discarded = memories.len() - points.len();
        points.sort();

        let times: Vec<i64> = points.iter().map(|(t, _)| t.timestamp_millis()).collect();
        let labels = dbscan(&times, self.epsilon_millis(), self.config.min_memories.max(1));

        let cluster_count = labels.iter().flatten().max().map_or(0, |max| max + 1);
        let mut clusters: Vec<Vec<usize>> = vec![Vec::new(); cluster_count];
        let mut unassigned = Vec::new();
        for (i, label) in labels.iter().enumerate() {
            match label {
                Some(c) => clusters[*c].push(i),
                None => unassigned.push(points[i].1.to_string()),
            }
        }

        stats.clusters = clusters.len();
        stats.noise = unassigned.len();

        let mut windows = Vec::with_capacity(clusters.len());
        let mut members = Vec::with_capacity(clusters.len());
        for cluster in &clusters {
            // Indices are ascending, so first/last are the bounds
            let (Some(&first), Some(&last)) = (cluster.first(), cluster.last()) else {
                continue;
            };
            windows.push(self.build_window(points[first].0, points[last].0, cluster.len()));
            members.push(cluster.iter().map(|&i| points[i].1.to_string()).collect());
        }

        tracing::debug!(
            "Detected {} windows ({} unassigned, {} discarded) from {} memories",
            windows.len(),
            stats.noise,
            stats.discarded,
            stats.total_memories
        );

        WindowDetection {
            windows,
            unassigned,
            members,
            stats,
        }
    }

    fn epsilon_millis(&self) -> i64 {
        let days = if self.config.epsilon_days.is_finite() {
            self.config.epsilon_days.max(0.0)
        } else {
            0.0
        };
        (days * MILLIS_PER_DAY).round() as i64
    }

    fn build_window(&self, min: DateTime<Utc>, max: DateTime<Utc>, size: usize) -> ConsolidationWindow {
        let (start, end) = match self.config.alignment {
            WindowAlignment::Exact => (min, max),
            WindowAlignment::Natural => natural_bounds(min, max),
        };

        let mut window = ConsolidationWindow::new(start, end);
        window.consolidation_date = Some(window.midpoint());
        window.focus = Some(focus_label(start, end));
        window.expected_summary_count = Some(size.div_ceil(5));
        window
    }
}

/// Cluster label per point (`None` = noise). `times` must be sorted.
fn dbscan(times: &[i64], epsilon: i64, min_points: usize) -> Vec<Option<usize>> {
    let n = times.len();
    let mut labels: Vec<Option<usize>> = vec![None; n];
    let mut visited = vec![false; n];
    let mut next_cluster = 0;

    // Neighbourhood of a sorted point is a contiguous index range
    let region = |i: usize| -> std::ops::Range<usize> {
        let lo = times.partition_point(|&t| t < times[i].saturating_sub(epsilon));
        let hi = times.partition_point(|&t| t <= times[i].saturating_add(epsilon));
        lo..hi
    };

    for i in 0..n {
        if visited[i] {
            continue;
        }
        visited[i] = true;

        let neighbours = region(i);
        if neighbours.len() < min_points {
            continue;
        }

        let cluster = next_cluster;
        next_cluster += 1;
        labels[i] = Some(cluster);

        let mut queue: VecDeque<usize> = neighbours.collect();
        while let Some(j) = queue.pop_front() {
            if labels[j].is_none() {
                labels[j] = Some(cluster);
            }
            if visited[j] {
                continue;
            }
            visited[j] = true;

            let reach = region(j);
            if reach.len() >= min_points {
                queue.extend(reach);
            }
        }
    }

    labels
}

fn month_start(year: i32, month: u32) -> Option<DateTime<Utc>> {
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// First instant of the month `offset` months after (year, month)
fn shifted_month_start(year: i32, month: u32, offset: u32) -> Option<DateTime<Utc>> {
    let zero_based = month - 1 + offset;
    let year = year.checked_add((zero_based / 12) as i32)?;
    month_start(year, zero_based % 12 + 1)
}

fn quarter_first_month(month: u32) -> u32 {
    (month - 1) / 3 * 3 + 1
}

/// Last second before the month `offset` months after (year, month),
/// saturating at the end of representable time
fn period_end(year: i32, month: u32, offset: u32) -> DateTime<Utc> {
    shifted_month_start(year, month, offset)
        .and_then(|next| next.checked_sub_signed(Duration::seconds(1)))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn natural_bounds(min: DateTime<Utc>, max: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let (start_month, end_month, span) = if (max - min).num_days() <= MONTH_ALIGNMENT_MAX_DAYS {
        (min.month(), max.month(), 1)
    } else {
        (quarter_first_month(min.month()), quarter_first_month(max.month()), 3)
    };
    let start = month_start(min.year(), start_month).unwrap_or(DateTime::<Utc>::MIN_UTC);
    (start, period_end(max.year(), end_month, span))
}

fn month_name(month: u32) -> &'static str {
    MONTH_NAMES[(month as usize).saturating_sub(1) % 12]
}

fn quarter_label(ts: DateTime<Utc>) -> String {
    format!("Q{} {}", (ts.month() - 1) / 3 + 1, ts.year())
}

/// Human-readable label for a window span
fn focus_label(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    if (end - start).num_days() <= MONTH_ALIGNMENT_MAX_DAYS {
        let same_month = start.year() == end.year() && start.month() == end.month();
        if same_month {
            format!("{} {}", month_name(start.month()), start.year())
        } else if start.year() == end.year() {
            format!(
                "{}-{} {}",
                month_name(start.month()),
                month_name(end.month()),
                end.year()
            )
        } else {
            format!(
                "{} {}-{} {}",
                month_name(start.month()),
                start.year(),
                month_name(end.month()),
                end.year()
            )
        }
    } else {
        let (first, last) = (quarter_label(start), quarter_label(end));
        if first == last {
            first
        } else {
            format!("{first}-{last}")
        }
    }
}
