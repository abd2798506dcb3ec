//! Time-decaying salience ("priority") of a memory
//!
//! Priority is a weighted blend of four component scores, each in [0,1]:
//! - Recency: exponential decay of narrative age with a 30-day half-life
//! - Usage: logarithmic in access count, saturating at 100 accesses
//! - Importance: high / medium / low label
//! - Emotion: emotional intensity
//!
//! The weights depend on the memory type. Canonical self/belief statements
//! never decay below [`CANONICAL_FLOOR`].

use crate::types::{Importance, MemoryRecord, MemoryType, Stability};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Days for recency to halve
pub const HALF_LIFE_DAYS: f64 = 30.0;

/// Minimum priority of canonical self/belief records
pub const CANONICAL_FLOOR: f64 = 0.4;

/// Access count at which usage saturates
const USAGE_SATURATION: f64 = 100.0;

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Per-type weights for the priority blend
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriorityWeights {
    pub recency: f64,
    pub importance: f64,
    pub usage: f64,
    pub emotion: f64,
}

impl PriorityWeights {
    pub fn for_type(memory_type: MemoryType) -> Self {
        match memory_type {
            MemoryType::Identity | MemoryType::Belief => Self {
                recency: 0.10,
                importance: 0.40,
                usage: 0.30,
                emotion: 0.20,
            },
            MemoryType::Pattern => Self {
                recency: 0.25,
                importance: 0.30,
                usage: 0.30,
                emotion: 0.15,
            },
            MemoryType::Episodic => Self {
                recency: 0.40,
                importance: 0.20,
                usage: 0.20,
                emotion: 0.20,
            },
            MemoryType::Semantic => Self {
                recency: 0.10,
                importance: 0.50,
                usage: 0.20,
                emotion: 0.20,
            },
        }
    }
}

/// Component scores behind a priority value
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriorityBreakdown {
    pub recency: f64,
    pub usage: f64,
    pub importance: f64,
    pub emotion: f64,
    pub weights: PriorityWeights,
    /// Whether the canonical floor lifted the score
    pub floored: bool,
    pub score: f64,
}

/// Priority model - pure, deterministic salience scoring
pub struct PriorityModel;

impl PriorityModel {
    /// Current priority of `record` at `now`, in [0,1]
    pub fn priority(record: &MemoryRecord, now: DateTime<Utc>) -> f64 {
        Self::breakdown(record, now).score
    }

    /// Priority with its component scores
    pub fn breakdown(record: &MemoryRecord, now: DateTime<Utc>) -> PriorityBreakdown {
        let metadata = &record.metadata;
        let dynamics = &metadata.dynamics;

        let recency = Self::recency_score(dynamics.valid_at, dynamics.created_at, now);
        let usage = Self::usage_score(dynamics.access_count as f64);
        let importance = Self::importance_score(metadata.importance);
        let emotion = Self::emotion_score(metadata.emotional_intensity);
        let weights = PriorityWeights::for_type(metadata.memory_type);

        let mut score = recency * weights.recency
            + importance * weights.importance
            + usage * weights.usage
            + emotion * weights.emotion;

        let mut floored = false;
        if metadata.memory_type.is_self_or_belief()
            && dynamics.stability == Stability::Canonical
            && score < CANONICAL_FLOOR
        {
            score = CANONICAL_FLOOR;
            floored = true;
        }

        PriorityBreakdown {
            recency,
            usage,
            importance,
            emotion,
            weights,
            floored,
            score: clamp_unit(score),
        }
    }

    /// Recompute and store `currentPriority`; returns the new value
    pub fn refresh(record: &mut MemoryRecord, now: DateTime<Utc>) -> f64 {
        let score = Self::priority(record, now);
        record.metadata.dynamics.current_priority = score;
        score
    }

    /// `exp(-ln2 * ageDays / 30)`; 0 when neither timestamp is usable
    pub fn recency_score(
        valid_at: Option<DateTime<Utc>>,
        created_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> f64 {
        let Some(anchor) = valid_at.or(created_at) else {
            return 0.0;
        };

        // Future narrative times count as age zero
        let age_days = ((now - anchor).num_milliseconds() as f64 / MILLIS_PER_DAY).max(0.0);
        clamp_unit((-std::f64::consts::LN_2 * age_days / HALF_LIFE_DAYS).exp())
    }

    /// `ln(1 + n) / ln(101)`
    pub fn usage_score(access_count: f64) -> f64 {
        if !access_count.is_finite() || access_count < 0.0 {
            return 0.0;
        }
        clamp_unit(access_count.ln_1p() / USAGE_SATURATION.ln_1p())
    }

    pub fn importance_score(importance: Option<Importance>) -> f64 {
        match importance {
            Some(Importance::High) => 1.0,
            Some(Importance::Medium) => 0.6,
            Some(Importance::Low) | None => 0.3,
        }
    }

    pub fn emotion_score(intensity: Option<f64>) -> f64 {
        intensity.filter(|v| v.is_finite()).map_or(0.0, clamp_unit)
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
    }

    fn record(memory_type: MemoryType, age_days: i64) -> MemoryRecord {
        MemoryRecord::new_at("fact", memory_type, now() - Duration::days(400))
            .with_valid_at(now() - Duration::days(age_days))
    }

    #[test]
    fn recency_has_thirty_day_half_life() {
        let fresh = PriorityModel::recency_score(Some(now()), None, now());
        assert!((fresh - 1.0).abs() < 1e-9);

        let month_old = PriorityModel::recency_score(Some(now() - Duration::days(30)), None, now());
        assert!((month_old - 0.5).abs() < 1e-9);
    }

    #[test]
    fn recency_falls_back_to_creation_then_zero() {
        let created = now() - Duration::days(30);
        let score = PriorityModel::recency_score(None, Some(created), now());
        assert!((score - 0.5).abs() < 1e-9);

        assert_eq!(PriorityModel::recency_score(None, None, now()), 0.0);
    }

    #[test]
    fn future_narrative_time_counts_as_fresh() {
        let score = PriorityModel::recency_score(Some(now() + Duration::days(3)), None, now());
        assert_eq!(score, 1.0);
    }

    #[test]
    fn usage_ignores_garbage_counts() {
        assert_eq!(PriorityModel::usage_score(f64::NAN), 0.0);
        assert_eq!(PriorityModel::usage_score(f64::INFINITY), 0.0);
        assert_eq!(PriorityModel::usage_score(-3.0), 0.0);
        assert!((PriorityModel::usage_score(100.0) - 1.0).abs() < 1e-9);
        assert_eq!(PriorityModel::usage_score(10_000.0), 1.0);
    }

    #[test]
    fn importance_and_emotion_defaults() {
        assert_eq!(PriorityModel::importance_score(None), 0.3);
        assert_eq!(PriorityModel::importance_score(Some(Importance::Medium)), 0.6);
        assert_eq!(PriorityModel::emotion_score(None), 0.0);
        assert_eq!(PriorityModel::emotion_score(Some(4.0)), 1.0);
        assert_eq!(PriorityModel::emotion_score(Some(f64::NAN)), 0.0);
    }

    #[test]
    fn priority_stays_in_unit_interval() {
        for memory_type in MemoryType::ALL {
            for age in [0, 1, 30, 365, 10_000] {
                for importance in [None, Some(Importance::Low), Some(Importance::High)] {
                    let mut r = record(*memory_type, age);
                    r.metadata.importance = importance;
                    r.metadata.emotional_intensity = Some(1.0);
                    r.metadata.dynamics.access_count = 1_000;
                    let p = PriorityModel::priority(&r, now());
                    assert!((0.0..=1.0).contains(&p), "{memory_type} age {age}: {p}");
                }
            }
        }
    }

    #[test]
    fn canonical_self_and_belief_never_drop_below_floor() {
        for memory_type in [MemoryType::Identity, MemoryType::Belief] {
            let r = record(memory_type, 5_000)
                .with_importance(Importance::Low)
                .with_stability(Stability::Canonical);
            assert!(PriorityModel::priority(&r, now()) >= CANONICAL_FLOOR);
        }

        // Tentative beliefs decay freely
        let r = record(MemoryType::Belief, 5_000).with_importance(Importance::Low);
        assert!(PriorityModel::priority(&r, now()) < CANONICAL_FLOOR);
    }

    #[test]
    fn weights_follow_memory_type() {
        let fresh_episode = record(MemoryType::Episodic, 0);
        let breakdown = PriorityModel::breakdown(&fresh_episode, now());
        // 0.4 recency + 0.2 * 0.3 importance
        assert!((breakdown.score - 0.46).abs() < 1e-9);

        let fresh_fact = record(MemoryType::Semantic, 0);
        // 0.1 recency + 0.5 * 0.3 importance
        assert!((PriorityModel::priority(&fresh_fact, now()) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn priority_is_deterministic_and_refresh_stores_it() {
        let mut r = record(MemoryType::Pattern, 12).with_importance(Importance::High);
        let a = PriorityModel::priority(&r, now());
        let b = PriorityModel::priority(&r, now());
        assert_eq!(a, b);

        let stored = PriorityModel::refresh(&mut r, now());
        assert_eq!(stored, a);
        assert_eq!(r.metadata.dynamics.current_priority, a);
    }
}
