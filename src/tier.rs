use std::collections::BTreeMap;

use serde::Serialize;

use crate::aggregate::aggregate_by_student;
use crate::models::{ResultRow, ScopeSnapshot, StudentKey, TierCounts};

/// Institutional weights for the population proficiency score.
pub const WEIGHT_DEFICIENT: f64 = 2.0;
pub const WEIGHT_INTERMEDIATE: f64 = 50.0;
pub const WEIGHT_ADEQUATE: f64 = 95.0;

pub const INTERMEDIATE_FROM: f64 = 30.0;
pub const ADEQUATE_FROM: f64 = 71.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Tier {
    Deficient = 0,
    Intermediate = 1,
    Adequate = 2,
}

impl Tier {
    pub fn label(self) -> &'static str {
        match self {
            Tier::Deficient => "Defasagem",
            Tier::Intermediate => "Aprendizado Intermediário",
            Tier::Adequate => "Aprendizado Adequado",
        }
    }

    /// Parses a stored learning-level label. Unknown labels yield `None`.
    pub fn from_label(raw: &str) -> Option<Self> {
        match raw.trim() {
            "Defasagem" => Some(Tier::Deficient),
            "Aprendizado Intermediário" => Some(Tier::Intermediate),
            "Aprendizado Adequado" => Some(Tier::Adequate),
            _ => None,
        }
    }
}

/// Scheme A: fixed thresholds, closed on the lower bound.
pub fn classify(ratio: f64) -> Tier {
    if ratio < INTERMEDIATE_FROM {
        Tier::Deficient
    } else if ratio < ADEQUATE_FROM {
        Tier::Intermediate
    } else {
        Tier::Adequate
    }
}

/// How each student's tier is obtained before counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum TierPolicy {
    /// Classify the student's aggregate ratio with the fixed thresholds.
    #[default]
    Computed,
    /// Use the worst precomputed label found on the student's rows.
    Stored,
}

/// Tier of every student in the row set, one entry per student.
pub fn student_tiers(rows: &[ResultRow], policy: TierPolicy) -> BTreeMap<StudentKey, Tier> {
    match policy {
        TierPolicy::Computed => aggregate_by_student(rows)
            .into_iter()
            .filter_map(|(key, agg)| agg.ratio().map(|ratio| (key, classify(ratio))))
            .collect(),
        TierPolicy::Stored => {
            let mut worst: BTreeMap<StudentKey, Tier> = BTreeMap::new();
            for row in rows.iter().filter(|r| r.evaluated) {
                let Some(tier) = row.learning_level.as_deref().and_then(Tier::from_label) else {
                    continue;
                };
                let Some(key) = StudentKey::from_row(row) else {
                    continue;
                };
                worst
                    .entry(key)
                    .and_modify(|current| *current = (*current).min(tier))
                    .or_insert(tier);
            }
            worst
        }
    }
}

pub fn count_tiers<'a, I>(tiers: I) -> TierCounts
where
    I: IntoIterator<Item = &'a Tier>,
{
    let mut counts = TierCounts::default();
    for tier in tiers {
        match tier {
            Tier::Deficient => counts.deficient += 1,
            Tier::Intermediate => counts.intermediate += 1,
            Tier::Adequate => counts.adequate += 1,
        }
    }
    counts
}

/// Tier with the largest count; exact ties go to the lower tier.
pub fn dominant_tier(counts: &TierCounts) -> Tier {
    let max = counts
        .deficient
        .max(counts.intermediate)
        .max(counts.adequate);
    if max == counts.deficient {
        Tier::Deficient
    } else if max == counts.intermediate {
        Tier::Intermediate
    } else {
        Tier::Adequate
    }
}

pub fn weighted_score(counts: &TierCounts) -> f64 {
    let total = counts.total();
    if total == 0 {
        return 0.0;
    }
    (counts.deficient as f64 * WEIGHT_DEFICIENT
        + counts.intermediate as f64 * WEIGHT_INTERMEDIATE
        + counts.adequate as f64 * WEIGHT_ADEQUATE)
        / total as f64
}

pub fn snapshot(rows: &[ResultRow], policy: TierPolicy) -> ScopeSnapshot {
    let tiers = student_tiers(rows, policy);
    let counts = count_tiers(tiers.values());
    ScopeSnapshot {
        counts,
        score: weighted_score(&counts),
    }
}
