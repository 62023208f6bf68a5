use std::fmt;

use crate::models::ScopeSnapshot;
use crate::tier::Tier;

/// Minimum score change worth showing.
pub const SCORE_DELTA_THRESHOLD: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Better {
    Down,
    Up,
}

impl Better {
    pub fn for_tier(tier: Tier) -> Self {
        match tier {
            Tier::Deficient | Tier::Intermediate => Better::Down,
            Tier::Adequate => Better::Up,
        }
    }
}

/// Change in a tier count. The sign shown encodes improvement, not arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierBadge {
    pub improved: bool,
    pub amount: u64,
}

impl fmt::Display for TierBadge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.improved { '+' } else { '\u{2212}' };
        write!(f, "{sign}{}", self.amount)
    }
}

/// `None` when the count did not change.
pub fn tier_badge(current: u64, previous: u64, better: Better) -> Option<TierBadge> {
    if current == previous {
        return None;
    }
    let improved = match better {
        Better::Down => current < previous,
        Better::Up => current > previous,
    };
    Some(TierBadge {
        improved,
        amount: current.abs_diff(previous),
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnapshotTrend {
    pub deficient: Option<TierBadge>,
    pub intermediate: Option<TierBadge>,
    pub adequate: Option<TierBadge>,
    pub score_delta: f64,
    pub population_delta: i64,
}

impl SnapshotTrend {
    pub fn shows_score(&self) -> bool {
        self.score_delta.abs() >= SCORE_DELTA_THRESHOLD
    }

    /// Population change is only shown alongside a visible score change.
    pub fn shows_population(&self) -> bool {
        self.shows_score() && self.population_delta != 0
    }
}

/// Compares the later snapshot against the earlier one.
pub fn compare(current: &ScopeSnapshot, previous: &ScopeSnapshot) -> SnapshotTrend {
    let (cur, prev) = (&current.counts, &previous.counts);
    SnapshotTrend {
        deficient: tier_badge(cur.deficient, prev.deficient, Better::for_tier(Tier::Deficient)),
        intermediate: tier_badge(
            cur.intermediate,
            prev.intermediate,
            Better::for_tier(Tier::Intermediate),
        ),
        adequate: tier_badge(cur.adequate, prev.adequate, Better::for_tier(Tier::Adequate)),
        score_delta: current.score - previous.score,
        population_delta: cur.total() as i64 - prev.total() as i64,
    }
}

pub fn format_score_delta(delta: f64) -> String {
    if delta > 0.0 {
        format!("+{delta:.1}%")
    } else {
        format!("{delta:.1}%")
    }
}

pub fn format_population_delta(delta: i64) -> String {
    let noun = if delta.abs() == 1 { "aluno" } else { "alunos" };
    if delta > 0 {
        format!("+{delta} {noun}")
    } else {
        format!("{delta} {noun}")
    }
}
