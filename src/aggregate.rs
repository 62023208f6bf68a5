use std::collections::{BTreeMap, BTreeSet};

use crate::models::{percentage, ResultRow, SkillAggregate, StudentAggregate, StudentKey};

/// Sums evaluated rows per student. Students without any question are left out.
pub fn aggregate_by_student(rows: &[ResultRow]) -> BTreeMap<StudentKey, StudentAggregate> {
    let mut students: BTreeMap<StudentKey, StudentAggregate> = BTreeMap::new();

    for row in rows.iter().filter(|r| r.evaluated) {
        let Some(key) = StudentKey::from_row(row) else {
            continue;
        };
        let entry = students.entry(key).or_default();
        entry.correct += u64::from(row.correct_count);
        entry.total += u64::from(row.total_count);
    }

    students.retain(|_, agg| agg.total > 0);
    students
}

/// Per-skill totals over evaluated rows that name a skill, ordered by skill id.
pub fn aggregate_by_skill(rows: &[ResultRow]) -> Vec<SkillAggregate> {
    let mut skills: BTreeMap<String, SkillAggregate> = BTreeMap::new();

    for row in rows
        .iter()
        .filter(|r| r.evaluated && !r.skill_id.trim().is_empty())
    {
        let entry = skills
            .entry(row.skill_id.clone())
            .or_insert_with(|| SkillAggregate {
                skill_id: row.skill_id.clone(),
                skill_code: row.skill_code.clone(),
                description: row.skill_description.clone(),
                correct: 0,
                total: 0,
                rows: 0,
                ratio_sum: 0.0,
                ratio_rows: 0,
            });
        entry.correct += u64::from(row.correct_count);
        entry.total += u64::from(row.total_count);
        entry.rows += 1;
        if let Some(ratio) = row.ratio() {
            entry.ratio_sum += ratio;
            entry.ratio_rows += 1;
        }
    }

    skills.into_values().collect()
}

/// Weakest skills by summed accuracy.
pub fn lowest_skills(rows: &[ResultRow], limit: usize) -> Vec<SkillAggregate> {
    let mut skills = aggregate_by_skill(rows);
    skills.sort_by(|a, b| {
        a.ratio_of_sums()
            .partial_cmp(&b.ratio_of_sums())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.skill_id.cmp(&b.skill_id))
    });
    skills.truncate(limit);
    skills
}

#[derive(Debug, Clone, PartialEq)]
pub struct LevelShare {
    pub label: String,
    pub count: usize,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParticipationInsights {
    pub total_students: usize,
    pub evaluated_students: usize,
    pub participation_percent: f64,
    /// Stored learning-level labels, informational only.
    pub level_distribution: Vec<LevelShare>,
}

pub fn participation(rows: &[ResultRow]) -> ParticipationInsights {
    let all: BTreeSet<StudentKey> = rows.iter().filter_map(StudentKey::from_row).collect();
    let evaluated: BTreeSet<StudentKey> = rows
        .iter()
        .filter(|r| r.evaluated)
        .filter_map(StudentKey::from_row)
        .collect();

    let mut labels: BTreeMap<(StudentKey, String, String), String> = BTreeMap::new();
    for row in rows.iter().filter(|r| r.evaluated) {
        let (Some(key), Some(level)) = (StudentKey::from_row(row), row.learning_level.as_ref())
        else {
            continue;
        };
        if level.trim().is_empty() {
            continue;
        }
        labels.insert(
            (key, row.component.clone(), row.semester.clone()),
            level.trim().to_string(),
        );
    }

    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for label in labels.values() {
        *counts.entry(label.clone()).or_insert(0) += 1;
    }
    let labelled = labels.len();
    let level_distribution = counts
        .into_iter()
        .map(|(label, count)| LevelShare {
            label,
            count,
            percent: share(count, labelled),
        })
        .collect();

    ParticipationInsights {
        total_students: all.len(),
        evaluated_students: evaluated.len(),
        participation_percent: share(evaluated.len(), all.len()),
        level_distribution,
    }
}

fn share(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64 * 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformanceBand {
    Excellent,
    Good,
    Fair,
    Insufficient,
}

impl PerformanceBand {
    pub const ALL: [PerformanceBand; 4] = [
        PerformanceBand::Excellent,
        PerformanceBand::Good,
        PerformanceBand::Fair,
        PerformanceBand::Insufficient,
    ];

    pub fn for_ratio(ratio: f64) -> Self {
        if ratio >= 90.0 {
            PerformanceBand::Excellent
        } else if ratio >= 70.0 {
            PerformanceBand::Good
        } else if ratio >= 50.0 {
            PerformanceBand::Fair
        } else {
            PerformanceBand::Insufficient
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PerformanceBand::Excellent => "Excelente (90-100%)",
            PerformanceBand::Good => "Bom (70-89%)",
            PerformanceBand::Fair => "Regular (50-69%)",
            PerformanceBand::Insufficient => "Insuficiente (0-49%)",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BandShare {
    pub band: PerformanceBand,
    pub count: usize,
    pub percent: f64,
}

/// Distribution of student results per component and semester across bands.
pub fn performance_bands(rows: &[ResultRow]) -> Vec<BandShare> {
    let mut per_result: BTreeMap<(StudentKey, String, String), StudentAggregate> = BTreeMap::new();
    for row in rows.iter().filter(|r| r.evaluated) {
        let Some(key) = StudentKey::from_row(row) else {
            continue;
        };
        let entry = per_result
            .entry((key, row.component.clone(), row.semester.clone()))
            .or_default();
        entry.correct += u64::from(row.correct_count);
        entry.total += u64::from(row.total_count);
    }

    let bands: Vec<PerformanceBand> = per_result
        .values()
        .filter_map(StudentAggregate::ratio)
        .map(PerformanceBand::for_ratio)
        .collect();
    let total = bands.len();

    PerformanceBand::ALL
        .iter()
        .map(|band| {
            let count = bands.iter().filter(|b| *b == band).count();
            BandShare {
                band: *band,
                count,
                percent: share(count, total),
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkillResult {
    pub skill_id: String,
    pub skill_code: String,
    pub description: String,
    pub correct: u32,
    pub total: u32,
}

impl SkillResult {
    pub fn ratio(&self) -> Option<f64> {
        percentage(u64::from(self.correct), u64::from(self.total))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComponentBreakdown {
    pub component: String,
    pub correct: u64,
    pub total: u64,
    pub skills: Vec<SkillResult>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StudentBreakdown {
    pub key: StudentKey,
    pub semester: String,
    pub components: BTreeMap<String, ComponentBreakdown>,
}

pub fn component_name(code: &str) -> &str {
    match code {
        "LP" => "Língua Portuguesa",
        "MT" => "Matemática",
        other => other,
    }
}

/// Per-student listing, one entry per student and semester, sorted by name then
/// semester. Unevaluated rows still make the student and component appear,
/// without adding to the totals.
pub fn student_breakdowns(rows: &[ResultRow]) -> Vec<StudentBreakdown> {
    let mut students: BTreeMap<(StudentKey, String), StudentBreakdown> = BTreeMap::new();

    for row in rows {
        let Some(key) = StudentKey::from_row(row) else {
            continue;
        };
        let student = students
            .entry((key.clone(), row.semester.clone()))
            .or_insert_with(|| StudentBreakdown {
                key,
                semester: row.semester.clone(),
                components: BTreeMap::new(),
            });
        let component = student
            .components
            .entry(row.component.clone())
            .or_insert_with(|| ComponentBreakdown {
                component: component_name(&row.component).to_string(),
                correct: 0,
                total: 0,
                skills: Vec::new(),
            });
        if row.evaluated {
            component.correct += u64::from(row.correct_count);
            component.total += u64::from(row.total_count);
            component.skills.push(SkillResult {
                skill_id: row.skill_id.clone(),
                skill_code: row.skill_code.clone(),
                description: row.skill_description.clone(),
                correct: row.correct_count,
                total: row.total_count,
            });
        }
    }

    students.into_values().collect()
}
