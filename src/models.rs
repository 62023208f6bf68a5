use serde::{Deserialize, Serialize};

/// One student x skill x assessment row as stored in the results table.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub student_name: String,
    pub class_group: String,
    pub unit: String,
    pub region: String,
    pub school_year: String,
    pub component: String,
    pub semester: String,
    pub skill_id: String,
    pub skill_code: String,
    pub skill_description: String,
    pub evaluated: bool,
    pub correct_count: u32,
    pub total_count: u32,
    pub learning_level: Option<String>,
}

impl ResultRow {
    /// Percentage of correct answers, or `None` when the row carries no questions.
    pub fn ratio(&self) -> Option<f64> {
        percentage(u64::from(self.correct_count), u64::from(self.total_count))
    }
}

pub fn percentage(correct: u64, total: u64) -> Option<f64> {
    if total == 0 {
        None
    } else {
        Some(100.0 * correct as f64 / total as f64)
    }
}

/// Canonical student identity. Names alone collide across classes, so the
/// unit, class and cohort travel with them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StudentKey {
    pub name: String,
    pub unit: String,
    pub class_group: String,
    pub school_year: String,
}

impl StudentKey {
    pub fn from_row(row: &ResultRow) -> Option<Self> {
        let name = row.student_name.trim();
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            unit: row.unit.trim().to_string(),
            class_group: row.class_group.trim().to_string(),
            school_year: row.school_year.trim().to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StudentAggregate {
    pub correct: u64,
    pub total: u64,
}

impl StudentAggregate {
    pub fn ratio(&self) -> Option<f64> {
        percentage(self.correct, self.total)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkillAggregate {
    pub skill_id: String,
    pub skill_code: String,
    pub description: String,
    pub correct: u64,
    pub total: u64,
    pub rows: usize,
    /// Sum of per-row percentages over rows with questions.
    pub ratio_sum: f64,
    pub ratio_rows: usize,
}

impl SkillAggregate {
    /// Summed correct over summed questions, used for the lowest-skills ranking.
    pub fn ratio_of_sums(&self) -> f64 {
        percentage(self.correct, self.total).unwrap_or(0.0)
    }

    /// Simple mean of per-row percentages, used by the skills-analysis table.
    pub fn mean_of_ratios(&self) -> f64 {
        if self.ratio_rows == 0 {
            0.0
        } else {
            self.ratio_sum / self.ratio_rows as f64
        }
    }

    pub fn mean_correct(&self) -> f64 {
        if self.rows == 0 {
            0.0
        } else {
            self.correct as f64 / self.rows as f64
        }
    }

    pub fn mean_questions(&self) -> f64 {
        if self.rows == 0 {
            0.0
        } else {
            self.total as f64 / self.rows as f64
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierCounts {
    pub deficient: u64,
    pub intermediate: u64,
    pub adequate: u64,
}

impl TierCounts {
    pub fn total(&self) -> u64 {
        self.deficient + self.intermediate + self.adequate
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ScopeSnapshot {
    pub counts: TierCounts,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Unit,
    Regional,
    Network,
}

impl Scope {
    pub fn label(self) -> &'static str {
        match self {
            Scope::Unit => "Unidade",
            Scope::Regional => "Regional",
            Scope::Network => "Rede Toda",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeakSkill {
    pub component: String,
    pub skill_id: String,
    pub skill_code: String,
    pub skill_description: String,
    pub percentual: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationPlan {
    #[serde(rename = "analiseGeral")]
    pub general_analysis: String,
    #[serde(rename = "pontosMelhoria")]
    pub improvement_points: Vec<String>,
    #[serde(rename = "estrategias")]
    pub strategies: Vec<String>,
    #[serde(rename = "atividadesPorHabilidade")]
    pub skill_activities: Vec<SkillActivity>,
    #[serde(rename = "cronograma")]
    pub schedule: Vec<WeekPlan>,
    #[serde(rename = "modeloIntervencao")]
    pub intervention: InterventionModel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillActivity {
    #[serde(rename = "habilidade_id")]
    pub skill_id: String,
    #[serde(rename = "componente", default)]
    pub component: String,
    #[serde(rename = "descricao", default)]
    pub description: String,
    #[serde(rename = "sugestoes", default)]
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeekPlan {
    #[serde(rename = "semana")]
    pub week: u8,
    #[serde(rename = "foco", default)]
    pub focus: String,
    #[serde(rename = "objetivo", default)]
    pub objective: String,
    #[serde(rename = "tarefas", default)]
    pub tasks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionModel {
    #[serde(rename = "objetivo", default)]
    pub objective: String,
    #[serde(rename = "metasCurtoPrazo", default)]
    pub short_term_goals: Vec<String>,
    #[serde(rename = "rotina", default)]
    pub routine: Vec<String>,
    #[serde(rename = "acompanhamento", default)]
    pub tracking: Vec<String>,
    #[serde(rename = "responsabilidades", default)]
    pub responsibilities: Vec<String>,
}
