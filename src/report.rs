use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;
use std::path::Path;

use chrono::Local;
use serde::Serialize;

use crate::aggregate::{
    aggregate_by_skill, aggregate_by_student, lowest_skills, participation, performance_bands,
    StudentBreakdown,
};
use crate::models::{percentage, ResultRow, ScopeSnapshot, StudentKey};
use crate::remediation::format_percent;
use crate::scope::{semester_rows, Overview, ScopePair, ScopeRows};
use crate::tier::{dominant_tier, student_tiers, Tier, TierPolicy};
use crate::trend::{format_population_delta, format_score_delta, TierBadge};

fn students_label(count: u64) -> &'static str {
    if count == 1 {
        "aluno"
    } else {
        "alunos"
    }
}

fn badge(badge: Option<TierBadge>) -> String {
    badge.map(|b| format!(" ({b})")).unwrap_or_default()
}

fn write_card(output: &mut String, title: &str, snap: &ScopeSnapshot, pair: Option<&ScopePair>) {
    let c = &snap.counts;
    let _ = writeln!(output, "### {title}");
    let _ = write!(
        output,
        "Proficiência {:.1}% \u{2013} {}",
        snap.score,
        dominant_tier(c).label()
    );
    if let Some(pair) = pair {
        let trend = &pair.trend;
        if trend.shows_score() {
            let _ = write!(output, " ({})", format_score_delta(trend.score_delta));
            if trend.shows_population() {
                let _ = write!(output, " ({})", format_population_delta(trend.population_delta));
            }
        }
    }
    let _ = writeln!(output);

    let (d, i, a) = match pair {
        Some(pair) => (
            badge(pair.trend.deficient),
            badge(pair.trend.intermediate),
            badge(pair.trend.adequate),
        ),
        None => Default::default(),
    };
    let _ = writeln!(output, "- Defasagem: {} {}{d}", c.deficient, students_label(c.deficient));
    let _ = writeln!(
        output,
        "- Intermediário: {} {}{i}",
        c.intermediate,
        students_label(c.intermediate)
    );
    let _ = writeln!(output, "- Adequado: {} {}{a}", c.adequate, students_label(c.adequate));
    let _ = writeln!(output);
}

pub fn build_overview_report(overview: &Overview, rows: &ScopeRows) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Visão Geral \u{2013} Proficiência dos Alunos");
    let _ = writeln!(
        output,
        "Filtros: {} (gerado em {})",
        overview.filters.describe(),
        Local::now().format("%d/%m/%Y %H:%M")
    );
    let _ = writeln!(output);

    for pair in overview.pairs() {
        let label = pair.scope.label();
        let _ = writeln!(output, "## {label}");
        write_card(&mut output, &format!("{label} - 1ª Avaliação"), &pair.first, None);
        write_card(&mut output, &format!("{label} - 2ª Avaliação"), &pair.second, Some(pair));
    }

    let insights = participation(&rows.unit);
    let _ = writeln!(output, "## Participação");
    let _ = writeln!(
        output,
        "- {} alunos, {} avaliados ({:.1}% de participação)",
        insights.total_students, insights.evaluated_students, insights.participation_percent
    );
    for share in &insights.level_distribution {
        let _ = writeln!(
            output,
            "- {}: {} ({:.1}%)",
            share.label, share.count, share.percent
        );
    }
    let _ = writeln!(output);

    let _ = writeln!(output, "## Distribuição por Faixa de Desempenho");
    let bands = performance_bands(&rows.unit);
    if bands.iter().all(|b| b.count == 0) {
        let _ = writeln!(output, "Nenhum dado disponível.");
    } else {
        for share in bands {
            let _ = writeln!(
                output,
                "- {}: {} ({:.1}%)",
                share.band.label(),
                share.count,
                share.percent
            );
        }
    }
    let _ = writeln!(output);

    let _ = writeln!(output, "## Habilidades com Menor Performance");
    let lowest = lowest_skills(&rows.unit, 10);
    if lowest.is_empty() {
        let _ = writeln!(output, "Nenhum dado disponível.");
    } else {
        for skill in lowest {
            let _ = writeln!(
                output,
                "- {} - {}: {:.1}% ({})",
                skill.skill_code,
                skill.skill_id,
                skill.ratio_of_sums(),
                skill.description
            );
        }
    }

    output
}

pub fn build_skills_report(rows: &[ResultRow], limit: usize) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "Habilidades com menor performance:");
    let lowest = lowest_skills(rows, limit);
    if lowest.is_empty() {
        let _ = writeln!(output, "Nenhum dado disponível.");
        return output;
    }
    for skill in &lowest {
        let _ = writeln!(
            output,
            "- {} - {}: {:.1}% em {} respostas",
            skill.skill_code,
            skill.skill_id,
            skill.ratio_of_sums(),
            skill.rows
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "Análise por habilidade (média por aluno):");
    for skill in aggregate_by_skill(rows) {
        let _ = writeln!(
            output,
            "- {}: média {:.1} de {:.1} questões, {:.1}% de acerto médio",
            skill.skill_id,
            skill.mean_correct(),
            skill.mean_questions(),
            skill.mean_of_ratios()
        );
    }
    output
}

/// Student tiers computed separately for each semester present in `rows`.
fn tiers_by_semester(
    rows: &[ResultRow],
    policy: TierPolicy,
) -> BTreeMap<String, BTreeMap<StudentKey, Tier>> {
    let semesters: BTreeSet<&str> = rows.iter().map(|r| r.semester.as_str()).collect();
    semesters
        .into_iter()
        .map(|semester| {
            let tiers = student_tiers(&semester_rows(rows, semester), policy);
            (semester.to_string(), tiers)
        })
        .collect()
}

pub fn build_students_report(
    rows: &[ResultRow],
    breakdowns: &[StudentBreakdown],
    policy: TierPolicy,
) -> String {
    let tiers = tiers_by_semester(rows, policy);
    let mut output = String::new();

    let _ = writeln!(output, "Alunos ({})", breakdowns.len());
    for student in breakdowns {
        let tier = tiers
            .get(&student.semester)
            .and_then(|by_student| by_student.get(&student.key))
            .map(|t| t.label())
            .unwrap_or("sem avaliação");
        let _ = writeln!(
            output,
            "- {} ({}, turma {}, {}º semestre): {}",
            student.key.name, student.key.unit, student.key.class_group, student.semester, tier
        );
        for component in student.components.values() {
            let percent = percentage(component.correct, component.total)
                .map(|p| format!(" ({}%)", format_percent(p)))
                .unwrap_or_default();
            let _ = writeln!(
                output,
                "    {}: {} / {}{percent}",
                component.component, component.correct, component.total
            );
            for skill in &component.skills {
                let percent = skill
                    .ratio()
                    .map(|p| format!("{}%", format_percent(p)))
                    .unwrap_or_else(|| "-".to_string());
                let _ = writeln!(
                    output,
                    "      {} ({}) {}/{} {percent} {}",
                    skill.skill_id, skill.skill_code, skill.correct, skill.total, skill.description
                );
            }
        }
    }
    output
}

#[derive(Debug, Serialize)]
struct StudentRecord<'a> {
    nome_aluno: &'a str,
    unidade: &'a str,
    turma: &'a str,
    ano_escolar: &'a str,
    semestre: &'a str,
    acertos: u64,
    total: u64,
    percentual: f64,
    nivel: &'static str,
}

/// Writes one CSV line per student and semester with their totals and the tier
/// chosen by `policy`.
pub fn write_students_csv(
    path: &Path,
    rows: &[ResultRow],
    policy: TierPolicy,
) -> anyhow::Result<usize> {
    let mut writer = csv::Writer::from_path(path)?;
    let tiers = tiers_by_semester(rows, policy);
    let mut written = 0;

    for (semester, semester_tiers) in &tiers {
        let students = aggregate_by_student(&semester_rows(rows, semester));
        for (key, agg) in &students {
            let ratio = agg.ratio().unwrap_or(0.0);
            writer.serialize(StudentRecord {
                nome_aluno: &key.name,
                unidade: &key.unit,
                turma: &key.class_group,
                ano_escolar: &key.school_year,
                semestre: semester,
                acertos: agg.correct,
                total: agg.total,
                percentual: (ratio * 10.0).round() / 10.0,
                nivel: semester_tiers
                    .get(key)
                    .map(|t| t.label())
                    .unwrap_or("sem avaliação"),
            })?;
            written += 1;
        }
    }
    writer.flush()?;
    Ok(written)
}
