use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{PlanParseError, RemediationError};
use crate::export::{plan_document, DocumentExporter};
use crate::generator::TextGenerator;
use crate::models::{
    percentage, InterventionModel, RemediationPlan, ResultRow, SkillActivity, StudentKey,
    WeakSkill, WeekPlan,
};
use crate::store::{LinkCache, LinkSource};

pub const WEEKS: usize = 4;

const REQUIRED_KEYS: [&str; 6] = [
    "analiseGeral",
    "pontosMelhoria",
    "estrategias",
    "atividadesPorHabilidade",
    "cronograma",
    "modeloIntervencao",
];

/// Skills of one student with questions and less than full marks, grouped by
/// component and skill. Only the student's most recent semester counts, so a
/// skill recovered later is not reported as weak.
pub fn collect_weak_skills(rows: &[ResultRow], student: &StudentKey) -> Vec<WeakSkill> {
    let student_rows: Vec<&ResultRow> = rows
        .iter()
        .filter(|r| r.evaluated && !r.skill_id.trim().is_empty())
        .filter(|r| StudentKey::from_row(r).as_ref() == Some(student))
        .collect();
    let Some(latest) = student_rows.iter().map(|r| r.semester.as_str()).max() else {
        return Vec::new();
    };

    let mut skills: BTreeMap<(String, String), (WeakSkill, u64, u64)> = BTreeMap::new();
    for row in student_rows.iter().filter(|r| r.semester == latest) {
        let entry = skills
            .entry((row.component.clone(), row.skill_id.clone()))
            .or_insert_with(|| {
                (
                    WeakSkill {
                        component: row.component.clone(),
                        skill_id: row.skill_id.clone(),
                        skill_code: row.skill_code.clone(),
                        skill_description: row.skill_description.clone(),
                        percentual: 0.0,
                    },
                    0,
                    0,
                )
            });
        entry.1 += u64::from(row.correct_count);
        entry.2 += u64::from(row.total_count);
    }

    skills
        .into_values()
        .filter_map(|(mut skill, correct, total)| {
            let ratio = percentage(correct, total)?;
            if ratio >= 100.0 {
                return None;
            }
            skill.percentual = ratio;
            Some(skill)
        })
        .collect()
}

/// Easiest first: highest percentage, then skill id.
pub fn sort_easiest_first(skills: &mut [WeakSkill]) {
    skills.sort_by(|a, b| {
        b.percentual
            .partial_cmp(&a.percentual)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.component.cmp(&b.component))
            .then_with(|| a.skill_id.cmp(&b.skill_id))
    });
}

pub fn format_percent(value: f64) -> String {
    if (value - value.round()).abs() < 0.05 {
        format!("{value:.0}")
    } else {
        format!("{value:.1}")
    }
}

pub fn activity_sentence(skill: &WeakSkill) -> String {
    format!(
        "Fazer a lista de atividades do componente {} \u{2013} {}, que trata sobre {}.",
        skill.component, skill.skill_id, skill.skill_description
    )
}

pub fn compose_prompt(student: &StudentKey, skills: &[WeakSkill]) -> String {
    let skills_json = serde_json::to_string_pretty(skills).unwrap_or_else(|_| "[]".to_string());
    format!(
        r#"Elabore um plano de intervenção pedagógica para o(a) estudante abaixo.

Estudante: {name}
Unidade: {unit}
Turma: {class_group}
Ano escolar: {school_year}

Habilidades com desempenho abaixo de 100% (percentual de acertos):
{skills_json}

Responda SOMENTE com um objeto JSON com exatamente estas chaves:
{{
  "analiseGeral": "texto",
  "pontosMelhoria": ["texto"],
  "estrategias": ["texto"],
  "atividadesPorHabilidade": [
    {{"habilidade_id": "id", "componente": "componente", "descricao": "texto", "sugestoes": ["texto"]}}
  ],
  "cronograma": [
    {{"semana": 1, "foco": "texto", "objetivo": "texto", "tarefas": ["texto"]}}
  ],
  "modeloIntervencao": {{
    "objetivo": "texto",
    "metasCurtoPrazo": ["texto"],
    "rotina": ["texto"],
    "acompanhamento": ["texto"],
    "responsabilidades": ["texto"]
  }}
}}

Regras:
- O cronograma deve ter exatamente 4 semanas, distribuindo as habilidades da que tem
  MAIOR percentual (mais fácil de recuperar) para a de MENOR percentual (mais difícil).
- Em "atividadesPorHabilidade", a primeira sugestão de cada habilidade deve ser:
  "Fazer a lista de atividades do componente <componente> – <habilidade_id>, que trata sobre <descrição>."
- Escreva em português, com linguagem clara para professores e famílias."#,
        name = student.name,
        unit = student.unit,
        class_group = student.class_group,
        school_year = student.school_year,
    )
}

/// The JSON object spanning from the first `{` to the last `}` of the text.
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

pub fn parse_plan(text: &str) -> Result<RemediationPlan, PlanParseError> {
    let json = extract_json(text).ok_or(PlanParseError::NoJson)?;
    let value: Value = serde_json::from_str(json)?;
    let object = value.as_object().ok_or(PlanParseError::NoJson)?;
    for key in REQUIRED_KEYS {
        if !object.contains_key(key) {
            return Err(PlanParseError::MissingKey(key));
        }
    }
    Ok(serde_json::from_value(value)?)
}

fn skill_focus(skill: &WeakSkill) -> String {
    format!(
        "{} ({}) \u{2013} {} ({}%)",
        skill.skill_id,
        skill.component,
        skill.skill_description,
        format_percent(skill.percentual)
    )
}

fn skill_tasks(skill: &WeakSkill) -> Vec<String> {
    vec![
        format!("Revisar o conteúdo de {} com exemplos resolvidos", skill.skill_id),
        activity_sentence(skill),
        format!(
            "Corrigir com o professor os erros cometidos em {} e refazer as questões",
            skill.skill_id
        ),
    ]
}

const WEEK_OBJECTIVES: [&str; WEEKS] = [
    "Recuperar as habilidades mais próximas do domínio e ganhar confiança",
    "Consolidar habilidades em desenvolvimento com prática orientada",
    "Aprofundar habilidades com maior defasagem usando material concreto",
    "Retomar as habilidades mais difíceis e verificar a aprendizagem",
];

/// Deterministic plan built from the weak-skill list alone.
pub fn fallback_plan(student: &StudentKey, skills: &[WeakSkill]) -> RemediationPlan {
    let mut easiest_first = skills.to_vec();
    sort_easiest_first(&mut easiest_first);

    let mut buckets: Vec<Vec<&WeakSkill>> = vec![Vec::new(); WEEKS];
    for (index, skill) in easiest_first.iter().enumerate() {
        buckets[index % WEEKS].push(skill);
    }

    let schedule = buckets
        .iter()
        .enumerate()
        .map(|(index, assigned)| {
            if assigned.is_empty() {
                return WeekPlan {
                    week: index as u8 + 1,
                    focus: "Revisão geral das habilidades trabalhadas".to_string(),
                    objective: "Verificar a retenção do que foi trabalhado nas semanas anteriores"
                        .to_string(),
                    tasks: vec![
                        "Refazer questões das listas anteriores".to_string(),
                        "Registrar as dúvidas que ainda persistem".to_string(),
                    ],
                };
            }
            WeekPlan {
                week: index as u8 + 1,
                focus: assigned
                    .iter()
                    .map(|skill| skill_focus(skill))
                    .collect::<Vec<_>>()
                    .join("; "),
                objective: WEEK_OBJECTIVES[index].to_string(),
                tasks: assigned.iter().flat_map(|skill| skill_tasks(skill)).collect(),
            }
        })
        .collect();

    let skill_activities = easiest_first
        .iter()
        .map(|skill| SkillActivity {
            skill_id: skill.skill_id.clone(),
            component: skill.component.clone(),
            description: skill.skill_description.clone(),
            suggestions: vec![
                activity_sentence(skill),
                format!(
                    "Resolver exercícios graduados de {} ({}), do mais simples ao mais complexo.",
                    skill.skill_code, skill.skill_id
                ),
                "Explicar oralmente a resolução de uma questão para verificar a compreensão."
                    .to_string(),
            ],
        })
        .collect();

    let mut hardest_first = easiest_first.clone();
    hardest_first.reverse();
    let improvement_points = hardest_first
        .iter()
        .take(3)
        .map(|skill| {
            format!(
                "{} ({}) com {}%",
                skill.skill_id,
                skill.component,
                format_percent(skill.percentual)
            )
        })
        .collect();

    let mean = if easiest_first.is_empty() {
        0.0
    } else {
        easiest_first.iter().map(|s| s.percentual).sum::<f64>() / easiest_first.len() as f64
    };
    let general_analysis = format!(
        "{} apresenta {} habilidade(s) com acerto abaixo de 100%, com média de {}% nessas \
         habilidades. O plano começa pelas habilidades mais próximas do domínio e avança \
         para as de maior defasagem ao longo de {} semanas.",
        student.name,
        skills.len(),
        format_percent(mean),
        WEEKS
    );

    RemediationPlan {
        general_analysis,
        improvement_points,
        strategies: vec![
            "Retomada dos conteúdos com exemplos resolvidos e linguagem acessível.".to_string(),
            "Prática gradual com listas de atividades por habilidade.".to_string(),
            "Correção comentada dos erros, com devolutiva individual.".to_string(),
            "Uso de material concreto e recursos visuais nas habilidades mais difíceis."
                .to_string(),
        ],
        skill_activities,
        schedule,
        intervention: InterventionModel {
            objective: format!(
                "Elevar o desempenho de {} nas habilidades em defasagem até o nível adequado.",
                student.name
            ),
            short_term_goals: vec![
                "Concluir as listas de atividades previstas para cada semana.".to_string(),
                "Aumentar o percentual de acerto nas habilidades trabalhadas.".to_string(),
            ],
            routine: vec![
                "Dois encontros semanais de reforço de 50 minutos.".to_string(),
                "Atividade de casa curta ao fim de cada encontro.".to_string(),
            ],
            tracking: vec![
                "Registro semanal de acertos por habilidade.".to_string(),
                "Avaliação diagnóstica ao final da quarta semana.".to_string(),
            ],
            responsibilities: vec![
                "Professor(a): conduzir os encontros e corrigir as atividades.".to_string(),
                "Coordenação: acompanhar o registro semanal.".to_string(),
                "Família: apoiar a realização das atividades de casa.".to_string(),
            ],
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanSource {
    Generated,
    Fallback,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanOutcome {
    Parsed(RemediationPlan),
    Fallback(RemediationPlan),
}

impl PlanOutcome {
    pub fn plan(&self) -> &RemediationPlan {
        match self {
            PlanOutcome::Parsed(plan) | PlanOutcome::Fallback(plan) => plan,
        }
    }

    pub fn source(&self) -> PlanSource {
        match self {
            PlanOutcome::Parsed(_) => PlanSource::Generated,
            PlanOutcome::Fallback(_) => PlanSource::Fallback,
        }
    }
}

/// Asks the generator for a plan and falls back to the deterministic plan when
/// there is no generator, the call fails or the answer does not parse.
pub async fn synthesize(
    generator: Option<&dyn TextGenerator>,
    student: &StudentKey,
    skills: &[WeakSkill],
) -> PlanOutcome {
    let Some(generator) = generator else {
        debug!(student = %student.name, "no generator configured, using fallback plan");
        return PlanOutcome::Fallback(fallback_plan(student, skills));
    };

    let prompt = compose_prompt(student, skills);
    let text = match generator.generate(&prompt).await {
        Ok(text) => text,
        Err(err) => {
            warn!(
                student = %student.name,
                generator = generator.name(),
                error = %err,
                "plan generation failed"
            );
            return PlanOutcome::Fallback(fallback_plan(student, skills));
        }
    };

    match parse_plan(&text) {
        Ok(plan) => PlanOutcome::Parsed(plan),
        Err(err) => {
            warn!(student = %student.name, error = %err, "generated plan rejected");
            PlanOutcome::Fallback(fallback_plan(student, skills))
        }
    }
}

/// Students whose remediation plan is being produced.
#[derive(Debug, Default)]
pub struct InFlight {
    students: Mutex<HashSet<StudentKey>>,
}

impl InFlight {
    /// Marks the student as in progress; `None` if already marked.
    pub fn try_begin(&self, student: &StudentKey) -> Option<InFlightGuard<'_>> {
        let mut students = self.students.lock().unwrap_or_else(|e| e.into_inner());
        if !students.insert(student.clone()) {
            return None;
        }
        Some(InFlightGuard {
            owner: self,
            student: student.clone(),
        })
    }

    #[cfg(test)]
    pub fn is_running(&self, student: &StudentKey) -> bool {
        self.students
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(student)
    }
}

/// Clears the in-progress marker when dropped.
pub struct InFlightGuard<'a> {
    owner: &'a InFlight,
    student: StudentKey,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.owner
            .students
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.student);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemediationReport {
    pub path: PathBuf,
    pub source: PlanSource,
    pub weak_skills: usize,
}

pub struct RemediationService {
    generator: Option<Box<dyn TextGenerator>>,
    exporter: DocumentExporter,
    in_flight: InFlight,
}

impl RemediationService {
    pub fn new(generator: Option<Box<dyn TextGenerator>>, exporter: DocumentExporter) -> Self {
        Self {
            generator,
            exporter,
            in_flight: InFlight::default(),
        }
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// Builds and exports the plan for one student. Nothing is written unless
    /// the whole document is ready.
    pub async fn run<L>(
        &self,
        student: &StudentKey,
        rows: &[ResultRow],
        links: &L,
        cache: &mut LinkCache,
    ) -> Result<RemediationReport, RemediationError>
    where
        L: LinkSource + ?Sized,
    {
        let _guard = self
            .in_flight
            .try_begin(student)
            .ok_or_else(|| RemediationError::AlreadyRunning(student.name.clone()))?;

        let mut skills = collect_weak_skills(rows, student);
        if skills.is_empty() {
            return Err(RemediationError::NoWeakSkills(student.name.clone()));
        }

        let outcome = synthesize(self.generator.as_deref(), student, &skills).await;

        sort_easiest_first(&mut skills);
        let mut references = Vec::with_capacity(skills.len());
        for skill in &skills {
            references.push(cache.get(links, &skill.skill_code, &skill.component).await);
        }

        let document = plan_document(student, outcome.plan(), &skills, &references);
        let path = self.exporter.export(&document, &student.name)?;

        info!(
            student = %student.name,
            weak_skills = skills.len(),
            source = ?outcome.source(),
            path = %path.display(),
            "remediation plan exported"
        );

        Ok(RemediationReport {
            path,
            source: outcome.source(),
            weak_skills: skills.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::PageLayout;
    use crate::generator::fake::ScriptedGenerator;
    use crate::store::fake::MemoryLinks;

    fn student() -> StudentKey {
        StudentKey {
            name: "Ana Souza".to_string(),
            unit: "Colégio ABC".to_string(),
            class_group: "6A".to_string(),
            school_year: "6º ano".to_string(),
        }
    }

    fn weak(id: &str, pct: f64) -> WeakSkill {
        WeakSkill {
            component: "MT".to_string(),
            skill_id: id.to_string(),
            skill_code: format!("D{id}"),
            skill_description: format!("conteúdo {id}"),
            percentual: pct,
        }
    }

    fn result(skill: &str, correct: u32, total: u32) -> ResultRow {
        ResultRow {
            student_name: "Ana Souza".to_string(),
            class_group: "6A".to_string(),
            unit: "Colégio ABC".to_string(),
            region: "CWB".to_string(),
            school_year: "6º ano".to_string(),
            component: "MT".to_string(),
            semester: "1".to_string(),
            skill_id: skill.to_string(),
            skill_code: format!("D{skill}"),
            skill_description: format!("conteúdo {skill}"),
            evaluated: true,
            correct_count: correct,
            total_count: total,
            learning_level: None,
        }
    }

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("remediation-test-{}", uuid::Uuid::new_v4()))
    }

    fn service(generator: Option<Box<dyn TextGenerator>>, dir: PathBuf) -> RemediationService {
        RemediationService::new(generator, DocumentExporter::new(dir, PageLayout::default()))
    }

    fn sample_skills() -> Vec<WeakSkill> {
        vec![
            weak("H1", 80.0),
            weak("H2", 40.0),
            weak("H3", 60.0),
            weak("H4", 20.0),
            weak("H5", 10.0),
        ]
    }

    #[test]
    fn weak_skills_exclude_full_marks_and_empty_skills() {
        let mut other = result("H9", 0, 2);
        other.student_name = "Bruno".to_string();
        let rows = vec![
            result("H1", 1, 2),
            result("H1", 2, 2),
            result("H2", 3, 3),
            result("H3", 0, 0),
            other,
        ];
        let skills = collect_weak_skills(&rows, &student());
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].skill_id, "H1");
        assert!((skills[0].percentual - 75.0).abs() < 1e-9);
    }

    #[test]
    fn weak_skills_come_from_the_latest_semester() {
        let in_second = |skill: &str, correct: u32, total: u32| {
            let mut row = result(skill, correct, total);
            row.semester = "2".to_string();
            row
        };
        let rows = vec![
            result("H1", 2, 4),
            in_second("H1", 4, 4),
            result("H2", 1, 4),
            in_second("H2", 3, 4),
            result("H3", 0, 4),
        ];
        let skills = collect_weak_skills(&rows, &student());
        let found: Vec<(&str, f64)> = skills
            .iter()
            .map(|s| (s.skill_id.as_str(), s.percentual))
            .collect();
        assert_eq!(found, vec![("H2", 75.0)]);

        let first_only: Vec<ResultRow> = rows.into_iter().filter(|r| r.semester == "1").collect();
        let skills = collect_weak_skills(&first_only, &student());
        assert_eq!(skills.len(), 3);
        assert!((skills[0].percentual - 50.0).abs() < 1e-9);
    }

    #[test]
    fn fallback_schedule_cycles_easiest_first() {
        let plan = fallback_plan(&student(), &sample_skills());
        assert_eq!(plan.schedule.len(), WEEKS);
        let weeks: Vec<u8> = plan.schedule.iter().map(|w| w.week).collect();
        assert_eq!(weeks, vec![1, 2, 3, 4]);

        let week1 = &plan.schedule[0].focus;
        assert!(week1.contains("H1"));
        assert!(week1.contains("H5"));
        assert!(week1.find("H1").unwrap() < week1.find("H5").unwrap());
        assert!(plan.schedule[1].focus.contains("H3"));
        assert!(plan.schedule[2].focus.contains("H2"));
        assert!(plan.schedule[3].focus.contains("H4"));
        assert_eq!(plan.schedule[0].tasks.len(), 6);
        assert_eq!(plan.schedule[1].tasks.len(), 3);
    }

    #[test]
    fn fallback_schedule_fills_all_weeks_with_few_skills() {
        let plan = fallback_plan(&student(), &[weak("H1", 50.0)]);
        assert_eq!(plan.schedule.len(), WEEKS);
        assert!(plan.schedule[0].focus.contains("H1"));
        assert!(!plan.schedule[3].tasks.is_empty());
    }

    #[test]
    fn fallback_activities_start_with_template_sentence() {
        let plan = fallback_plan(&student(), &sample_skills());
        assert_eq!(plan.skill_activities.len(), 5);
        let first = &plan.skill_activities[0];
        assert_eq!(first.skill_id, "H1");
        assert_eq!(first.suggestions.len(), 3);
        assert_eq!(
            first.suggestions[0],
            "Fazer a lista de atividades do componente MT \u{2013} H1, que trata sobre conteúdo H1."
        );
    }

    #[test]
    fn fallback_lists_three_weakest_points() {
        let plan = fallback_plan(&student(), &sample_skills());
        assert_eq!(
            plan.improvement_points,
            vec!["H5 (MT) com 10%", "H4 (MT) com 20%", "H2 (MT) com 40%"]
        );
        assert!(plan.general_analysis.contains("Ana Souza"));
        assert!(!plan.intervention.responsibilities.is_empty());
    }

    #[test]
    fn fallback_is_deterministic() {
        let a = fallback_plan(&student(), &sample_skills());
        let mut shuffled = sample_skills();
        shuffled.reverse();
        let b = fallback_plan(&student(), &shuffled);
        assert_eq!(a.schedule, b.schedule);
        assert_eq!(a.skill_activities, b.skill_activities);
    }

    #[test]
    fn prompt_carries_ordering_rule_and_skills() {
        let prompt = compose_prompt(&student(), &sample_skills());
        assert!(prompt.contains("Ana Souza"));
        assert!(prompt.contains("exatamente 4 semanas"));
        assert!(prompt.contains("MAIOR percentual"));
        assert!(prompt.contains("\"skill_id\": \"H5\""));
        for key in REQUIRED_KEYS {
            assert!(prompt.contains(key), "prompt should mention {key}");
        }
    }

    #[test]
    fn extract_json_takes_trailing_object() {
        let text = "Segue o plano:\n```json\n{\"a\": {\"b\": 1}}\n```";
        assert_eq!(extract_json(text), Some("{\"a\": {\"b\": 1}}"));
        assert_eq!(extract_json("sem json"), None);
        assert_eq!(extract_json("} antes {"), None);
    }

    #[test]
    fn parse_rejects_missing_keys() {
        let text = r#"{"analiseGeral": "ok", "pontosMelhoria": [], "estrategias": []}"#;
        assert!(matches!(
            parse_plan(text),
            Err(PlanParseError::MissingKey("atividadesPorHabilidade"))
        ));
        assert!(matches!(parse_plan("nada"), Err(PlanParseError::NoJson)));
        assert!(matches!(parse_plan("{ruim}"), Err(PlanParseError::Malformed(_))));
    }

    #[test]
    fn parse_accepts_generated_plan() {
        let plan = fallback_plan(&student(), &sample_skills());
        let generated = serde_json::to_string(&plan).unwrap();
        let text = format!("Aqui está:\n{generated}");
        let plan = parse_plan(&text).unwrap();
        assert_eq!(plan.schedule.len(), 4);
        assert_eq!(plan.skill_activities[0].skill_id, "H1");
    }

    #[tokio::test]
    async fn synthesize_uses_parsed_plan() {
        let mut expected = fallback_plan(&student(), &sample_skills());
        expected.general_analysis = "Análise gerada".to_string();
        let generator = ScriptedGenerator::replying(&serde_json::to_string(&expected).unwrap());

        let outcome = synthesize(Some(&generator), &student(), &sample_skills()).await;
        assert_eq!(outcome.source(), PlanSource::Generated);
        assert_eq!(outcome.plan().general_analysis, "Análise gerada");
        assert_eq!(generator.prompts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn synthesize_falls_back_on_bad_output_or_failure() {
        let expected = fallback_plan(&student(), &sample_skills());

        let garbled = ScriptedGenerator::replying("Desculpe, não consegui.");
        let outcome = synthesize(Some(&garbled), &student(), &sample_skills()).await;
        assert_eq!(outcome, PlanOutcome::Fallback(expected.clone()));

        let failing = ScriptedGenerator::failing("timeout");
        let outcome = synthesize(Some(&failing), &student(), &sample_skills()).await;
        assert_eq!(outcome, PlanOutcome::Fallback(expected.clone()));

        let outcome = synthesize(None, &student(), &sample_skills()).await;
        assert_eq!(outcome, PlanOutcome::Fallback(expected));
    }

    #[test]
    fn in_flight_marker_is_per_student() {
        let in_flight = InFlight::default();
        let ana = student();
        let mut bruno = student();
        bruno.name = "Bruno".to_string();

        let guard = in_flight.try_begin(&ana).unwrap();
        assert!(in_flight.try_begin(&ana).is_none());
        assert!(in_flight.try_begin(&bruno).is_some());
        assert!(in_flight.is_running(&ana));
        drop(guard);
        assert!(!in_flight.is_running(&ana));
    }

    #[tokio::test]
    async fn run_exports_document_and_clears_marker() {
        let dir = scratch_dir();
        let service = service(None, dir.clone());
        let rows = vec![result("H1", 1, 2), result("H2", 2, 2)];
        let mut links = MemoryLinks::default();
        links.links.insert(
            ("DH1".to_string(), "MT".to_string()),
            "https://exemplo.org/h1".to_string(),
        );
        let mut cache = LinkCache::new();

        let report = service
            .run(&student(), &rows, &links, &mut cache)
            .await
            .unwrap();
        assert_eq!(report.source, PlanSource::Fallback);
        assert_eq!(report.weak_skills, 1);
        let text = std::fs::read_to_string(&report.path).unwrap();
        assert!(text.contains("Ana Souza"));
        assert!(text.contains("https://exemplo.org/h1"));
        assert!(!service.in_flight().is_running(&student()));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn run_without_weak_skills_writes_nothing() {
        let dir = scratch_dir();
        let service = service(None, dir.clone());
        let rows = vec![result("H1", 2, 2)];
        let mut cache = LinkCache::new();

        let err = service
            .run(&student(), &rows, &MemoryLinks::default(), &mut cache)
            .await
            .unwrap_err();
        assert!(matches!(err, RemediationError::NoWeakSkills(_)));
        assert!(!dir.exists());
        assert!(!service.in_flight().is_running(&student()));
    }

    #[tokio::test]
    async fn run_refuses_student_already_in_progress() {
        let service = service(None, scratch_dir());
        let rows = vec![result("H1", 1, 2)];
        let mut cache = LinkCache::new();

        let _held = service.in_flight().try_begin(&student()).unwrap();
        let err = service
            .run(&student(), &rows, &MemoryLinks::default(), &mut cache)
            .await
            .unwrap_err();
        assert!(matches!(err, RemediationError::AlreadyRunning(_)));
    }

    #[tokio::test]
    async fn export_failure_surfaces_and_clears_marker() {
        let blocker = scratch_dir();
        std::fs::write(&blocker, "not a directory").unwrap();
        let service = service(None, blocker.clone());
        let rows = vec![result("H1", 1, 2)];
        let mut cache = LinkCache::new();

        let err = service
            .run(&student(), &rows, &MemoryLinks::default(), &mut cache)
            .await
            .unwrap_err();
        assert!(matches!(err, RemediationError::Export(_)));
        assert!(!service.in_flight().is_running(&student()));

        let _ = std::fs::remove_file(blocker);
    }
}
