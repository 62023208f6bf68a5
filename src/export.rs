use std::fmt::Write;
use std::path::PathBuf;

use chrono::Local;

use crate::error::ExportError;
use crate::models::{RemediationPlan, StudentKey, WeakSkill};
use crate::remediation::format_percent;

#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Title(String),
    Heading(String),
    Paragraph(String),
    Bullets(Vec<String>),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    pub blocks: Vec<Block>,
}

impl Document {
    pub fn title(&mut self, text: impl Into<String>) -> &mut Self {
        self.blocks.push(Block::Title(text.into()));
        self
    }

    pub fn heading(&mut self, text: impl Into<String>) -> &mut Self {
        self.blocks.push(Block::Heading(text.into()));
        self
    }

    pub fn paragraph(&mut self, text: impl Into<String>) -> &mut Self {
        self.blocks.push(Block::Paragraph(text.into()));
        self
    }

    pub fn bullets<I, S>(&mut self, items: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let items: Vec<String> = items.into_iter().map(Into::into).collect();
        if !items.is_empty() {
            self.blocks.push(Block::Bullets(items));
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLayout {
    pub width: usize,
    pub lines_per_page: usize,
}

impl Default for PageLayout {
    fn default() -> Self {
        Self {
            width: 90,
            lines_per_page: 56,
        }
    }
}

/// Greedy word wrap on character counts. Words longer than the width get a
/// line of their own.
pub fn wrap(text: &str, width: usize) -> Vec<String> {
    let width = width.max(1);
    let mut lines = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        let needed = if current.is_empty() {
            word.chars().count()
        } else {
            current.chars().count() + 1 + word.chars().count()
        };
        if needed > width && !current.is_empty() {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

fn block_lines(block: &Block, width: usize) -> Vec<String> {
    match block {
        Block::Title(text) => {
            let mut lines = wrap(&text.to_uppercase(), width);
            let underline = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0);
            lines.push("=".repeat(underline));
            lines
        }
        Block::Heading(text) => {
            let mut lines = wrap(text, width);
            let underline = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0);
            lines.push("-".repeat(underline));
            lines
        }
        Block::Paragraph(text) => wrap(text, width),
        Block::Bullets(items) => items
            .iter()
            .flat_map(|item| {
                wrap(item, width.saturating_sub(2))
                    .into_iter()
                    .enumerate()
                    .map(|(i, line)| {
                        if i == 0 {
                            format!("\u{2022} {line}")
                        } else {
                            format!("  {line}")
                        }
                    })
                    .collect::<Vec<_>>()
            })
            .collect(),
    }
}

/// Lays blocks out on fixed-height pages. A heading never sits alone at the
/// bottom of a page.
pub fn paginate(document: &Document, layout: PageLayout) -> Vec<Vec<String>> {
    let height = layout.lines_per_page.max(4);
    let mut pages: Vec<Vec<String>> = Vec::new();
    let mut page: Vec<String> = Vec::new();

    for block in &document.blocks {
        let lines = block_lines(block, layout.width);
        let is_heading = matches!(block, Block::Title(_) | Block::Heading(_));
        if is_heading && !page.is_empty() && page.len() + lines.len() + 1 >= height {
            pages.push(std::mem::take(&mut page));
        }
        for line in lines {
            if page.len() >= height {
                pages.push(std::mem::take(&mut page));
            }
            page.push(line);
        }
        if !page.is_empty() && page.len() < height {
            page.push(String::new());
        }
    }
    if page.iter().any(|line| !line.is_empty()) {
        pages.push(page);
    }
    pages
}

pub fn render(pages: &[Vec<String>]) -> String {
    let mut output = String::new();
    let count = pages.len();
    for (index, page) in pages.iter().enumerate() {
        if index > 0 {
            output.push('\u{000C}');
        }
        for line in page {
            let _ = writeln!(output, "{}", line.trim_end());
        }
        let footer = format!("Página {} de {}", index + 1, count);
        let _ = writeln!(output, "{footer:>20}");
    }
    output
}

/// File-name-safe form of a student name.
pub fn file_stem(name: &str) -> String {
    let slug: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    let collapsed = slug
        .split('_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    if collapsed.is_empty() {
        "aluno".to_string()
    } else {
        collapsed
    }
}

#[derive(Debug, Clone)]
pub struct DocumentExporter {
    out_dir: PathBuf,
    layout: PageLayout,
}

impl DocumentExporter {
    pub fn new(out_dir: PathBuf, layout: PageLayout) -> Self {
        Self { out_dir, layout }
    }

    /// Paginates the document and writes it as `plano_<student>.txt`.
    pub fn export(&self, document: &Document, student_name: &str) -> Result<PathBuf, ExportError> {
        if document.is_empty() {
            return Err(ExportError::EmptyDocument);
        }
        let text = render(&paginate(document, self.layout));

        std::fs::create_dir_all(&self.out_dir).map_err(|source| ExportError::Io {
            path: self.out_dir.clone(),
            source,
        })?;
        let path = self
            .out_dir
            .join(format!("plano_{}.txt", file_stem(student_name)));
        std::fs::write(&path, text).map_err(|source| ExportError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

/// Remediation document: plan sections followed by the weak skills, easiest
/// first, each with its reference link when one is known.
pub fn plan_document(
    student: &StudentKey,
    plan: &RemediationPlan,
    skills: &[WeakSkill],
    links: &[Option<String>],
) -> Document {
    let mut doc = Document::default();
    doc.title(format!("Plano de Intervenção \u{2013} {}", student.name))
        .paragraph(format!(
            "Unidade: {} | Turma: {} | Ano escolar: {} | Gerado em {}",
            student.unit,
            student.class_group,
            student.school_year,
            Local::now().format("%d/%m/%Y")
        ))
        .heading("Análise Geral")
        .paragraph(plan.general_analysis.clone())
        .heading("Pontos de Melhoria")
        .bullets(plan.improvement_points.iter().cloned())
        .heading("Estratégias")
        .bullets(plan.strategies.iter().cloned());

    doc.heading("Atividades por Habilidade");
    for activity in &plan.skill_activities {
        doc.paragraph(format!(
            "{} ({}) \u{2013} {}",
            activity.skill_id, activity.component, activity.description
        ))
        .bullets(activity.suggestions.iter().cloned());
    }

    doc.heading("Cronograma de 4 Semanas");
    for week in &plan.schedule {
        doc.paragraph(format!("Semana {}: {}", week.week, week.focus));
        if !week.objective.is_empty() {
            doc.paragraph(format!("Objetivo: {}", week.objective));
        }
        doc.bullets(week.tasks.iter().cloned());
    }

    let model = &plan.intervention;
    doc.heading("Modelo de Intervenção")
        .paragraph(format!("Objetivo: {}", model.objective))
        .paragraph("Metas de curto prazo:")
        .bullets(model.short_term_goals.iter().cloned())
        .paragraph("Rotina:")
        .bullets(model.routine.iter().cloned())
        .paragraph("Acompanhamento:")
        .bullets(model.tracking.iter().cloned())
        .paragraph("Responsabilidades:")
        .bullets(model.responsibilities.iter().cloned());

    doc.heading("Habilidades com Defasagem");
    let items: Vec<String> = skills
        .iter()
        .enumerate()
        .map(|(i, skill)| {
            let mut item = format!(
                "{} \u{2013} {} ({}): {}% \u{2013} {}",
                skill.component,
                skill.skill_id,
                skill.skill_code,
                format_percent(skill.percentual),
                skill.skill_description
            );
            if let Some(Some(link)) = links.get(i) {
                let _ = write!(item, " [{link}]");
            }
            item
        })
        .collect();
    doc.bullets(items);
    doc
}
