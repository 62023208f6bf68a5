use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::ResultRow;
use crate::store::{LinkSource, ResultQuery, ResultSource, UnitMatch};

const RESULT_COLUMNS: &str = "nome_aluno, turma, unidade, regional, ano_escolar, componente, \
     semestre, habilidade_id, habilidade_codigo, descricao_habilidade, avaliado, acertos, total, \
     nivel_aprendizagem";

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("failed to apply migrations")?;
    Ok(())
}

/// Results table plus the skill reference links, both in Postgres.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn push_eq(builder: &mut QueryBuilder<'_, Postgres>, column: &str, value: &Option<String>) {
    if let Some(value) = value {
        builder
            .push(" AND ")
            .push(column)
            .push(" = ")
            .push_bind(value.clone());
    }
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn build_results_query(
    query: &ResultQuery,
    offset: usize,
    limit: usize,
) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(format!(
        "SELECT {RESULT_COLUMNS} FROM proficiency.prova_resultados WHERE TRUE"
    ));

    push_eq(&mut builder, "componente", &query.component);
    push_eq(&mut builder, "ano_escolar", &query.school_year);
    push_eq(&mut builder, "regional", &query.region);
    push_eq(&mut builder, "semestre", &query.semester);
    push_eq(&mut builder, "nome_aluno", &query.student_name);

    if let Some(unit) = &query.unit {
        match query.unit_match {
            UnitMatch::Exact => {
                builder.push(" AND unidade = ").push_bind(unit.clone());
            }
            UnitMatch::Contains => {
                builder
                    .push(" AND unidade ILIKE ")
                    .push_bind(format!("%{}%", escape_like(unit)));
            }
        }
    }

    builder
        .push(" ORDER BY id LIMIT ")
        .push_bind(limit as i64)
        .push(" OFFSET ")
        .push_bind(offset as i64);
    builder
}

fn store_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StoreError::Unavailable(err.to_string())
        }
        other => StoreError::Query(other),
    }
}

fn non_negative(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn map_row(row: &PgRow) -> ResultRow {
    ResultRow {
        student_name: row.get("nome_aluno"),
        class_group: row.get("turma"),
        unit: row.get("unidade"),
        region: row.get("regional"),
        school_year: row.get("ano_escolar"),
        component: row.get("componente"),
        semester: row.get("semestre"),
        skill_id: row.get("habilidade_id"),
        skill_code: row.get("habilidade_codigo"),
        skill_description: row.get("descricao_habilidade"),
        evaluated: row.get("avaliado"),
        correct_count: non_negative(row.get("acertos")),
        total_count: non_negative(row.get("total")),
        learning_level: row.get("nivel_aprendizagem"),
    }
}

#[async_trait]
impl ResultSource for PgStore {
    async fn fetch_page(
        &self,
        query: &ResultQuery,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ResultRow>, StoreError> {
        let mut builder = build_results_query(query, offset, limit);
        let records = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(records.iter().map(map_row).collect())
    }
}

#[async_trait]
impl LinkSource for PgStore {
    async fn lookup_link(
        &self,
        skill_code: &str,
        component: &str,
    ) -> Result<Option<String>, StoreError> {
        let link: Option<String> = sqlx::query(
            "SELECT link FROM proficiency.habilidade_links \
             WHERE habilidade_codigo = $1 AND componente = $2",
        )
        .bind(skill_code)
        .bind(component)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?
        .map(|row| row.get("link"));
        Ok(link)
    }
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<usize> {
    let students = [
        ("Avery Lima", "6A", "Colégio Estadual Centro", "CWB"),
        ("Júlia Moreno", "6A", "Colégio Estadual Centro", "CWB"),
        ("Kauã Pereira", "6B", "Colégio - Norte, PROFIS", "CWB"),
        ("Lara Tavares", "6A", "Escola Estadual Leste", "SJP"),
        ("Miguel Rocha", "6A", "Escola Estadual Leste", "SJP"),
    ];
    let skills = [
        ("MT", "H01", "D01", "Resolver problemas com números naturais"),
        ("MT", "H07", "D07", "Interpretar gráficos e tabelas"),
        ("LP", "H03", "D03", "Inferir o sentido de palavras no texto"),
        ("LP", "H12", "D12", "Identificar a finalidade de um texto"),
    ];
    // (correct, total) per student, skill and semester
    let scores: [[[(i32, i32); 2]; 4]; 5] = [
        [[(2, 4), (3, 4)], [(1, 4), (3, 4)], [(3, 4), (4, 4)], [(2, 4), (3, 4)]],
        [[(4, 4), (4, 4)], [(3, 4), (4, 4)], [(4, 4), (4, 4)], [(3, 4), (3, 4)]],
        [[(0, 4), (1, 4)], [(1, 4), (1, 4)], [(1, 4), (2, 4)], [(0, 4), (2, 4)]],
        [[(2, 4), (2, 4)], [(2, 4), (3, 4)], [(1, 4), (2, 4)], [(2, 4), (2, 4)]],
        [[(3, 4), (4, 4)], [(4, 4), (4, 4)], [(3, 4), (4, 4)], [(4, 4), (4, 4)]],
    ];

    let mut inserted = 0usize;
    for (s, &(name, class_group, unit, region)) in students.iter().enumerate() {
        for (k, &(component, skill_id, skill_code, description)) in skills.iter().enumerate() {
            for (semester_index, &(correct, total)) in scores[s][k].iter().enumerate() {
                let semester = (semester_index + 1).to_string();
                let source_key = format!("seed-{s}-{k}-{semester}");
                let result = sqlx::query(
                    r#"
                    INSERT INTO proficiency.prova_resultados
                    (id, nome_aluno, turma, unidade, regional, ano_escolar, componente, semestre,
                     habilidade_id, habilidade_codigo, descricao_habilidade, avaliado, acertos,
                     total, source_key)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, TRUE, $12, $13, $14)
                    ON CONFLICT (source_key) DO NOTHING
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(name)
                .bind(class_group)
                .bind(unit)
                .bind(region)
                .bind("6º ano")
                .bind(component)
                .bind(&semester)
                .bind(skill_id)
                .bind(skill_code)
                .bind(description)
                .bind(correct)
                .bind(total)
                .bind(source_key)
                .execute(pool)
                .await?;
                if result.rows_affected() > 0 {
                    inserted += 1;
                }
            }
        }
    }

    for (component, _, skill_code, _) in skills {
        sqlx::query(
            r#"
            INSERT INTO proficiency.habilidade_links (habilidade_codigo, componente, link)
            VALUES ($1, $2, $3)
            ON CONFLICT (habilidade_codigo, componente) DO NOTHING
            "#,
        )
        .bind(skill_code)
        .bind(component)
        .bind(format!(
            "https://atividades.exemplo.edu.br/{}/{}",
            component.to_lowercase(),
            skill_code.to_lowercase()
        ))
        .execute(pool)
        .await?;
    }

    Ok(inserted)
}
