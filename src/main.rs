use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

mod aggregate;
mod config;
mod db;
mod error;
mod export;
mod generator;
mod models;
mod normalize;
mod remediation;
mod report;
mod scope;
mod store;
mod tier;
mod trend;

use crate::config::{FilterArgs, GeneratorArgs, StoreArgs};
use crate::error::RemediationError;
use crate::export::{DocumentExporter, PageLayout};
use crate::models::StudentKey;
use crate::remediation::{PlanSource, RemediationService};
use crate::scope::{fetch_listing_rows, OverviewLoader};
use crate::store::{fetch_with_unit_fallback, LinkCache, ResultQuery};

#[derive(Parser)]
#[command(name = "proficiency-dashboard")]
#[command(about = "Student proficiency overview and remediation plans", long_about = None)]
struct Cli {
    #[command(flatten)]
    store: StoreArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load sample assessment results
    Seed,
    /// Write the unit / regional / network overview as markdown
    Overview {
        #[command(flatten)]
        filters: FilterArgs,
        #[arg(long, default_value = "overview.md")]
        out: PathBuf,
    },
    /// List the skills with the lowest accuracy
    Skills {
        #[command(flatten)]
        filters: FilterArgs,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Per-student results, optionally exported as CSV
    Students {
        #[command(flatten)]
        filters: FilterArgs,
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Build a four-week remediation plan for one student
    Remediate {
        #[arg(long)]
        student: String,
        #[command(flatten)]
        filters: FilterArgs,
        #[command(flatten)]
        generator: GeneratorArgs,
        #[arg(long, default_value = "planos")]
        out_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("proficiency_dashboard=info")
            }),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cli.store.database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = db::PgStore::new(pool.clone());
    let page_size = cli.store.page_size.max(1);
    let policy = cli.store.tier_policy;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let inserted = db::seed(&pool).await?;
            println!("Inserted {inserted} result rows.");
        }
        Commands::Overview { filters, out } => {
            let loader = OverviewLoader::new(policy, page_size);
            // both semesters are always compared
            let selection = filters.selection().with_semester(None);
            let Some((overview, rows)) = loader.load(&store, selection).await else {
                println!("Overview superseded by a newer load.");
                return Ok(());
            };
            let report = report::build_overview_report(&overview, &rows);
            std::fs::write(&out, report)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Overview written to {}.", out.display());
        }
        Commands::Skills { filters, limit } => {
            let rows = fetch_listing_rows(&store, &filters.selection(), page_size).await;
            print!("{}", report::build_skills_report(&rows, limit));
        }
        Commands::Students { filters, csv } => {
            let rows = fetch_listing_rows(&store, &filters.selection(), page_size).await;
            let breakdowns = aggregate::student_breakdowns(&rows);
            if breakdowns.is_empty() {
                println!("No students found for these filters.");
                return Ok(());
            }
            print!("{}", report::build_students_report(&rows, &breakdowns, policy));
            if let Some(path) = csv {
                let written = report::write_students_csv(&path, &rows, policy)?;
                println!("Wrote {written} students to {}.", path.display());
            }
        }
        Commands::Remediate {
            student,
            filters,
            generator,
            out_dir,
        } => {
            let selection = filters.selection();
            let name = student.trim().to_string();
            let query = ResultQuery {
                student_name: Some(name.clone()),
                ..selection.listing_query()
            };
            let rows = fetch_with_unit_fallback(&store, &query, page_size).await?;

            let keys: BTreeSet<StudentKey> = rows
                .iter()
                .filter_map(StudentKey::from_row)
                .filter(|key| key.name == name)
                .collect();
            let key = match keys.len() {
                0 => {
                    println!("No results found for {name}.");
                    return Ok(());
                }
                1 => keys.into_iter().next().context("student key vanished")?,
                _ => {
                    println!("Several students named {name}; narrow the search with --unit:");
                    for key in &keys {
                        println!(
                            "- {} ({}, turma {}, {})",
                            key.name, key.unit, key.class_group, key.school_year
                        );
                    }
                    return Ok(());
                }
            };

            let service = RemediationService::new(
                generator.build(),
                DocumentExporter::new(out_dir, PageLayout::default()),
            );
            let mut cache = LinkCache::new();
            match service.run(&key, &rows, &store, &mut cache).await {
                Ok(report) => {
                    let origin = match report.source {
                        PlanSource::Generated => "generated",
                        PlanSource::Fallback => "built locally",
                    };
                    info!(links_cached = cache.len(), "reference links resolved");
                    println!(
                        "Plan for {} ({origin}, {} weak skills) written to {}.",
                        key.name,
                        report.weak_skills,
                        report.path.display()
                    );
                }
                Err(RemediationError::NoWeakSkills(name)) => {
                    println!("{name} has no skills below 100%; no plan needed.");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    Ok(())
}
