use std::time::Duration;

use clap::Args;
use tracing::warn;

use crate::generator::{GeneratorConfig, HttpGenerator, TextGenerator};
use crate::scope::FilterSelection;
use crate::store::DEFAULT_PAGE_SIZE;
use crate::tier::TierPolicy;

#[derive(Debug, Clone, Args)]
pub struct StoreArgs {
    /// Postgres connection string for the results database
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: String,

    /// Rows fetched per page when loading results
    #[arg(long, env = "RESULTS_PAGE_SIZE", default_value_t = DEFAULT_PAGE_SIZE)]
    pub page_size: usize,

    /// How each student's tier is decided
    #[arg(long, value_enum, default_value_t = TierPolicy::Computed)]
    pub tier_policy: TierPolicy,
}

#[derive(Debug, Clone, Args)]
pub struct GeneratorArgs {
    /// Chat-completions endpoint used to draft remediation plans
    #[arg(long, env = "GENERATOR_URL")]
    pub generator_url: Option<String>,

    #[arg(long, env = "GENERATOR_API_KEY", hide_env_values = true)]
    pub generator_api_key: Option<String>,

    #[arg(long, env = "GENERATOR_MODEL", default_value = "gpt-4o-mini")]
    pub generator_model: String,

    #[arg(long, env = "GENERATOR_TIMEOUT_SECS", default_value_t = 60)]
    pub generator_timeout_secs: u64,
}

impl GeneratorArgs {
    pub fn config(&self) -> Option<GeneratorConfig> {
        let url = self.generator_url.as_ref()?.trim();
        if url.is_empty() {
            return None;
        }
        Some(GeneratorConfig {
            url: url.to_string(),
            api_key: self
                .generator_api_key
                .clone()
                .filter(|key| !key.trim().is_empty()),
            model: self.generator_model.clone(),
            timeout: Duration::from_secs(self.generator_timeout_secs.max(1)),
        })
    }

    /// `None` when no endpoint is configured or the client cannot be built;
    /// plans are then synthesized locally.
    pub fn build(&self) -> Option<Box<dyn TextGenerator>> {
        let config = self.config()?;
        match HttpGenerator::new(config) {
            Ok(generator) => Some(Box::new(generator)),
            Err(err) => {
                warn!(error = %err, "generator unavailable, using local plans");
                None
            }
        }
    }
}

/// Dashboard selectors. "Todos", "Todas", "all" and blanks mean no filter.
#[derive(Debug, Clone, Default, Args)]
pub struct FilterArgs {
    /// Subject component code, e.g. LP or MT
    #[arg(long)]
    pub component: Option<String>,

    #[arg(long)]
    pub school_year: Option<String>,

    #[arg(long)]
    pub region: Option<String>,

    #[arg(long)]
    pub unit: Option<String>,

    /// "1" or "2"; narrows student and skill listings and remediation
    #[arg(long)]
    pub semester: Option<String>,
}

impl FilterArgs {
    pub fn selection(&self) -> FilterSelection {
        FilterSelection::new(
            self.component.as_deref(),
            self.school_year.as_deref(),
            self.region.as_deref(),
            self.unit.as_deref(),
        )
        .with_semester(self.semester.as_deref())
    }
}
