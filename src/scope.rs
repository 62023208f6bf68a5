use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::models::{ResultRow, Scope, ScopeSnapshot};
use crate::normalize::normalize_select;
use crate::store::{fetch_all, fetch_with_unit_fallback, ResultQuery, ResultSource};
use crate::tier::{snapshot, TierPolicy};
use crate::trend::{compare, SnapshotTrend};

/// Dashboard filter selection with "all" sentinels already stripped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSelection {
    pub component: Option<String>,
    pub school_year: Option<String>,
    pub region: Option<String>,
    pub unit: Option<String>,
    /// Applies to listings only; the overview always shows both semesters.
    pub semester: Option<String>,
}

impl FilterSelection {
    pub fn new(
        component: Option<&str>,
        school_year: Option<&str>,
        region: Option<&str>,
        unit: Option<&str>,
    ) -> Self {
        Self {
            component: normalize_select(component),
            school_year: normalize_select(school_year),
            region: normalize_select(region),
            unit: normalize_select(unit),
            semester: None,
        }
    }

    pub fn with_semester(mut self, semester: Option<&str>) -> Self {
        self.semester = normalize_select(semester);
        self
    }

    fn base_query(&self) -> ResultQuery {
        ResultQuery {
            component: self.component.clone(),
            school_year: self.school_year.clone(),
            ..ResultQuery::default()
        }
    }

    /// Query for student and skill listings: every selector applies, including
    /// region, unit and semester.
    pub fn listing_query(&self) -> ResultQuery {
        ResultQuery {
            region: self.region.clone(),
            unit: self.unit.clone(),
            semester: self.semester.clone(),
            ..self.base_query()
        }
    }

    pub fn describe(&self) -> String {
        let parts: Vec<String> = [
            ("componente", &self.component),
            ("ano", &self.school_year),
            ("regional", &self.region),
            ("unidade", &self.unit),
            ("semestre", &self.semester),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.as_ref().map(|v| format!("{name}={v}")))
        .collect();
        if parts.is_empty() {
            "toda a rede".to_string()
        } else {
            parts.join(", ")
        }
    }
}

/// Row sets feeding the three comparison scopes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeRows {
    pub unit: Vec<ResultRow>,
    pub regional: Vec<ResultRow>,
    pub network: Vec<ResultRow>,
}

impl ScopeRows {
    pub fn rows(&self, scope: Scope) -> &[ResultRow] {
        match scope {
            Scope::Unit => &self.unit,
            Scope::Regional => &self.regional,
            Scope::Network => &self.network,
        }
    }
}

/// Fetches the network and unit subsets concurrently. Failed fetches are
/// logged and leave that scope empty.
pub async fn resolve_rows<S>(source: &S, filters: &FilterSelection, page_size: usize) -> ScopeRows
where
    S: ResultSource + ?Sized,
{
    let base = filters.base_query();
    let unit_query = filters.unit.as_ref().map(|unit| ResultQuery {
        unit: Some(unit.clone()),
        ..base.clone()
    });

    let network_fetch = fetch_all(source, &base, page_size);
    let unit_fetch = async {
        match &unit_query {
            Some(query) => Some(fetch_with_unit_fallback(source, query, page_size).await),
            None => None,
        }
    };
    let (network, unit) = tokio::join!(network_fetch, unit_fetch);

    let network = network.unwrap_or_else(|err| {
        warn!(error = %err, scope = "network", "results fetch failed");
        Vec::new()
    });

    let regional = match &filters.region {
        Some(region) => network
            .iter()
            .filter(|row| &row.region == region)
            .cloned()
            .collect(),
        None => network.clone(),
    };

    let unit = match unit {
        Some(Ok(rows)) => rows,
        Some(Err(err)) => {
            warn!(error = %err, scope = "unit", "results fetch failed");
            Vec::new()
        }
        None => regional.clone(),
    };

    debug!(
        network = network.len(),
        regional = regional.len(),
        unit = unit.len(),
        "resolved scope rows"
    );

    ScopeRows {
        unit,
        regional,
        network,
    }
}

/// Rows behind the student and skill listings. A failed fetch is logged and
/// yields no rows.
pub async fn fetch_listing_rows<S>(
    source: &S,
    filters: &FilterSelection,
    page_size: usize,
) -> Vec<ResultRow>
where
    S: ResultSource + ?Sized,
{
    match fetch_with_unit_fallback(source, &filters.listing_query(), page_size).await {
        Ok(rows) => rows,
        Err(err) => {
            warn!(error = %err, "listing fetch failed");
            Vec::new()
        }
    }
}

pub fn semester_rows(rows: &[ResultRow], semester: &str) -> Vec<ResultRow> {
    rows.iter()
        .filter(|row| row.semester == semester)
        .cloned()
        .collect()
}

/// Both semester snapshots of one scope, compared second against first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScopePair {
    pub scope: Scope,
    pub first: ScopeSnapshot,
    pub second: ScopeSnapshot,
    pub trend: SnapshotTrend,
}

impl ScopePair {
    pub fn build(scope: Scope, rows: &[ResultRow], policy: TierPolicy) -> Self {
        let first = snapshot(&semester_rows(rows, "1"), policy);
        let second = snapshot(&semester_rows(rows, "2"), policy);
        Self {
            scope,
            first,
            second,
            trend: compare(&second, &first),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Overview {
    pub filters: FilterSelection,
    pub unit: ScopePair,
    pub regional: ScopePair,
    pub network: ScopePair,
}

impl Overview {
    pub fn build(filters: FilterSelection, rows: &ScopeRows, policy: TierPolicy) -> Self {
        Self {
            filters,
            unit: ScopePair::build(Scope::Unit, rows.rows(Scope::Unit), policy),
            regional: ScopePair::build(Scope::Regional, rows.rows(Scope::Regional), policy),
            network: ScopePair::build(Scope::Network, rows.rows(Scope::Network), policy),
        }
    }

    pub fn pairs(&self) -> [&ScopePair; 3] {
        [&self.unit, &self.regional, &self.network]
    }
}

/// Keeps only the result of the most recent load; a load that finishes after a
/// newer one has started is discarded.
#[derive(Debug)]
pub struct OverviewLoader {
    policy: TierPolicy,
    page_size: usize,
    generation: AtomicU64,
    latest: Mutex<Option<Overview>>,
}

impl OverviewLoader {
    pub fn new(policy: TierPolicy, page_size: usize) -> Self {
        Self {
            policy,
            page_size,
            generation: AtomicU64::new(0),
            latest: Mutex::new(None),
        }
    }

    pub fn begin(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Stores the overview if `token` is still the newest generation.
    pub fn commit(&self, token: u64, overview: Overview) -> bool {
        let Ok(mut latest) = self.latest.lock() else {
            return false;
        };
        if self.generation.load(Ordering::SeqCst) != token {
            debug!(token, "discarding stale overview");
            return false;
        }
        *latest = Some(overview);
        true
    }

    #[cfg(test)]
    pub fn latest(&self) -> Option<Overview> {
        self.latest.lock().ok().and_then(|latest| latest.clone())
    }

    /// Returns the overview with the rows it was built from, or `None` when a
    /// newer load superseded this one.
    pub async fn load<S>(
        &self,
        source: &S,
        filters: FilterSelection,
    ) -> Option<(Overview, ScopeRows)>
    where
        S: ResultSource + ?Sized,
    {
        let token = self.begin();
        let rows = resolve_rows(source, &filters, self.page_size).await;
        let overview = Overview::build(filters, &rows, self.policy);
        if self.commit(token, overview.clone()) {
            Some((overview, rows))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fake::{row, MemoryStore};
    use crate::store::UnitMatch;

    fn regional_row(
        name: &str,
        unit: &str,
        region: &str,
        semester: &str,
        correct: u32,
    ) -> ResultRow {
        let mut r = row(name, unit, semester, correct, 10);
        r.region = region.to_string();
        r
    }

    fn sample_store() -> MemoryStore {
        MemoryStore::new(vec![
            regional_row("Ana", "Colégio ABC", "CWB", "1", 2),
            regional_row("Ana", "Colégio ABC", "CWB", "2", 8),
            regional_row("Bia", "Colégio ABC", "CWB", "1", 5),
            regional_row("Bia", "Colégio ABC", "CWB", "2", 6),
            regional_row("Caio", "Colégio XYZ", "CWB", "1", 9),
            regional_row("Duda", "Escola Leste", "SJP", "1", 1),
            regional_row("Duda", "Escola Leste", "SJP", "2", 1),
        ])
    }

    #[test]
    fn sentinel_selectors_become_no_filter() {
        let filters = FilterSelection::new(Some("Todos"), Some(""), Some("Todas"), Some("all"))
            .with_semester(Some("todos"));
        assert_eq!(filters, FilterSelection::default());
        assert_eq!(filters.describe(), "toda a rede");
    }

    #[tokio::test]
    async fn unfiltered_scopes_fall_back_to_network() {
        let store = sample_store();
        let rows = resolve_rows(&store, &FilterSelection::default(), 100).await;
        assert_eq!(rows.network.len(), 7);
        assert_eq!(rows.regional, rows.network);
        assert_eq!(rows.unit, rows.network);
        assert_eq!(store.queries().len(), 1);
    }

    #[tokio::test]
    async fn region_without_unit_narrows_regional_and_unit() {
        let store = sample_store();
        let filters = FilterSelection::new(None, None, Some("SJP"), None);
        let rows = resolve_rows(&store, &filters, 100).await;
        assert_eq!(rows.network.len(), 7);
        assert_eq!(rows.regional.len(), 2);
        assert_eq!(rows.unit, rows.regional);
    }

    #[tokio::test]
    async fn unit_scope_uses_dedicated_fetch() {
        let store = sample_store();
        let filters =
            FilterSelection::new(Some("MT"), None, Some("CWB"), Some("Colégio ABC"));
        let rows = resolve_rows(&store, &filters, 100).await;
        assert_eq!(rows.unit.len(), 4);
        assert_eq!(rows.regional.len(), 5);

        let unit_queries: Vec<ResultQuery> = store
            .queries()
            .into_iter()
            .map(|(q, _)| q)
            .filter(|q| q.unit.is_some())
            .collect();
        assert_eq!(unit_queries.len(), 1);
        assert_eq!(unit_queries[0].region, None);
        assert_eq!(unit_queries[0].component.as_deref(), Some("MT"));
        assert_eq!(unit_queries[0].unit_match, UnitMatch::Exact);
    }

    #[tokio::test]
    async fn failed_fetch_degrades_to_empty_scopes() {
        let store = MemoryStore::failing();
        let filters = FilterSelection::new(None, None, None, Some("Colégio ABC"));
        let rows = resolve_rows(&store, &filters, 100).await;
        assert_eq!(rows, ScopeRows::default());

        let overview = Overview::build(filters, &rows, TierPolicy::Computed);
        assert_eq!(overview.network.first, ScopeSnapshot::default());
        assert_eq!(overview.unit.trend.deficient, None);
    }

    #[tokio::test]
    async fn overview_splits_semesters_per_scope() {
        let store = sample_store();
        let filters = FilterSelection::new(None, None, Some("CWB"), Some("Colégio ABC"));
        let rows = resolve_rows(&store, &filters, 100).await;
        let overview = Overview::build(filters, &rows, TierPolicy::Computed);

        // unit S1: Ana 20% deficient, Bia 50% intermediate; S2: Ana 80%, Bia 60%
        assert_eq!(overview.unit.first.counts.deficient, 1);
        assert_eq!(overview.unit.first.counts.intermediate, 1);
        assert_eq!(overview.unit.second.counts.adequate, 1);
        assert_eq!(overview.unit.second.counts.intermediate, 1);
        assert_eq!(overview.unit.trend.deficient.unwrap().to_string(), "+1");

        assert_eq!(overview.regional.first.counts.total(), 3);
        assert_eq!(overview.network.first.counts.total(), 4);
        assert_eq!(overview.network.second.counts.total(), 3);
        assert_eq!(overview.network.trend.population_delta, -1);
    }

    #[tokio::test]
    async fn repeated_loads_are_identical() {
        let store = sample_store();
        let loader = OverviewLoader::new(TierPolicy::Computed, 100);
        let filters = FilterSelection::new(None, None, Some("CWB"), None);
        let (first, first_rows) = loader.load(&store, filters.clone()).await.unwrap();
        let (second, second_rows) = loader.load(&store, filters).await.unwrap();
        assert_eq!(first_rows, second_rows);
        assert_eq!(first, second);
        assert_eq!(
            first.network.second.score.to_bits(),
            second.network.second.score.to_bits()
        );
    }

    #[tokio::test]
    async fn overview_ignores_semester_selector() {
        let store = sample_store();
        let filters = FilterSelection::new(None, None, Some("CWB"), None).with_semester(Some("2"));
        let rows = resolve_rows(&store, &filters, 100).await;
        assert_eq!(rows.network.len(), 7);
        assert!(store.queries().iter().all(|(q, _)| q.semester.is_none()));
    }

    #[tokio::test]
    async fn listing_rows_apply_every_selector() {
        let store = sample_store();
        let filters = FilterSelection::new(None, None, Some("CWB"), Some("Colégio - ABC"))
            .with_semester(Some("2"));
        assert_eq!(filters.describe(), "regional=CWB, unidade=Colégio - ABC, semestre=2");

        let rows = fetch_listing_rows(&store, &filters, 100).await;
        let names: Vec<&str> = rows.iter().map(|r| r.student_name.as_str()).collect();
        assert_eq!(names, vec!["Ana", "Bia"]);
        assert!(rows.iter().all(|r| r.semester == "2" && r.unit == "Colégio ABC"));
    }

    #[tokio::test]
    async fn listing_fetch_failure_yields_no_rows() {
        let store = MemoryStore::failing();
        let filters = FilterSelection::default().with_semester(Some("1"));
        assert!(fetch_listing_rows(&store, &filters, 100).await.is_empty());
    }

    #[test]
    fn stale_generation_does_not_overwrite_newer_result() {
        let loader = OverviewLoader::new(TierPolicy::Computed, 100);
        let rows = ScopeRows::default();
        let older = loader.begin();
        let newer = loader.begin();

        let newer_overview = Overview::build(
            FilterSelection::new(Some("LP"), None, None, None),
            &rows,
            TierPolicy::Computed,
        );
        let older_overview = Overview::build(
            FilterSelection::new(Some("MT"), None, None, None),
            &rows,
            TierPolicy::Computed,
        );

        assert!(loader.commit(newer, newer_overview.clone()));
        assert!(!loader.commit(older, older_overview));
        assert_eq!(loader.latest(), Some(newer_overview));
    }
}
