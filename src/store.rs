use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::models::ResultRow;
use crate::normalize::{clean_unit_name, normalize_unit_name};

pub const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnitMatch {
    #[default]
    Exact,
    /// Case-insensitive substring match on the unit name.
    Contains,
}

/// Equality filters for the results table; `None` means unfiltered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultQuery {
    pub component: Option<String>,
    pub school_year: Option<String>,
    pub region: Option<String>,
    pub unit: Option<String>,
    pub semester: Option<String>,
    pub student_name: Option<String>,
    pub unit_match: UnitMatch,
}

impl ResultQuery {
    fn with_unit(&self, unit: String, unit_match: UnitMatch) -> Self {
        Self {
            unit: Some(unit),
            unit_match,
            ..self.clone()
        }
    }
}

#[async_trait]
pub trait ResultSource: Send + Sync {
    async fn fetch_page(
        &self,
        query: &ResultQuery,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ResultRow>, StoreError>;
}

#[async_trait]
pub trait LinkSource: Send + Sync {
    async fn lookup_link(
        &self,
        skill_code: &str,
        component: &str,
    ) -> Result<Option<String>, StoreError>;
}

/// Pages through the store until a short page comes back.
pub async fn fetch_all<S>(
    source: &S,
    query: &ResultQuery,
    page_size: usize,
) -> Result<Vec<ResultRow>, StoreError>
where
    S: ResultSource + ?Sized,
{
    let page_size = page_size.max(1);
    let mut rows = Vec::new();
    let mut offset = 0;

    loop {
        let page = source.fetch_page(query, offset, page_size).await?;
        let fetched = page.len();
        debug!(offset, fetched, "fetched results page");
        rows.extend(page);
        if fetched < page_size {
            break;
        }
        offset += page_size;
    }

    Ok(rows)
}

/// Fetches rows, retrying unit filters that match nothing with progressively
/// looser forms of the unit name: cleaned, suffix-stripped, then substring.
pub async fn fetch_with_unit_fallback<S>(
    source: &S,
    query: &ResultQuery,
    page_size: usize,
) -> Result<Vec<ResultRow>, StoreError>
where
    S: ResultSource + ?Sized,
{
    let rows = fetch_all(source, query, page_size).await?;
    let Some(raw_unit) = query.unit.as_deref() else {
        return Ok(rows);
    };
    if !rows.is_empty() {
        return Ok(rows);
    }

    let cleaned = clean_unit_name(raw_unit);
    let stripped = normalize_unit_name(raw_unit);
    let mut tried = vec![raw_unit.to_string()];

    for candidate in [cleaned, stripped.clone()] {
        if tried.contains(&candidate) {
            continue;
        }
        debug!(unit = %candidate, "retrying unit filter");
        let exact = query.with_unit(candidate.clone(), UnitMatch::Exact);
        let rows = fetch_all(source, &exact, page_size).await?;
        if !rows.is_empty() {
            return Ok(rows);
        }
        tried.push(candidate);
    }

    debug!(unit = %stripped, "falling back to partial unit match");
    fetch_all(source, &query.with_unit(stripped, UnitMatch::Contains), page_size).await
}

/// Session cache of reference links keyed by skill code and component.
#[derive(Debug, Default)]
pub struct LinkCache {
    links: HashMap<(String, String), Option<String>>,
}

impl LinkCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a link, caching both hits and misses. Lookup failures are
    /// logged and not cached.
    pub async fn get<L>(&mut self, source: &L, skill_code: &str, component: &str) -> Option<String>
    where
        L: LinkSource + ?Sized,
    {
        let key = (skill_code.to_string(), component.to_string());
        if let Some(cached) = self.links.get(&key) {
            return cached.clone();
        }

        match source.lookup_link(skill_code, component).await {
            Ok(link) => {
                self.links.insert(key, link.clone());
                link
            }
            Err(err) => {
                warn!(skill_code, component, error = %err, "link lookup failed");
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::sync::Mutex;

    use super::*;

    /// In-memory results table that records every query it serves.
    #[derive(Default)]
    pub struct MemoryStore {
        pub rows: Vec<ResultRow>,
        pub queries: Mutex<Vec<(ResultQuery, usize)>>,
        pub fail: bool,
    }

    impl MemoryStore {
        pub fn new(rows: Vec<ResultRow>) -> Self {
            Self {
                rows,
                ..Self::default()
            }
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        pub fn queries(&self) -> Vec<(ResultQuery, usize)> {
            self.queries.lock().unwrap().clone()
        }

        fn matches(query: &ResultQuery, row: &ResultRow) -> bool {
            let eq = |filter: &Option<String>, value: &str| {
                filter.as_deref().map_or(true, |f| f == value)
            };
            let unit_ok = match (&query.unit, query.unit_match) {
                (None, _) => true,
                (Some(unit), UnitMatch::Exact) => &row.unit == unit,
                (Some(unit), UnitMatch::Contains) => {
                    row.unit.to_lowercase().contains(&unit.to_lowercase())
                }
            };
            unit_ok
                && eq(&query.component, &row.component)
                && eq(&query.school_year, &row.school_year)
                && eq(&query.region, &row.region)
                && eq(&query.semester, &row.semester)
                && eq(&query.student_name, &row.student_name)
        }
    }

    #[async_trait]
    impl ResultSource for MemoryStore {
        async fn fetch_page(
            &self,
            query: &ResultQuery,
            offset: usize,
            limit: usize,
        ) -> Result<Vec<ResultRow>, StoreError> {
            self.queries.lock().unwrap().push((query.clone(), offset));
            if self.fail {
                return Err(StoreError::Unavailable("memory store offline".to_string()));
            }
            Ok(self
                .rows
                .iter()
                .filter(|row| Self::matches(query, row))
                .skip(offset)
                .take(limit)
                .cloned()
                .collect())
        }
    }

    #[derive(Default)]
    pub struct MemoryLinks {
        pub links: HashMap<(String, String), String>,
        pub lookups: Mutex<usize>,
    }

    #[async_trait]
    impl LinkSource for MemoryLinks {
        async fn lookup_link(
            &self,
            skill_code: &str,
            component: &str,
        ) -> Result<Option<String>, StoreError> {
            *self.lookups.lock().unwrap() += 1;
            Ok(self
                .links
                .get(&(skill_code.to_string(), component.to_string()))
                .cloned())
        }
    }

    pub fn row(name: &str, unit: &str, semester: &str, correct: u32, total: u32) -> ResultRow {
        ResultRow {
            student_name: name.to_string(),
            class_group: "8A".to_string(),
            unit: unit.to_string(),
            region: "CWB".to_string(),
            school_year: "8º ano".to_string(),
            component: "MT".to_string(),
            semester: semester.to_string(),
            skill_id: "H01".to_string(),
            skill_code: "D01".to_string(),
            skill_description: "resolver problemas com frações".to_string(),
            evaluated: true,
            correct_count: correct,
            total_count: total,
            learning_level: None,
        }
    }
}
