//! Query engine.
//!
//! Serves ranked, filtered, paginated searches against the cached index
//! snapshot, with a direct relational fallback when the index path fails.
//! Facet enumerations (categories, languages, registry metadata) bypass the
//! index entirely so filter dropdowns always reflect the store exactly.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::warn;

use crate::cache::SnapshotCache;
use crate::config::SearchConfig;
use crate::index::{get_or_create_search_index, SearchIndexSnapshot};
use crate::models::{RegistryMetadata, SearchDocument, SearchResultItem};

/// Recognized search options and their effects. Every filter is applied in
/// a fixed order: registry, category, language, min-stars, archived.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub registry: Option<String>,
    pub category: Option<String>,
    pub language: Option<String>,
    /// `Some(0)` filters nothing; it behaves like `None` on purpose.
    pub min_stars: Option<i64>,
    /// Archived entries are excluded unless explicitly included.
    pub include_archived: bool,
    pub limit: usize,
    /// Over-fetch factor for the text-index candidate pull.
    pub candidate_multiplier: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            registry: None,
            category: None,
            language: None,
            min_stars: None,
            include_archived: false,
            limit: 50,
            candidate_multiplier: 3,
        }
    }
}

fn doc_matches(doc: &SearchDocument, options: &SearchOptions) -> bool {
    if let Some(registry) = &options.registry {
        if &doc.registry != registry {
            return false;
        }
    }
    if let Some(category) = &options.category {
        if !doc.categories.iter().any(|c| c == category) {
            return false;
        }
    }
    if let Some(language) = &options.language {
        if doc.language.as_deref() != Some(language.as_str()) {
            return false;
        }
    }
    if let Some(min_stars) = options.min_stars {
        if doc.stars < min_stars {
            return false;
        }
    }
    if !options.include_archived && doc.archived {
        return false;
    }
    true
}

/// Ranked search over a snapshot.
///
/// A blank query skips the text index: the full document set is filtered
/// and truncated in stars-descending order (exact, no scoring). A non-blank
/// query pulls over-fetched candidates from the inverted index, filters
/// them in candidate order, and stops at the limit. Exhausting the
/// candidates before reaching the limit is a valid, final result; the
/// blank-query path is never used as a fallback.
pub fn flex_search(
    snapshot: &SearchIndexSnapshot,
    query: &str,
    options: &SearchOptions,
) -> Vec<SearchResultItem> {
    if query.trim().is_empty() {
        // Documents are stored stars-descending, so filter + truncate is
        // already exact.
        return snapshot
            .documents
            .iter()
            .filter(|doc| doc_matches(doc, options))
            .take(options.limit)
            .map(|doc| doc.clone().into_result(0.0))
            .collect();
    }

    let overfetch = options.limit.saturating_mul(options.candidate_multiplier.max(1));
    let candidates = snapshot.candidate_ids(query, overfetch);

    let mut results = Vec::new();
    for idx in candidates {
        let doc = &snapshot.documents[idx];
        if !doc_matches(doc, options) {
            continue;
        }
        results.push(doc.clone().into_result(1.0));
        if results.len() >= options.limit {
            break;
        }
    }
    results
}

/// Index-backed search with graceful degradation.
///
/// Any failure building or loading the snapshot is logged and surfaced as
/// `(empty, used_fallback = true)`; callers must treat that flag as a
/// signal to retry via [`db_search`] rather than trusting the empty result
/// as "no matches".
pub async fn server_search(
    pool: &SqlitePool,
    query: &str,
    options: &SearchOptions,
    cache: Option<&dyn SnapshotCache>,
    cache_ttl: Duration,
) -> (Vec<SearchResultItem>, bool) {
    match get_or_create_search_index(pool, cache, cache_ttl).await {
        Ok(snapshot) => (flex_search(&snapshot, query, options), false),
        Err(e) => {
            warn!(error = %e, "index search failed, signalling fallback");
            (Vec::new(), true)
        }
    }
}

/// Direct relational query used when the index path degrades.
pub async fn db_search(
    pool: &SqlitePool,
    query: &str,
    options: &SearchOptions,
) -> Result<Vec<SearchResultItem>> {
    let pattern = format!("%{}%", query.trim());
    let rows = sqlx::query(
        r#"
        SELECT i.id, i.registry, i.title, i.description, i.url, i.categories_json,
               r.language, COALESCE(r.stars, 0) AS stars, r.last_commit,
               COALESCE(r.archived, 0) AS archived
        FROM registry_items i
        LEFT JOIN repositories r ON r.id = i.repo_id
        WHERE (? = '%%' OR i.title LIKE ? OR i.description LIKE ?)
        ORDER BY COALESCE(r.stars, 0) DESC, i.title ASC
        "#,
    )
    .bind(&pattern)
    .bind(&pattern)
    .bind(&pattern)
    .fetch_all(pool)
    .await?;

    let mut results = Vec::new();
    for row in &rows {
        let categories_json: String = row.get("categories_json");
        let doc = SearchDocument {
            id: row.get("id"),
            registry: row.get("registry"),
            title: row.get("title"),
            description: row.get("description"),
            url: row.get("url"),
            categories: serde_json::from_str(&categories_json).unwrap_or_default(),
            language: row.get("language"),
            stars: row.get("stars"),
            last_commit: row.get("last_commit"),
            archived: row.get("archived"),
        };
        if !doc_matches(&doc, options) {
            continue;
        }
        results.push(doc.into_result(0.0));
        if results.len() >= options.limit {
            break;
        }
    }
    Ok(results)
}

// ============ Paginated query surface ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    Name,
    Stars,
    Updated,
}

/// Parameters of one paginated search request, as received by the HTTP
/// layer.
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub q: Option<String>,
    pub registry: Option<String>,
    pub category: Option<String>,
    pub language: Option<String>,
    /// Absent means "include everything"; `Some(false)` excludes archived.
    pub archived: Option<bool>,
    pub min_stars: Option<i64>,
    pub sort_by: Option<SortBy>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SearchPage {
    pub data: Vec<SearchResultItem>,
    pub total: usize,
    #[serde(rename = "hasMore")]
    pub has_more: bool,
    pub offset: usize,
    /// True when the relational fallback served this page instead of the
    /// index snapshot.
    #[serde(rename = "usedFallback")]
    pub used_fallback: bool,
}

const DEFAULT_PAGE_SIZE: usize = 20;

/// Runs one paginated search: index first, relational fallback when the
/// index path signals degradation, then sort and slice.
pub async fn search_page(
    pool: &SqlitePool,
    cache: Option<&dyn SnapshotCache>,
    search_config: &SearchConfig,
    request: &SearchQuery,
) -> Result<SearchPage> {
    let query = request.q.as_deref().unwrap_or("");
    // The engine-level default excludes archived entries; the HTTP contract
    // includes them unless the caller passes archived=false.
    let options = SearchOptions {
        registry: request.registry.clone(),
        category: request.category.clone(),
        language: request.language.clone(),
        min_stars: request.min_stars,
        include_archived: request.archived.unwrap_or(true),
        limit: search_config.max_results,
        candidate_multiplier: search_config.candidate_multiplier,
    };

    let ttl = Duration::from_secs(search_config.cache_ttl_secs);
    let (mut items, used_fallback) = server_search(pool, query, &options, cache, ttl).await;
    if used_fallback {
        items = db_search(pool, query, &options).await?;
    }

    match request.sort_by {
        Some(SortBy::Name) => {
            items.sort_by(|a, b| a.title.to_lowercase().cmp(&b.title.to_lowercase()));
        }
        Some(SortBy::Stars) => items.sort_by(|a, b| b.stars.cmp(&a.stars)),
        Some(SortBy::Updated) => {
            items.sort_by(|a, b| b.last_commit.unwrap_or(0).cmp(&a.last_commit.unwrap_or(0)));
        }
        // Blank queries arrive stars-descending, text queries in candidate
        // order; both stand as-is.
        None => {}
    }

    let total = items.len();
    let offset = request.offset.unwrap_or(0);
    let limit = request.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    let data: Vec<SearchResultItem> = items.into_iter().skip(offset).take(limit).collect();
    let has_more = offset + data.len() < total;

    Ok(SearchPage {
        data,
        total,
        has_more,
        offset,
        used_fallback,
    })
}

// ============ Facet enumeration ============

#[derive(Debug, Serialize)]
pub struct CategoryCount {
    pub category: String,
    pub count: i64,
    pub key: String,
    pub registry: String,
}

fn category_key(registry: &str, category: &str) -> String {
    let slug: String = category
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    format!("{}:{}", registry, slug.trim_matches('-'))
}

/// Grouped facet counts, straight from the store. Never cached: these back
/// filter-dropdown population and must reflect current rows exactly.
pub async fn list_categories(
    pool: &SqlitePool,
    registry: Option<&str>,
) -> Result<Vec<CategoryCount>> {
    let rows = match registry {
        Some(registry) => {
            sqlx::query(
                r#"
                SELECT registry, category, COUNT(*) AS count
                FROM repo_facets
                WHERE registry = ?
                GROUP BY registry, category
                ORDER BY count DESC, category ASC
                "#,
            )
            .bind(registry)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(
                r#"
                SELECT registry, category, COUNT(*) AS count
                FROM repo_facets
                GROUP BY registry, category
                ORDER BY count DESC, category ASC
                "#,
            )
            .fetch_all(pool)
            .await?
        }
    };

    Ok(rows
        .iter()
        .map(|row| {
            let registry: String = row.get("registry");
            let category: String = row.get("category");
            let key = category_key(&registry, &category);
            CategoryCount {
                category,
                count: row.get("count"),
                key,
                registry,
            }
        })
        .collect())
}

pub async fn list_languages(pool: &SqlitePool, registry: Option<&str>) -> Result<Vec<String>> {
    let rows = match registry {
        Some(registry) => {
            sqlx::query_scalar::<_, String>(
                r#"
                SELECT DISTINCT language FROM repo_facets
                WHERE language IS NOT NULL AND registry = ?
                ORDER BY language ASC
                "#,
            )
            .bind(registry)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_scalar::<_, String>(
                "SELECT DISTINCT language FROM repo_facets WHERE language IS NOT NULL ORDER BY language ASC",
            )
            .fetch_all(pool)
            .await?
        }
    };
    Ok(rows)
}

pub async fn list_registry_metadata(pool: &SqlitePool) -> Result<Vec<RegistryMetadata>> {
    let rows = sqlx::query(
        r#"
        SELECT name, title, description, source_repository, total_repos, total_stars, last_updated
        FROM registries
        ORDER BY name ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| RegistryMetadata {
            name: row.get("name"),
            title: row.get("title"),
            description: row.get("description"),
            source_repository: row.get("source_repository"),
            total_repos: row.get("total_repos"),
            total_stars: row.get("total_stars"),
            last_updated: row.get("last_updated"),
        })
        .collect())
}
