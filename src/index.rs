//! Search index builder and snapshot cache.
//!
//! The index is a derived, non-authoritative projection: registry items
//! (plus their repositories) flattened into search documents with a
//! tokenized inverted index over title, description, categories, and
//! language. Snapshots are versioned; a cached snapshot whose version tag
//! differs from the current one is discarded, never partially trusted.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use crate::cache::{SnapshotCache, SEARCH_INDEX_KEY};
use crate::models::SearchDocument;

/// Bumped whenever the snapshot layout changes; stale cache entries are
/// then treated as absent.
pub const SNAPSHOT_VERSION: u32 = 2;

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchIndexSnapshot {
    pub version: u32,
    pub built_at: i64,
    pub documents: Vec<SearchDocument>,
    /// token -> indices into `documents`, ascending.
    pub postings: HashMap<String, Vec<usize>>,
}

impl SearchIndexSnapshot {
    /// Candidate document indices for a text query, best-first.
    ///
    /// A document is a candidate when any query token prefix-matches one of
    /// its index tokens. Candidates are ordered by matched-token count,
    /// ties broken by document order (documents are stored stars-descending,
    /// so the tie-break favors more popular entries). Deterministic.
    pub fn candidate_ids(&self, query: &str, max: usize) -> Vec<usize> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() {
            return Vec::new();
        }

        let mut match_counts: HashMap<usize, usize> = HashMap::new();
        for token in &query_tokens {
            for (term, ids) in &self.postings {
                if term.starts_with(token.as_str()) {
                    for id in ids {
                        *match_counts.entry(*id).or_insert(0) += 1;
                    }
                }
            }
        }

        let mut candidates: Vec<(usize, usize)> = match_counts.into_iter().collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        candidates.truncate(max);
        candidates.into_iter().map(|(id, _)| id).collect()
    }
}

/// Lowercased alphanumeric tokens, deduplicated, order preserved.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    for raw in text.split(|c: char| !c.is_alphanumeric()) {
        if raw.is_empty() {
            continue;
        }
        let token = raw.to_lowercase();
        if !tokens.contains(&token) {
            tokens.push(token);
        }
    }
    tokens
}

/// Builds a fresh snapshot from the relational store.
///
/// Documents are ordered stars-descending so blank-query truncation and
/// candidate tie-breaks are exact without re-sorting the whole set.
pub async fn build_search_index(pool: &SqlitePool) -> Result<SearchIndexSnapshot> {
    let rows = sqlx::query(
        r#"
        SELECT i.id, i.registry, i.title, i.description, i.url, i.categories_json,
               r.language, COALESCE(r.stars, 0) AS stars, r.last_commit,
               COALESCE(r.archived, 0) AS archived
        FROM registry_items i
        LEFT JOIN repositories r ON r.id = i.repo_id
        ORDER BY COALESCE(r.stars, 0) DESC, i.title ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut documents: Vec<SearchDocument> = Vec::with_capacity(rows.len());
    for row in &rows {
        let categories_json: String = row.get("categories_json");
        let categories: Vec<String> = serde_json::from_str(&categories_json).unwrap_or_default();
        documents.push(SearchDocument {
            id: row.get("id"),
            registry: row.get("registry"),
            title: row.get("title"),
            description: row.get("description"),
            url: row.get("url"),
            categories,
            language: row.get("language"),
            stars: row.get("stars"),
            last_commit: row.get("last_commit"),
            archived: row.get("archived"),
        });
    }

    let mut postings: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, doc) in documents.iter().enumerate() {
        let mut text = doc.title.clone();
        if let Some(desc) = &doc.description {
            text.push(' ');
            text.push_str(desc);
        }
        for category in &doc.categories {
            text.push(' ');
            text.push_str(category);
        }
        if let Some(language) = &doc.language {
            text.push(' ');
            text.push_str(language);
        }

        for token in tokenize(&text) {
            postings.entry(token).or_default().push(idx);
        }
    }

    debug!(documents = documents.len(), terms = postings.len(), "search index built");

    Ok(SearchIndexSnapshot {
        version: SNAPSHOT_VERSION,
        built_at: chrono::Utc::now().timestamp(),
        documents,
        postings,
    })
}

/// Returns the cached snapshot when present and current, rebuilding
/// otherwise.
///
/// Cache misbehavior never fails the caller: a read failure or a version
/// mismatch is treated as a miss, and a write failure after rebuild is
/// logged and swallowed.
pub async fn get_or_create_search_index(
    pool: &SqlitePool,
    cache: Option<&dyn SnapshotCache>,
    ttl: Duration,
) -> Result<SearchIndexSnapshot> {
    if let Some(cache) = cache {
        match cache.get(SEARCH_INDEX_KEY).await {
            Ok(Some(serialized)) => match serde_json::from_str::<SearchIndexSnapshot>(&serialized)
            {
                Ok(snapshot) if snapshot.version == SNAPSHOT_VERSION => return Ok(snapshot),
                Ok(snapshot) => {
                    debug!(
                        cached = snapshot.version,
                        expected = SNAPSHOT_VERSION,
                        "discarding cached snapshot with stale version"
                    );
                }
                Err(e) => warn!(error = %e, "cached snapshot unreadable, rebuilding"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "snapshot cache read failed, rebuilding"),
        }
    }

    let snapshot = build_search_index(pool).await?;

    if let Some(cache) = cache {
        match serde_json::to_string(&snapshot) {
            Ok(serialized) => {
                if let Err(e) = cache.put(SEARCH_INDEX_KEY, serialized, ttl).await {
                    warn!(error = %e, "snapshot cache write failed");
                }
            }
            Err(e) => warn!(error = %e, "snapshot serialization failed"),
        }
    }

    Ok(snapshot)
}

/// Deletes the cached snapshot so the next query rebuilds from fresh rows.
/// No-op without a cache collaborator.
pub async fn invalidate_search_index(cache: Option<&dyn SnapshotCache>) {
    if let Some(cache) = cache {
        if let Err(e) = cache.delete(SEARCH_INDEX_KEY).await {
            warn!(error = %e, "snapshot cache invalidation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::normalize::tests::{document, item, repo, section, test_pool};
    use crate::normalize::normalize_registry;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingCache;

    #[async_trait]
    impl SnapshotCache for FailingCache {
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            anyhow::bail!("cache down")
        }
        async fn put(&self, _key: &str, _value: String, _ttl: Duration) -> Result<()> {
            anyhow::bail!("cache down")
        }
        async fn delete(&self, _key: &str) -> Result<()> {
            anyhow::bail!("cache down")
        }
    }

    /// MemoryCache wrapper that counts writes.
    #[derive(Default)]
    struct CountingCache {
        inner: MemoryCache,
        puts: AtomicUsize,
    }

    #[async_trait]
    impl SnapshotCache for CountingCache {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }
        async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            self.inner.put(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }
    }

    async fn seeded_pool() -> sqlx::SqlitePool {
        let pool = test_pool().await;
        let doc = document(
            "Awesome Go",
            vec![section(
                "Web Frameworks",
                vec![
                    item("Gin", Some(repo("gin-gonic", "gin", 50000, "Go", false))),
                    item("Echo", Some(repo("labstack", "echo", 8000, "Go", false))),
                ],
            )],
        );
        normalize_registry(&pool, "go", &doc).await.unwrap();
        pool
    }

    #[test]
    fn test_tokenize_splits_and_dedupes() {
        assert_eq!(tokenize("Gin — HTTP web framework (HTTP)"), vec!["gin", "http", "web", "framework"]);
        assert!(tokenize("  ---  ").is_empty());
    }

    #[tokio::test]
    async fn test_build_orders_documents_by_stars() {
        let pool = seeded_pool().await;
        let snapshot = build_search_index(&pool).await.unwrap();
        assert_eq!(snapshot.version, SNAPSHOT_VERSION);
        assert_eq!(snapshot.documents.len(), 2);
        assert_eq!(snapshot.documents[0].title, "Gin");
        assert_eq!(snapshot.documents[1].title, "Echo");
    }

    #[tokio::test]
    async fn test_candidates_prefix_match_and_rank() {
        let pool = seeded_pool().await;
        let snapshot = build_search_index(&pool).await.unwrap();

        let ids = snapshot.candidate_ids("frame", 10);
        assert_eq!(ids.len(), 2, "prefix should match 'framework'");

        let ids = snapshot.candidate_ids("echo", 10);
        assert_eq!(ids.len(), 1);
        assert_eq!(snapshot.documents[ids[0]].title, "Echo");

        assert!(snapshot.candidate_ids("zzz", 10).is_empty());
    }

    #[tokio::test]
    async fn test_stale_version_is_discarded() {
        let pool = seeded_pool().await;
        let cache = MemoryCache::new();

        let mut stale = build_search_index(&pool).await.unwrap();
        stale.version = SNAPSHOT_VERSION - 1;
        stale.documents.clear();
        cache
            .put(
                SEARCH_INDEX_KEY,
                serde_json::to_string(&stale).unwrap(),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let snapshot = get_or_create_search_index(&pool, Some(&cache), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(snapshot.version, SNAPSHOT_VERSION);
        assert_eq!(snapshot.documents.len(), 2, "stale snapshot must be rebuilt, not trusted");
    }

    #[tokio::test]
    async fn test_cache_failures_degrade_gracefully() {
        let pool = seeded_pool().await;
        let snapshot =
            get_or_create_search_index(&pool, Some(&FailingCache), Duration::from_secs(60))
                .await
                .unwrap();
        assert_eq!(snapshot.documents.len(), 2);

        // Invalidation against a failing cache is also non-fatal.
        invalidate_search_index(Some(&FailingCache)).await;
    }

    #[tokio::test]
    async fn test_invalidate_then_query_rebuilds_once() {
        let pool = seeded_pool().await;
        let cache = CountingCache::default();

        get_or_create_search_index(&pool, Some(&cache), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.puts.load(Ordering::SeqCst), 1);

        // Cache hit: no extra write.
        get_or_create_search_index(&pool, Some(&cache), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.puts.load(Ordering::SeqCst), 1);

        invalidate_search_index(Some(&cache)).await;
        get_or_create_search_index(&pool, Some(&cache), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.puts.load(Ordering::SeqCst), 2, "exactly one rebuild after invalidation");
    }
}
