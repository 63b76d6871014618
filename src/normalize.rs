//! Registry normalizer.
//!
//! Converts one parsed registry document into relational upserts: canonical
//! repository rows (shared across registries), the registry's association
//! rows (rewritten wholesale), regenerated facet tuples, and recomputed
//! aggregate stats. All writes for a registry happen in one transaction so
//! no orphaned associations survive a completed run.

use anyhow::Result;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tracing::warn;
use uuid::Uuid;

use crate::models::{RawItem, RegistryDocument, RepoInfo, Section};

/// Counters reported back to the orchestrator for run logging.
#[derive(Debug, Default, Clone, Copy)]
pub struct NormalizeSummary {
    pub items_written: u64,
    pub repos_upserted: u64,
    pub items_skipped: u64,
}

/// One item flattened out of the section tree, tagged with its category.
struct FlatItem<'a> {
    title: &'a str,
    description: Option<&'a str>,
    url: Option<&'a str>,
    repo: Option<&'a RepoInfo>,
    category: &'a str,
}

/// Aggregated association for one repository within a registry. A
/// repository may appear under several category sections in one document.
struct RepoAssociation<'a> {
    repo: &'a RepoInfo,
    title: &'a str,
    description: Option<&'a str>,
    url: Option<&'a str>,
    categories: Vec<String>,
}

pub async fn normalize_registry(
    pool: &SqlitePool,
    registry: &str,
    doc: &RegistryDocument,
) -> Result<NormalizeSummary> {
    let mut summary = NormalizeSummary::default();

    let mut flat: Vec<FlatItem> = Vec::new();
    for section in &doc.sections {
        collect_items(section, registry, &mut flat, &mut summary.items_skipped);
    }

    // Aggregate repository-backed items by (owner, name), preserving the
    // order categories were encountered in. Items without repository info
    // are kept individually: indexed for display, excluded from facets
    // and stats.
    let mut assoc_order: Vec<String> = Vec::new();
    let mut associations: std::collections::HashMap<String, RepoAssociation> =
        std::collections::HashMap::new();
    let mut plain_items: Vec<&FlatItem> = Vec::new();

    for item in &flat {
        match item.repo {
            Some(repo) => {
                let key = format!("{}/{}", repo.owner, repo.name);
                let entry = associations.entry(key.clone()).or_insert_with(|| {
                    assoc_order.push(key);
                    RepoAssociation {
                        repo,
                        title: item.title,
                        description: item.description.or(repo.description.as_deref()),
                        url: item.url,
                        categories: Vec::new(),
                    }
                });
                if !entry.categories.iter().any(|c| c == item.category) {
                    entry.categories.push(item.category.to_string());
                }
            }
            None => plain_items.push(item),
        }
    }

    let now = chrono::Utc::now().timestamp();
    let mut tx = pool.begin().await?;

    // Supersede the previous run's rows for this registry.
    sqlx::query("DELETE FROM registry_items WHERE registry = ?")
        .bind(registry)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM repo_facets WHERE registry = ?")
        .bind(registry)
        .execute(&mut *tx)
        .await?;

    let mut total_stars: i64 = 0;

    for key in &assoc_order {
        let assoc = &associations[key];
        let repo_id = upsert_repository(&mut tx, assoc.repo, now).await?;
        summary.repos_upserted += 1;
        total_stars += assoc.repo.stars;

        let item_id = item_row_id(registry, assoc.title, assoc.url);
        sqlx::query(
            r#"
            INSERT INTO registry_items (id, registry, repo_id, title, description, url, categories_json)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&item_id)
        .bind(registry)
        .bind(&repo_id)
        .bind(assoc.title)
        .bind(assoc.description)
        .bind(assoc.url)
        .bind(serde_json::to_string(&assoc.categories)?)
        .execute(&mut *tx)
        .await?;
        summary.items_written += 1;

        // One facet row per repository x category, carrying language for
        // fast filter joins.
        for category in &assoc.categories {
            sqlx::query(
                r#"
                INSERT INTO repo_facets (repo_id, registry, category, language)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(repo_id, registry, category) DO NOTHING
                "#,
            )
            .bind(&repo_id)
            .bind(registry)
            .bind(category)
            .bind(assoc.repo.language.as_deref())
            .execute(&mut *tx)
            .await?;
        }
    }

    for item in &plain_items {
        let item_id = item_row_id(registry, item.title, item.url);
        let categories = vec![item.category.to_string()];
        sqlx::query(
            r#"
            INSERT INTO registry_items (id, registry, repo_id, title, description, url, categories_json)
            VALUES (?, ?, NULL, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&item_id)
        .bind(registry)
        .bind(item.title)
        .bind(item.description)
        .bind(item.url)
        .bind(serde_json::to_string(&categories)?)
        .execute(&mut *tx)
        .await?;
        summary.items_written += 1;
    }

    // Aggregate stats over the final association set (repo-backed only).
    let total_repos = assoc_order.len() as i64;
    sqlx::query(
        r#"
        INSERT INTO registries (name, title, description, source_repository, total_repos, total_stars, last_updated)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(name) DO UPDATE SET
            title = excluded.title,
            description = excluded.description,
            source_repository = excluded.source_repository,
            total_repos = excluded.total_repos,
            total_stars = excluded.total_stars,
            last_updated = excluded.last_updated
        "#,
    )
    .bind(registry)
    .bind(&doc.metadata.title)
    .bind(doc.metadata.description.as_deref())
    .bind(doc.metadata.source_repository.as_deref())
    .bind(total_repos)
    .bind(total_stars)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(summary)
}

/// Depth-first walk of the section tree. The section's own title is the
/// category label for items directly under it.
fn collect_items<'a>(
    section: &'a Section,
    registry: &str,
    out: &mut Vec<FlatItem<'a>>,
    skipped: &mut u64,
) {
    for item in &section.items {
        match item_title(item) {
            Some(title) => out.push(FlatItem {
                title,
                description: item.description.as_deref(),
                url: item.url.as_deref(),
                repo: item.repo.as_ref(),
                category: &section.title,
            }),
            None => {
                *skipped += 1;
                warn!(registry, section = %section.title, "skipping item without title");
            }
        }
    }
    for sub in &section.subsections {
        collect_items(sub, registry, out, skipped);
    }
}

fn item_title(item: &RawItem) -> Option<&str> {
    item.title.as_deref().filter(|t| !t.trim().is_empty())
}

/// Deterministic row id so re-normalizing unchanged input produces the
/// same association rows.
fn item_row_id(registry: &str, title: &str, url: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(registry.as_bytes());
    hasher.update([0u8]);
    hasher.update(title.as_bytes());
    hasher.update([0u8]);
    hasher.update(url.unwrap_or("").as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..32].to_string()
}

/// Upserts a canonical repository row keyed by (owner, name), inserting on
/// first sight and updating the mutable GitHub fields on subsequent sight,
/// regardless of which registry triggered the write.
async fn upsert_repository(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    repo: &RepoInfo,
    now: i64,
) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(repo.owner.as_bytes());
    hasher.update(repo.name.as_bytes());
    hasher.update(repo.stars.to_le_bytes());
    hasher.update(repo.description.as_deref().unwrap_or("").as_bytes());
    hasher.update(repo.language.as_deref().unwrap_or("").as_bytes());
    hasher.update(
        repo.last_commit
            .map(|t| t.timestamp())
            .unwrap_or(0)
            .to_le_bytes(),
    );
    hasher.update([repo.archived as u8]);
    let dedup_hash = format!("{:x}", hasher.finalize());

    let existing_id: Option<String> =
        sqlx::query_scalar("SELECT id FROM repositories WHERE owner = ? AND name = ?")
            .bind(&repo.owner)
            .bind(&repo.name)
            .fetch_optional(&mut **tx)
            .await?;

    let repo_id = existing_id.unwrap_or_else(|| Uuid::new_v4().to_string());

    sqlx::query(
        r#"
        INSERT INTO repositories (id, owner, name, description, language, stars, last_commit, archived, dedup_hash, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(owner, name) DO UPDATE SET
            description = excluded.description,
            language = excluded.language,
            stars = excluded.stars,
            last_commit = excluded.last_commit,
            archived = excluded.archived,
            dedup_hash = excluded.dedup_hash,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&repo_id)
    .bind(&repo.owner)
    .bind(&repo.name)
    .bind(repo.description.as_deref())
    .bind(repo.language.as_deref())
    .bind(repo.stars)
    .bind(repo.last_commit.map(|t| t.timestamp()))
    .bind(repo.archived)
    .bind(&dedup_hash)
    .bind(now)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    Ok(repo_id)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{RegistryDocMeta, RegistryDocument, RepoInfo, Section};
    use crate::{db, migrate};
    use sqlx::Row;

    pub fn repo(owner: &str, name: &str, stars: i64, language: &str, archived: bool) -> RepoInfo {
        RepoInfo {
            owner: owner.to_string(),
            name: name.to_string(),
            stars,
            description: Some(format!("{} description", name)),
            language: Some(language.to_string()),
            last_commit: None,
            archived,
        }
    }

    pub fn item(title: &str, repo_info: Option<RepoInfo>) -> RawItem {
        RawItem {
            title: Some(title.to_string()),
            description: Some(format!("{} item", title)),
            url: repo_info
                .as_ref()
                .map(|r| format!("https://github.com/{}/{}", r.owner, r.name)),
            repo: repo_info,
        }
    }

    pub fn document(title: &str, sections: Vec<Section>) -> RegistryDocument {
        RegistryDocument {
            metadata: RegistryDocMeta {
                name: None,
                title: title.to_string(),
                description: Some(format!("{} registry", title)),
                source_repository: None,
            },
            sections,
        }
    }

    pub fn section(title: &str, items: Vec<RawItem>) -> Section {
        Section {
            title: title.to_string(),
            items,
            subsections: Vec::new(),
        }
    }

    pub async fn test_pool() -> SqlitePool {
        let pool = db::connect_memory().await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        pool
    }

    async fn item_rows(pool: &SqlitePool, registry: &str) -> Vec<(String, Option<String>, String)> {
        sqlx::query(
            "SELECT id, repo_id, categories_json FROM registry_items WHERE registry = ? ORDER BY id",
        )
        .bind(registry)
        .fetch_all(pool)
        .await
        .unwrap()
        .iter()
        .map(|r| (r.get("id"), r.get("repo_id"), r.get("categories_json")))
        .collect()
    }

    #[tokio::test]
    async fn test_normalize_is_idempotent() {
        let pool = test_pool().await;
        let doc = document(
            "Awesome Go",
            vec![
                section(
                    "Web Frameworks",
                    vec![item("Gin", Some(repo("gin-gonic", "gin", 50000, "Go", false)))],
                ),
                section(
                    "Testing",
                    vec![item(
                        "Testify",
                        Some(repo("stretchr", "testify", 2000, "Go", false)),
                    )],
                ),
            ],
        );

        let first = normalize_registry(&pool, "go", &doc).await.unwrap();
        let rows_first = item_rows(&pool, "go").await;
        let second = normalize_registry(&pool, "go", &doc).await.unwrap();
        let rows_second = item_rows(&pool, "go").await;

        assert_eq!(first.items_written, 2);
        assert_eq!(second.items_written, 2);
        assert_eq!(rows_first, rows_second, "row sets must match across runs");

        let repo_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM repositories")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(repo_count, 2, "repositories must not be duplicated");
    }

    #[tokio::test]
    async fn test_removed_items_are_pruned() {
        let pool = test_pool().await;
        let full = document(
            "Awesome Go",
            vec![section(
                "Web Frameworks",
                vec![
                    item("Gin", Some(repo("gin-gonic", "gin", 50000, "Go", false))),
                    item("Echo", Some(repo("labstack", "echo", 8000, "Go", false))),
                ],
            )],
        );
        normalize_registry(&pool, "go", &full).await.unwrap();

        let trimmed = document(
            "Awesome Go",
            vec![section(
                "Web Frameworks",
                vec![item("Gin", Some(repo("gin-gonic", "gin", 50000, "Go", false)))],
            )],
        );
        normalize_registry(&pool, "go", &trimmed).await.unwrap();

        let items = item_rows(&pool, "go").await;
        assert_eq!(items.len(), 1, "removed association must not survive");

        let facet_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM repo_facets WHERE registry = 'go'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(facet_count, 1, "facets must be fully regenerated");
    }

    #[tokio::test]
    async fn test_repo_in_multiple_sections_collects_categories() {
        let pool = test_pool().await;
        let doc = document(
            "Awesome Go",
            vec![
                section(
                    "Web Frameworks",
                    vec![item("Gin", Some(repo("gin-gonic", "gin", 50000, "Go", false)))],
                ),
                section(
                    "HTTP Routers",
                    vec![item("Gin", Some(repo("gin-gonic", "gin", 50000, "Go", false)))],
                ),
            ],
        );
        normalize_registry(&pool, "go", &doc).await.unwrap();

        let items = item_rows(&pool, "go").await;
        assert_eq!(items.len(), 1, "one association per repository");
        let categories: Vec<String> = serde_json::from_str(&items[0].2).unwrap();
        assert_eq!(categories, vec!["Web Frameworks", "HTTP Routers"]);

        let facet_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM repo_facets WHERE registry = 'go'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(facet_count, 2, "one facet row per repository x category");
    }

    #[tokio::test]
    async fn test_untitled_item_skipped_not_fatal() {
        let pool = test_pool().await;
        let mut doc = document(
            "Awesome Go",
            vec![section(
                "Web Frameworks",
                vec![item("Gin", Some(repo("gin-gonic", "gin", 50000, "Go", false)))],
            )],
        );
        doc.sections[0].items.push(RawItem {
            title: None,
            description: Some("malformed".to_string()),
            url: None,
            repo: None,
        });

        let summary = normalize_registry(&pool, "go", &doc).await.unwrap();
        assert_eq!(summary.items_written, 1);
        assert_eq!(summary.items_skipped, 1);
    }

    #[tokio::test]
    async fn test_plain_item_indexed_but_not_faceted() {
        let pool = test_pool().await;
        let doc = document(
            "Awesome Go",
            vec![section(
                "Resources",
                vec![
                    item("Gin", Some(repo("gin-gonic", "gin", 50000, "Go", false))),
                    RawItem {
                        title: Some("Go Blog".to_string()),
                        description: Some("Official blog".to_string()),
                        url: Some("https://go.dev/blog".to_string()),
                        repo: None,
                    },
                ],
            )],
        );
        normalize_registry(&pool, "go", &doc).await.unwrap();

        let items = item_rows(&pool, "go").await;
        assert_eq!(items.len(), 2);
        assert_eq!(items.iter().filter(|(_, repo_id, _)| repo_id.is_none()).count(), 1);

        let facet_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM repo_facets WHERE registry = 'go'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(facet_count, 1, "repo-info-free items carry no facets");

        // Stats cover repo-backed items only
        let row = sqlx::query("SELECT total_repos, total_stars FROM registries WHERE name = 'go'")
            .fetch_one(&pool)
            .await
            .unwrap();
        let total_repos: i64 = row.get("total_repos");
        let total_stars: i64 = row.get("total_stars");
        assert_eq!(total_repos, 1);
        assert_eq!(total_stars, 50000);
    }

    #[tokio::test]
    async fn test_repository_shared_across_registries() {
        let pool = test_pool().await;
        let gin = || Some(repo("gin-gonic", "gin", 50000, "Go", false));
        let doc_a = document("Awesome Go", vec![section("Web", vec![item("Gin", gin())])]);
        let doc_b = document(
            "Awesome Web",
            vec![section("Backends", vec![item("Gin", gin())])],
        );

        normalize_registry(&pool, "go", &doc_a).await.unwrap();
        normalize_registry(&pool, "web", &doc_b).await.unwrap();

        let repo_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM repositories")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(repo_count, 1, "canonical row shared across registries");

        let item_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM registry_items")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(item_count, 2, "one association per registry");
    }

    #[tokio::test]
    async fn test_repository_fields_updated_on_resight() {
        let pool = test_pool().await;
        let doc_old = document(
            "Awesome Go",
            vec![section("Web", vec![item("Gin", Some(repo("gin-gonic", "gin", 100, "Go", false)))])],
        );
        normalize_registry(&pool, "go", &doc_old).await.unwrap();

        let doc_new = document(
            "Awesome Go",
            vec![section("Web", vec![item("Gin", Some(repo("gin-gonic", "gin", 50000, "Go", true)))])],
        );
        normalize_registry(&pool, "go", &doc_new).await.unwrap();

        let row = sqlx::query("SELECT stars, archived FROM repositories WHERE owner = 'gin-gonic'")
            .fetch_one(&pool)
            .await
            .unwrap();
        let stars: i64 = row.get("stars");
        let archived: bool = row.get("archived");
        assert_eq!(stars, 50000);
        assert!(archived);
    }
}
