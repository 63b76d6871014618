use anyhow::Result;
use sqlx::SqlitePool;

/// Creates the schema. Idempotent — safe to run on every startup.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Canonical repositories, deduplicated by (owner, name)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS repositories (
            id TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            language TEXT,
            stars INTEGER NOT NULL DEFAULT 0,
            last_commit INTEGER,
            archived INTEGER NOT NULL DEFAULT 0,
            dedup_hash TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(owner, name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Per-registry metadata and aggregate stats
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS registries (
            name TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT,
            source_repository TEXT,
            total_repos INTEGER NOT NULL DEFAULT 0,
            total_stars INTEGER NOT NULL DEFAULT 0,
            last_updated INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Registry-repository associations. repo_id is NULL for items that
    // carry no repository info (searchable, but excluded from facets/stats).
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS registry_items (
            id TEXT PRIMARY KEY,
            registry TEXT NOT NULL,
            repo_id TEXT,
            title TEXT NOT NULL,
            description TEXT,
            url TEXT,
            categories_json TEXT NOT NULL DEFAULT '[]',
            FOREIGN KEY (registry) REFERENCES registries(name),
            FOREIGN KEY (repo_id) REFERENCES repositories(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Denormalized facet tuples for filter-count queries
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS repo_facets (
            repo_id TEXT NOT NULL,
            registry TEXT NOT NULL,
            category TEXT NOT NULL,
            language TEXT,
            PRIMARY KEY (repo_id, registry, category)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexing run history
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_runs (
            id TEXT PRIMARY KEY,
            trigger_source TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER,
            total_registries INTEGER NOT NULL DEFAULT 0,
            processed_registries INTEGER NOT NULL DEFAULT 0,
            success_count INTEGER NOT NULL DEFAULT 0,
            failed_count INTEGER NOT NULL DEFAULT 0,
            current_registry TEXT,
            errors_json TEXT NOT NULL DEFAULT '[]',
            error_message TEXT,
            created_by TEXT,
            cancel_requested INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Singleton latest-status pointer, accessed by fixed key. Seeded to an
    // idle state so status lookups always have a row.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_latest (
            key TEXT PRIMARY KEY,
            run_id TEXT,
            status TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        "INSERT INTO index_latest (key, run_id, status, updated_at) VALUES ('latest', NULL, 'idle', ?) ON CONFLICT(key) DO NOTHING",
    )
    .bind(now)
    .execute(pool)
    .await?;

    // Indexes on the filter/join columns
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_registry_items_registry ON registry_items(registry)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_registry_items_repo ON registry_items(repo_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_repo_facets_registry ON repo_facets(registry)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_repo_facets_category ON repo_facets(category)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_index_runs_status ON index_runs(status)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_index_runs_started_at ON index_runs(started_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
