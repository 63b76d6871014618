//! Database connection.
//!
//! One shared SQLite pool backs the indexer and the read surface. WAL mode
//! lets searches read while a normalizer transaction writes; the busy
//! timeout covers the remaining write-lock contention between run
//! bookkeeping and registry transactions.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::config::Config;

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db = &config.db;

    // First connect creates the data directory along with the file.
    if let Some(parent) = db.path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db.path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(db.busy_timeout_secs));

    let pool = SqlitePoolOptions::new()
        .max_connections(db.max_connections)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// In-memory pool for tests. Single connection: in-memory SQLite databases
/// are per-connection, so a larger pool would see empty schemas.
#[cfg(test)]
pub async fn connect_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_applies_db_config() {
        let tmp = tempfile::tempdir().unwrap();
        let config: Config = toml::from_str(&format!(
            r#"[db]
path = "{}/nested/data/awix.sqlite"
max_connections = 2
busy_timeout_secs = 1

[server]
bind = "127.0.0.1:0"
"#,
            tmp.path().display()
        ))
        .unwrap();

        let pool = connect(&config).await.unwrap();
        sqlx::query("SELECT 1").execute(&pool).await.unwrap();
        assert!(tmp.path().join("nested/data/awix.sqlite").exists());
        assert_eq!(pool.options().get_max_connections(), 2);
    }
}
