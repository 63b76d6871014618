//! Indexing run orchestration.
//!
//! Coordinates a full indexing run: fetch all registry documents, normalize
//! them sequentially with per-registry error isolation, keep run bookkeeping
//! (history rows plus the singleton latest pointer) current for progress
//! polling, and invalidate the search index after a successful run.
//!
//! Run state machine: `running -> completed | failed`. Terminal states are
//! final; a retry is a new run. At most one run may be `running` at a time;
//! concurrent triggers are rejected, not queued.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::SnapshotCache;
use crate::error::IndexError;
use crate::fetch::RegistrySource;
use crate::index::invalidate_search_index;
use crate::models::{IndexRun, RunStatus, TriggerSource};
use crate::normalize::normalize_registry;

/// Executes one indexing run end to end: claims the run slot, then runs it.
///
/// Registries are processed strictly sequentially to bound write contention
/// on the store (registries share repository rows). One registry's failure
/// is recorded on the run and never aborts it; only discovery-level failure
/// marks the run `failed` and re-throws so a queue consumer would not ack
/// the triggering message.
pub async fn run_indexing(
    pool: &SqlitePool,
    source: &dyn RegistrySource,
    cache: Option<&dyn SnapshotCache>,
    trigger: TriggerSource,
    created_by: Option<String>,
) -> Result<IndexRun> {
    let run_id = begin_run(pool, trigger, created_by.as_deref()).await?;
    execute_run(pool, &run_id, source, cache).await
}

/// Atomically claims the single running-run slot.
///
/// The guarded insert only lands when no run row is `running`, so any
/// number of concurrent triggers resolve to exactly one new run; the rest
/// fail with [`IndexError::RunActive`]. The latest pointer moves in the
/// same transaction as the row it mirrors.
pub async fn begin_run(
    pool: &SqlitePool,
    trigger: TriggerSource,
    created_by: Option<&str>,
) -> Result<String> {
    let run_id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp();

    let mut tx = pool.begin().await?;
    let inserted = sqlx::query(
        r#"
        INSERT INTO index_runs (id, trigger_source, status, started_at, created_by)
        SELECT ?, ?, 'running', ?, ?
        WHERE NOT EXISTS (SELECT 1 FROM index_runs WHERE status = 'running')
        "#,
    )
    .bind(&run_id)
    .bind(trigger.as_str())
    .bind(now)
    .bind(created_by)
    .execute(&mut *tx)
    .await?;
    if inserted.rows_affected() == 0 {
        return Err(IndexError::RunActive.into());
    }
    update_latest(&mut tx, Some(&run_id), RunStatus::Running.as_str()).await?;
    tx.commit().await?;

    info!(run_id = %run_id, trigger = trigger.as_str(), "indexing run started");
    Ok(run_id)
}

/// Runs an already-claimed run to a terminal state.
pub async fn execute_run(
    pool: &SqlitePool,
    run_id: &str,
    source: &dyn RegistrySource,
    cache: Option<&dyn SnapshotCache>,
) -> Result<IndexRun> {
    let documents = match source.fetch_registry_files().await {
        Ok(documents) => documents,
        Err(e) => {
            error!(run_id = %run_id, error = %e, "registry discovery failed");
            finalize_run(pool, run_id, RunStatus::Failed, Some(&e.to_string())).await?;
            return Err(e);
        }
    };

    let total = documents.len() as i64;
    sqlx::query("UPDATE index_runs SET total_registries = ? WHERE id = ?")
        .bind(total)
        .bind(run_id)
        .execute(pool)
        .await?;

    let mut processed: i64 = 0;
    let mut success: i64 = 0;
    let mut failed: i64 = 0;
    let mut errors: Vec<String> = Vec::new();
    let mut cancelled = false;

    for (name, doc) in &documents {
        // Cooperative cancellation between registries; an in-flight
        // registry is allowed to finish, completed data stays.
        if stop_requested(pool, run_id).await? {
            warn!(run_id = %run_id, "stop requested, cancelling run");
            cancelled = true;
            break;
        }

        sqlx::query("UPDATE index_runs SET current_registry = ? WHERE id = ?")
            .bind(name)
            .bind(run_id)
            .execute(pool)
            .await?;

        match normalize_registry(pool, name, doc).await {
            Ok(summary) => {
                success += 1;
                info!(
                    run_id = %run_id,
                    registry = %name,
                    items = summary.items_written,
                    repos = summary.repos_upserted,
                    skipped = summary.items_skipped,
                    "registry indexed"
                );
            }
            Err(e) => {
                failed += 1;
                errors.push(format!("{}: {}", name, e));
                warn!(run_id = %run_id, registry = %name, error = %e, "registry failed, continuing");
            }
        }
        processed += 1;

        // Progress counters are visible mid-run for status polling.
        sqlx::query(
            r#"
            UPDATE index_runs
            SET processed_registries = ?, success_count = ?, failed_count = ?, errors_json = ?
            WHERE id = ?
            "#,
        )
        .bind(processed)
        .bind(success)
        .bind(failed)
        .bind(serde_json::to_string(&errors)?)
        .bind(run_id)
        .execute(pool)
        .await?;
    }

    // Partial registry failures are recorded in the counters and error
    // list; they do not fail the run.
    let (status, error_message) = if cancelled {
        (RunStatus::Failed, Some(IndexError::Cancelled.to_string()))
    } else {
        (RunStatus::Completed, None)
    };
    finalize_run(pool, run_id, status, error_message.as_deref()).await?;

    if status == RunStatus::Completed {
        invalidate_search_index(cache).await;
        info!(
            run_id = %run_id,
            processed,
            success,
            failed,
            "indexing run completed"
        );
    }

    get_run(pool, run_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("run row vanished: {}", run_id))
}

async fn stop_requested(pool: &SqlitePool, run_id: &str) -> Result<bool> {
    let flag: i64 = sqlx::query_scalar("SELECT cancel_requested FROM index_runs WHERE id = ?")
        .bind(run_id)
        .fetch_one(pool)
        .await?;
    Ok(flag != 0)
}

/// Finalizes a run exactly once; terminal rows are never resurrected. The
/// run row and the latest pointer change in one transaction, so a status
/// poller never sees them disagree.
async fn finalize_run(
    pool: &SqlitePool,
    run_id: &str,
    status: RunStatus,
    error_message: Option<&str>,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let mut tx = pool.begin().await?;
    let updated = sqlx::query(
        r#"
        UPDATE index_runs
        SET status = ?, finished_at = ?, error_message = ?, current_registry = NULL
        WHERE id = ? AND status = 'running'
        "#,
    )
    .bind(status.as_str())
    .bind(now)
    .bind(error_message)
    .bind(run_id)
    .execute(&mut *tx)
    .await?;
    if updated.rows_affected() > 0 {
        update_latest(&mut tx, Some(run_id), status.as_str()).await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Upserts the singleton latest-status row by its fixed key, inside the
/// caller's transaction.
async fn update_latest(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    run_id: Option<&str>,
    status: &str,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO index_latest (key, run_id, status, updated_at)
        VALUES ('latest', ?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET
            run_id = excluded.run_id,
            status = excluded.status,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(run_id)
    .bind(status)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Requests cancellation of the active run, if any. Returns whether a
/// running run was flagged.
pub async fn request_stop(pool: &SqlitePool) -> Result<bool> {
    let result = sqlx::query("UPDATE index_runs SET cancel_requested = 1 WHERE status = 'running'")
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

fn run_from_row(row: &sqlx::sqlite::SqliteRow) -> IndexRun {
    let status_str: String = row.get("status");
    let errors_json: String = row.get("errors_json");
    IndexRun {
        id: row.get("id"),
        trigger_source: row.get("trigger_source"),
        status: RunStatus::parse(&status_str).unwrap_or(RunStatus::Failed),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        total_registries: row.get("total_registries"),
        processed_registries: row.get("processed_registries"),
        success_count: row.get("success_count"),
        failed_count: row.get("failed_count"),
        current_registry: row.get("current_registry"),
        errors: serde_json::from_str(&errors_json).unwrap_or_default(),
        error_message: row.get("error_message"),
        created_by: row.get("created_by"),
    }
}

pub async fn get_run(pool: &SqlitePool, run_id: &str) -> Result<Option<IndexRun>> {
    let row = sqlx::query("SELECT * FROM index_runs WHERE id = ?")
        .bind(run_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(run_from_row))
}

/// Current status snapshot: the singleton pointer plus its referenced run.
pub async fn latest_status(pool: &SqlitePool) -> Result<(String, Option<IndexRun>)> {
    let row = sqlx::query("SELECT run_id, status FROM index_latest WHERE key = 'latest'")
        .fetch_one(pool)
        .await?;
    let status: String = row.get("status");
    let run_id: Option<String> = row.get("run_id");

    let run = match run_id {
        Some(id) => get_run(pool, &id).await?,
        None => None,
    };
    Ok((status, run))
}

/// Past runs, most recent first.
pub async fn list_runs(pool: &SqlitePool, limit: i64, offset: i64) -> Result<Vec<IndexRun>> {
    let rows = sqlx::query("SELECT * FROM index_runs ORDER BY started_at DESC LIMIT ? OFFSET ?")
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(run_from_row).collect())
}
