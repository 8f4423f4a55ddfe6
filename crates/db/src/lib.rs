//! SQLite-backed persistent state store.
//!
//! Only the current leader holds a store open. The database lives on the
//! node's local disk; a periodic snapshot is copied to the shared
//! filesystem so the next leader can restore it after a failover.
//!
//! Uses WAL journaling for crash safety and `VACUUM INTO` for atomic
//! whole-database snapshots that never block writers.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

pub mod models;
pub mod repositories;

/// Pool handle alias used across the workspace.
pub type DbPool = SqlitePool;

/// Maximum pooled connections. WAL gives us concurrent readers with a
/// single writer, which matches the dispatch engine's access pattern.
const MAX_CONNECTIONS: u32 = 4;

/// Open (or create) the store at `path` and ensure the schema exists.
pub async fn open(path: &Path) -> Result<DbPool, sqlx::Error> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(sqlx::Error::Io)?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await?;

    create_schema(&pool).await?;
    tracing::info!(path = %path.display(), "State store opened");
    Ok(pool)
}

/// Copy the snapshot from the shared filesystem to `local_path` and open it.
///
/// Returns `Err` if the copy or the open fails; callers fall back to a
/// fresh store.
pub async fn restore_from(snapshot_path: &Path, local_path: &Path) -> Result<DbPool, sqlx::Error> {
    if let Some(parent) = local_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(sqlx::Error::Io)?;
    }
    // Remove any stale WAL sidecar files from a previous leadership stint
    // so the restored snapshot is opened exactly as copied.
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = local_path.as_os_str().to_owned();
        sidecar.push(suffix);
        let _ = tokio::fs::remove_file(Path::new(&sidecar)).await;
    }
    tokio::fs::copy(snapshot_path, local_path)
        .await
        .map_err(sqlx::Error::Io)?;
    open(local_path).await
}

/// Write an atomic whole-database copy to `dest`.
///
/// `VACUUM INTO` produces a consistent snapshot without blocking other
/// connections. The destination must not exist, so any previous file at
/// `dest` is removed first.
pub async fn snapshot_to(pool: &DbPool, dest: &Path) -> Result<(), sqlx::Error> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(sqlx::Error::Io)?;
    }
    let _ = tokio::fs::remove_file(dest).await;

    // VACUUM does not accept bound parameters; escape single quotes in the
    // path instead.
    let escaped = dest.to_string_lossy().replace('\'', "''");
    sqlx::query(&format!("VACUUM INTO '{escaped}'"))
        .execute(pool)
        .await?;
    Ok(())
}

/// Cheap connectivity check used at startup and in tests.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(pool)
        .await?;
    Ok(())
}

async fn create_schema(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS jobs (
            job_id TEXT PRIMARY KEY,
            manifest_json TEXT NOT NULL,
            current_state TEXT NOT NULL DEFAULT 'active',
            priority INTEGER NOT NULL DEFAULT 50,
            submitted_at_ms INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS chunks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT NOT NULL REFERENCES jobs(job_id) ON DELETE CASCADE,
            frame_start INTEGER NOT NULL,
            frame_end INTEGER NOT NULL,
            state TEXT NOT NULL DEFAULT 'pending',
            assigned_to TEXT,
            assigned_at_ms INTEGER,
            completed_at_ms INTEGER,
            retry_count INTEGER NOT NULL DEFAULT 0,
            completed_frames TEXT NOT NULL DEFAULT '[]',
            failed_on TEXT NOT NULL DEFAULT '[]'
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_job ON chunks(job_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_state ON chunks(state)")
        .execute(pool)
        .await?;

    Ok(())
}
