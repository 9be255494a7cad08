//! SQLite-backed state store: open, schema, and job rows.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::types::JobRecord;

/// Handle to the state file. Cheap to clone; all clones share one pool.
///
/// WAL journaling is enabled so the single writer does not block readers;
/// all conditional transitions are single UPDATE statements.
#[derive(Clone)]
pub struct StateStore {
    pub(crate) pool: Pool<Sqlite>,
}

impl StateStore {
    /// Open (or create) the state file at `path` and run migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create output root {}", parent.display()))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .with_context(|| format!("open state file {}", path.display()))?;

        let store = StateStore { pool };
        store.migrate().await.context("migrate state file schema")?;
        Ok(store)
    }

    /// In-memory store for tests (single connection: a pool would hand back
    /// a different empty database per connection).
    pub async fn open_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = StateStore { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        // Three tables mirroring the data model: jobs, items, files.
        // `config_json` keeps the job config schema-flexible; file status
        // strings are the single source of truth for queue membership.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                output_root TEXT NOT NULL,
                config_json TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL REFERENCES jobs(id),
                identifier TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                last_error TEXT,
                UNIQUE(job_id, identifier)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                item_id INTEGER NOT NULL REFERENCES items(id),
                name TEXT NOT NULL,
                size INTEGER NOT NULL DEFAULT 0,
                checksum TEXT,
                dest_path TEXT NOT NULL,
                bytes_done INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                http_status INTEGER,
                UNIQUE(item_id, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_status ON files(status)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert the job row or refresh its config if it already exists.
    pub async fn upsert_job(
        &self,
        job_id: &str,
        output_root: &str,
        config_json: &str,
    ) -> Result<()> {
        let now = unix_timestamp();
        sqlx::query(
            r#"
            INSERT INTO jobs (id, output_root, config_json, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT(id) DO UPDATE SET
                config_json = excluded.config_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(job_id)
        .bind(output_root)
        .bind(config_json)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Load the job row, if one has been persisted.
    pub async fn load_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, output_root, config_json, created_at, updated_at
            FROM jobs
            WHERE id = ?1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| JobRecord {
            id: row.get("id"),
            output_root: row.get("output_root"),
            config_json: row.get("config_json"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }))
    }

    /// Bump the job's updated_at stamp (used when finalizing).
    pub async fn touch_job(&self, job_id: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET updated_at = ?1 WHERE id = ?2")
            .bind(unix_timestamp())
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

pub(crate) fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
