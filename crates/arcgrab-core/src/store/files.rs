//! Item and file rows: enumeration, claim/release, checkpoints, aggregates.

use anyhow::Result;
use sqlx::Row;

use super::db::StateStore;
use super::types::{
    FileId, FileRecord, FileStatus, FileUpdate, ItemId, ItemRecord, ItemStatus, NewFile,
    ProgressCounts,
};

impl StateStore {
    /// Register an identifier for the job. Already-known identifiers are
    /// left untouched (resume re-reads the same list).
    pub async fn add_item(&self, job_id: &str, identifier: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO items (job_id, identifier, status)
            VALUES (?1, ?2, 'pending')
            ON CONFLICT(job_id, identifier) DO NOTHING
            "#,
        )
        .bind(job_id)
        .bind(identifier)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All items of a job in enumeration order.
    pub async fn list_items(&self, job_id: &str) -> Result<Vec<ItemRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, identifier, status, last_error
            FROM items
            WHERE job_id = ?1
            ORDER BY id
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let status: String = row.get("status");
                ItemRecord {
                    id: row.get("id"),
                    identifier: row.get("identifier"),
                    status: ItemStatus::from_str(&status),
                    last_error: row.get("last_error"),
                }
            })
            .collect())
    }

    pub async fn get_item(&self, item_id: ItemId) -> Result<Option<ItemRecord>> {
        let row = sqlx::query(
            "SELECT id, identifier, status, last_error FROM items WHERE id = ?1",
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| {
            let status: String = row.get("status");
            ItemRecord {
                id: row.get("id"),
                identifier: row.get("identifier"),
                status: ItemStatus::from_str(&status),
                last_error: row.get("last_error"),
            }
        }))
    }

    pub async fn set_item_status(
        &self,
        item_id: ItemId,
        status: ItemStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE items SET status = ?1, last_error = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(last_error)
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persist a resolved item's filtered manifest before any fetch begins.
    /// Re-resolution keeps existing rows (and their progress) untouched.
    /// Returns the ids of rows that are still pending work.
    pub async fn insert_files(&self, item_id: ItemId, files: &[NewFile]) -> Result<Vec<FileId>> {
        let mut tx = self.pool.begin().await?;
        for f in files {
            sqlx::query(
                r#"
                INSERT INTO files (item_id, name, size, checksum, dest_path, status)
                VALUES (?1, ?2, ?3, ?4, ?5, 'pending')
                ON CONFLICT(item_id, name) DO NOTHING
                "#,
            )
            .bind(item_id)
            .bind(&f.name)
            .bind(f.size)
            .bind(&f.checksum)
            .bind(&f.dest_path)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        let rows = sqlx::query(
            "SELECT id FROM files WHERE item_id = ?1 AND status = 'pending' ORDER BY id",
        )
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get("id")).collect())
    }

    /// All files of one item in manifest order.
    pub async fn list_files(&self, item_id: ItemId) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, item_id, name, size, checksum, dest_path,
                   bytes_done, status, attempts, last_error, http_status
            FROM files
            WHERE item_id = ?1
            ORDER BY id
            "#,
        )
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(file_from_row).collect())
    }

    pub async fn get_file(&self, file_id: FileId) -> Result<Option<FileRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, item_id, name, size, checksum, dest_path,
                   bytes_done, status, attempts, last_error, http_status
            FROM files
            WHERE id = ?1
            "#,
        )
        .bind(file_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(file_from_row))
    }

    /// Ids of all pending files of a job, in (item, manifest) order. Used to
    /// rebuild the work queue on resume; the queue is a cache of this.
    pub async fn pending_file_ids(&self, job_id: &str) -> Result<Vec<FileId>> {
        let rows = sqlx::query(
            r#"
            SELECT f.id
            FROM files f
            JOIN items i ON f.item_id = i.id
            WHERE i.job_id = ?1 AND f.status = 'pending'
            ORDER BY f.item_id, f.id
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get("id")).collect())
    }

    /// Conditional transition `pending → in-progress`. Exactly one caller
    /// can win; everyone else sees false. This is the claim that grants a
    /// worker exclusive responsibility for the file.
    pub async fn claim_file(&self, file_id: FileId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE files SET status = 'in_progress' WHERE id = ?1 AND status = 'pending'",
        )
        .bind(file_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Return a borrowed file with its terminal (or reclaimed) state.
    pub async fn release_file(&self, file_id: FileId, update: &FileUpdate) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE files
            SET status = ?1,
                bytes_done = ?2,
                attempts = ?3,
                last_error = ?4,
                http_status = ?5
            WHERE id = ?6
            "#,
        )
        .bind(update.status.as_str())
        .bind(update.bytes_done)
        .bind(update.attempts)
        .bind(&update.last_error)
        .bind(update.http_status)
        .bind(file_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Durable progress checkpoint: bound the re-work a crash can cause.
    pub async fn checkpoint_file(&self, file_id: FileId, bytes_done: i64) -> Result<()> {
        sqlx::query("UPDATE files SET bytes_done = ?1 WHERE id = ?2")
            .bind(bytes_done)
            .bind(file_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Reclaim rows stranded `in_progress` by a dead process. Only a live
    /// claim is authoritative, so resume treats them as pending again.
    /// Returns the number of rows reclaimed.
    pub async fn reclaim_in_progress(&self, job_id: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE files
            SET status = 'pending'
            WHERE status = 'in_progress'
              AND item_id IN (SELECT id FROM items WHERE job_id = ?1)
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Aggregate counts and byte sums for the job.
    pub async fn progress_snapshot(&self, job_id: &str) -> Result<ProgressCounts> {
        let rows = sqlx::query(
            r#"
            SELECT f.status AS status,
                   COUNT(*) AS n,
                   COALESCE(SUM(f.bytes_done), 0) AS bytes,
                   COALESCE(SUM(f.size), 0) AS size
            FROM files f
            JOIN items i ON f.item_id = i.id
            WHERE i.job_id = ?1
            GROUP BY f.status
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = ProgressCounts::default();
        for row in rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            let bytes: i64 = row.get("bytes");
            let size: i64 = row.get("size");
            let n = n as u64;
            match FileStatus::from_str(&status) {
                FileStatus::Pending => counts.pending += n,
                FileStatus::InProgress => counts.in_progress += n,
                FileStatus::Done => counts.done += n,
                FileStatus::Failed => counts.failed += n,
                FileStatus::Skipped => counts.skipped += n,
            }
            counts.bytes_done += bytes.max(0) as u64;
            counts.bytes_total += size.max(0) as u64;
        }
        Ok(counts)
    }
}

fn file_from_row(row: sqlx::sqlite::SqliteRow) -> FileRecord {
    let status: String = row.get("status");
    FileRecord {
        id: row.get("id"),
        item_id: row.get("item_id"),
        name: row.get("name"),
        size: row.get("size"),
        checksum: row.get("checksum"),
        dest_path: row.get("dest_path"),
        bytes_done: row.get("bytes_done"),
        status: FileStatus::from_str(&status),
        attempts: row.get("attempts"),
        last_error: row.get("last_error"),
        http_status: row.get("http_status"),
    }
}
