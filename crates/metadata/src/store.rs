//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{BitstreamRepo, ChecksumHistoryRepo, UnitOfWork};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: BitstreamRepo + ChecksumHistoryRepo + Send + Sync {
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Open a transaction for batched work.
    async fn begin(&self) -> MetadataResult<Box<dyn UnitOfWork>>;
}

pub(crate) fn offset_param(offset: u64) -> i64 {
    i64::try_from(offset).unwrap_or(i64::MAX)
}

pub(crate) fn count_param(count: i64) -> u64 {
    u64::try_from(count).unwrap_or(0)
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if missing) a database file and apply the schema.
    pub async fn new(path: impl AsRef<Path>) -> MetadataResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // A single connection serializes writers; an open unit of work
            // holds it until commit.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA_SQL.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn begin(&self) -> MetadataResult<Box<dyn UnitOfWork>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteUnitOfWork { tx }))
    }
}

/// Unit of work over a SQLite transaction.
pub struct SqliteUnitOfWork {
    tx: Transaction<'static, Sqlite>,
}

// Implement all the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use uuid::Uuid;

    const BITSTREAM_COLUMNS: &str = "bitstream_id, internal_id, store_number, size_bytes, checksum, checksum_algorithm, deleted, created_at, updated_at";

    #[async_trait]
    impl BitstreamRepo for SqliteStore {
        async fn create_bitstream(&self, row: &BitstreamRow) -> MetadataResult<()> {
            let result = sqlx::query(
                "INSERT INTO bitstreams (bitstream_id, internal_id, store_number, size_bytes, checksum, checksum_algorithm, deleted, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(row.bitstream_id)
            .bind(&row.internal_id)
            .bind(row.store_number)
            .bind(row.size_bytes)
            .bind(&row.checksum)
            .bind(&row.checksum_algorithm)
            .bind(row.deleted)
            .bind(row.created_at)
            .bind(row.updated_at)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => Ok(()),
                Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
                    MetadataError::AlreadyExists(format!("bitstream {}", row.bitstream_id)),
                ),
                Err(e) => Err(e.into()),
            }
        }

        async fn update_bitstream(&self, row: &BitstreamRow) -> MetadataResult<()> {
            let mut conn = self.pool.acquire().await?;
            update_row(&mut conn, row).await
        }

        async fn get_bitstream(&self, bitstream_id: Uuid) -> MetadataResult<Option<BitstreamRow>> {
            let row = sqlx::query_as::<_, BitstreamRow>(&format!(
                "SELECT {BITSTREAM_COLUMNS} FROM bitstreams WHERE bitstream_id = ?"
            ))
            .bind(bitstream_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn get_live_bitstream(
            &self,
            bitstream_id: Uuid,
        ) -> MetadataResult<Option<BitstreamRow>> {
            let row = sqlx::query_as::<_, BitstreamRow>(&format!(
                "SELECT {BITSTREAM_COLUMNS} FROM bitstreams WHERE bitstream_id = ? AND deleted = 0"
            ))
            .bind(bitstream_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn mark_deleted(&self, bitstream_id: Uuid) -> MetadataResult<()> {
            let result =
                sqlx::query("UPDATE bitstreams SET deleted = 1, updated_at = ? WHERE bitstream_id = ?")
                    .bind(time::OffsetDateTime::now_utc())
                    .bind(bitstream_id)
                    .execute(&self.pool)
                    .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!(
                    "bitstream {bitstream_id}"
                )));
            }
            Ok(())
        }

        async fn find_deleted_bitstreams(
            &self,
            limit: u32,
            offset: u64,
        ) -> MetadataResult<Vec<BitstreamRow>> {
            let rows = sqlx::query_as::<_, BitstreamRow>(&format!(
                "SELECT {BITSTREAM_COLUMNS} FROM bitstreams WHERE deleted = 1 ORDER BY created_at, bitstream_id LIMIT ? OFFSET ?"
            ))
            .bind(i64::from(limit))
            .bind(offset_param(offset))
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn find_duplicate_internal_ids(
            &self,
            internal_id: &str,
            exclude: Uuid,
        ) -> MetadataResult<Vec<BitstreamRow>> {
            let rows = sqlx::query_as::<_, BitstreamRow>(&format!(
                "SELECT {BITSTREAM_COLUMNS} FROM bitstreams WHERE internal_id = ? AND bitstream_id != ? AND deleted = 0"
            ))
            .bind(internal_id)
            .bind(exclude)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn find_bitstreams_by_store(
            &self,
            store_number: i32,
            limit: u32,
            offset: u64,
        ) -> MetadataResult<Vec<BitstreamRow>> {
            let rows = sqlx::query_as::<_, BitstreamRow>(&format!(
                "SELECT {BITSTREAM_COLUMNS} FROM bitstreams WHERE store_number = ? AND deleted = 0 ORDER BY created_at, bitstream_id LIMIT ? OFFSET ?"
            ))
            .bind(store_number)
            .bind(i64::from(limit))
            .bind(offset_param(offset))
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn count_bitstreams_by_store(&self, store_number: i32) -> MetadataResult<u64> {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM bitstreams WHERE store_number = ? AND deleted = 0",
            )
            .bind(store_number)
            .fetch_one(&self.pool)
            .await?;
            Ok(count_param(count))
        }

        async fn expunge_bitstream(&self, bitstream_id: Uuid) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;
            expunge_row(&mut tx, bitstream_id).await?;
            tx.commit().await?;
            Ok(())
        }
    }

    #[async_trait]
    impl ChecksumHistoryRepo for SqliteStore {
        async fn add_check(&self, check: &ChecksumHistoryRow) -> MetadataResult<()> {
            sqlx::query(
                "INSERT INTO checksum_history (check_id, bitstream_id, checked_at, expected_checksum, computed_checksum, result) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(check.check_id)
            .bind(check.bitstream_id)
            .bind(check.checked_at)
            .bind(&check.expected_checksum)
            .bind(&check.computed_checksum)
            .bind(&check.result)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn list_checks(&self, bitstream_id: Uuid) -> MetadataResult<Vec<ChecksumHistoryRow>> {
            let rows = sqlx::query_as::<_, ChecksumHistoryRow>(
                "SELECT check_id, bitstream_id, checked_at, expected_checksum, computed_checksum, result FROM checksum_history WHERE bitstream_id = ? ORDER BY checked_at, check_id",
            )
            .bind(bitstream_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn delete_checks(&self, bitstream_id: Uuid) -> MetadataResult<u64> {
            let result = sqlx::query("DELETE FROM checksum_history WHERE bitstream_id = ?")
                .bind(bitstream_id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        }
    }

    #[async_trait]
    impl UnitOfWork for SqliteUnitOfWork {
        async fn get_bitstream(
            &mut self,
            bitstream_id: Uuid,
        ) -> MetadataResult<Option<BitstreamRow>> {
            let row = sqlx::query_as::<_, BitstreamRow>(&format!(
                "SELECT {BITSTREAM_COLUMNS} FROM bitstreams WHERE bitstream_id = ?"
            ))
            .bind(bitstream_id)
            .fetch_optional(&mut *self.tx)
            .await?;
            Ok(row)
        }

        async fn update_bitstream(&mut self, row: &BitstreamRow) -> MetadataResult<()> {
            update_row(&mut self.tx, row).await
        }

        async fn expunge_bitstream(&mut self, bitstream_id: Uuid) -> MetadataResult<()> {
            expunge_row(&mut self.tx, bitstream_id).await
        }

        async fn count_live_duplicates(
            &mut self,
            internal_id: &str,
            exclude: Uuid,
        ) -> MetadataResult<u64> {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM bitstreams WHERE internal_id = ? AND bitstream_id != ? AND deleted = 0",
            )
            .bind(internal_id)
            .bind(exclude)
            .fetch_one(&mut *self.tx)
            .await?;
            Ok(count_param(count))
        }

        async fn commit(self: Box<Self>) -> MetadataResult<()> {
            self.tx.commit().await?;
            Ok(())
        }

        async fn rollback(self: Box<Self>) -> MetadataResult<()> {
            self.tx.rollback().await?;
            Ok(())
        }
    }

    async fn update_row(
        conn: &mut sqlx::SqliteConnection,
        row: &BitstreamRow,
    ) -> MetadataResult<()> {
        let result = sqlx::query(
            "UPDATE bitstreams SET internal_id = ?, store_number = ?, size_bytes = ?, checksum = ?, checksum_algorithm = ?, deleted = ?, updated_at = ? WHERE bitstream_id = ?",
        )
        .bind(&row.internal_id)
        .bind(row.store_number)
        .bind(row.size_bytes)
        .bind(&row.checksum)
        .bind(&row.checksum_algorithm)
        .bind(row.deleted)
        .bind(time::OffsetDateTime::now_utc())
        .bind(row.bitstream_id)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(format!(
                "bitstream {}",
                row.bitstream_id
            )));
        }
        Ok(())
    }

    async fn expunge_row(conn: &mut sqlx::SqliteConnection, bitstream_id: Uuid) -> MetadataResult<()> {
        sqlx::query("DELETE FROM checksum_history WHERE bitstream_id = ?")
            .bind(bitstream_id)
            .execute(&mut *conn)
            .await?;
        sqlx::query("DELETE FROM bitstreams WHERE bitstream_id = ?")
            .bind(bitstream_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}

const SCHEMA_SQL: &str = r#"
-- Bitstream rows (deleted = 1 covers pending and soft-deleted rows)
CREATE TABLE IF NOT EXISTS bitstreams (
    bitstream_id BLOB PRIMARY KEY,
    internal_id TEXT NOT NULL,
    store_number INTEGER NOT NULL,
    size_bytes INTEGER NOT NULL DEFAULT 0,
    checksum TEXT,
    checksum_algorithm TEXT,
    deleted INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_bitstreams_internal_id ON bitstreams(internal_id);
CREATE INDEX IF NOT EXISTS idx_bitstreams_deleted ON bitstreams(deleted, created_at);
CREATE INDEX IF NOT EXISTS idx_bitstreams_store ON bitstreams(store_number, deleted, created_at);

-- Checksum verification results
CREATE TABLE IF NOT EXISTS checksum_history (
    check_id BLOB PRIMARY KEY,
    bitstream_id BLOB NOT NULL REFERENCES bitstreams(bitstream_id),
    checked_at TEXT NOT NULL,
    expected_checksum TEXT,
    computed_checksum TEXT,
    result TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_checksum_history_bitstream ON checksum_history(bitstream_id, checked_at);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BitstreamRow, CheckResult, ChecksumHistoryRow};
    use tempfile::TempDir;
    use time::OffsetDateTime;
    use uuid::Uuid;

    async fn store() -> (TempDir, SqliteStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteStore::new(temp_dir.path().join("metadata.db"))
            .await
            .unwrap();
        (temp_dir, store)
    }

    fn live(internal_id: &str, store_number: i32) -> BitstreamRow {
        let mut row = BitstreamRow::pending(internal_id, store_number);
        row.size_bytes = 3;
        row.checksum = Some("900150983cd24fb0d6963f7d28e17f72".to_string());
        row.checksum_algorithm = Some("MD5".to_string());
        row.deleted = false;
        row
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let (_temp, store) = store().await;
        store.migrate().await.unwrap();
        store.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_and_get_round_trip() {
        let (_temp, store) = store().await;
        let row = live("1234567890", 0);
        store.create_bitstream(&row).await.unwrap();

        let fetched = store.get_bitstream(row.bitstream_id).await.unwrap().unwrap();
        assert_eq!(fetched.internal_id, row.internal_id);
        assert_eq!(fetched.checksum, row.checksum);
        assert!(!fetched.deleted);

        let err = store.create_bitstream(&row).await.unwrap_err();
        assert!(matches!(err, MetadataError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_pending_rows_are_invisible_to_live_lookup() {
        let (_temp, store) = store().await;
        let row = BitstreamRow::pending("1234567890", 0);
        store.create_bitstream(&row).await.unwrap();

        assert!(store.get_live_bitstream(row.bitstream_id).await.unwrap().is_none());
        assert!(store.get_bitstream(row.bitstream_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_update_missing_row_is_not_found() {
        let (_temp, store) = store().await;
        let err = store.update_bitstream(&live("1", 0)).await.unwrap_err();
        assert!(err.is_not_found());
        let err = store.mark_deleted(Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_find_deleted_pages_in_creation_order() {
        let (_temp, store) = store().await;
        let base = OffsetDateTime::now_utc();
        let mut ids = Vec::new();
        for i in 0..5 {
            let mut row = live(&format!("id{i}"), 0);
            row.deleted = true;
            row.created_at = base + time::Duration::seconds(i);
            ids.push(row.bitstream_id);
            store.create_bitstream(&row).await.unwrap();
        }
        store.create_bitstream(&live("kept", 0)).await.unwrap();

        let first = store.find_deleted_bitstreams(2, 0).await.unwrap();
        let second = store.find_deleted_bitstreams(2, 2).await.unwrap();
        let third = store.find_deleted_bitstreams(2, 4).await.unwrap();
        let seen: Vec<Uuid> = first
            .iter()
            .chain(&second)
            .chain(&third)
            .map(|r| r.bitstream_id)
            .collect();
        assert_eq!(seen, ids);
    }

    #[tokio::test]
    async fn test_duplicates_exclude_self_and_deleted_rows() {
        let (_temp, store) = store().await;
        let original = live("shared", 0);
        let clone = live("shared", 0);
        let mut gone = live("shared", 0);
        gone.deleted = true;
        for row in [&original, &clone, &gone] {
            store.create_bitstream(row).await.unwrap();
        }

        let dups = store
            .find_duplicate_internal_ids("shared", original.bitstream_id)
            .await
            .unwrap();
        assert_eq!(dups.len(), 1);
        assert_eq!(dups[0].bitstream_id, clone.bitstream_id);
    }

    #[tokio::test]
    async fn test_by_store_enumeration_and_count() {
        let (_temp, store) = store().await;
        for i in 0..3 {
            store.create_bitstream(&live(&format!("a{i}"), 1)).await.unwrap();
        }
        store.create_bitstream(&live("b", 2)).await.unwrap();
        let mut deleted = live("c", 1);
        deleted.deleted = true;
        store.create_bitstream(&deleted).await.unwrap();

        assert_eq!(store.count_bitstreams_by_store(1).await.unwrap(), 3);
        assert_eq!(store.count_bitstreams_by_store(2).await.unwrap(), 1);
        assert_eq!(store.find_bitstreams_by_store(1, 10, 0).await.unwrap().len(), 3);
        assert_eq!(store.find_bitstreams_by_store(1, 10, 2).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expunge_removes_history_first() {
        let (_temp, store) = store().await;
        let row = live("1234", 0);
        store.create_bitstream(&row).await.unwrap();
        store
            .add_check(&ChecksumHistoryRow::new(
                row.bitstream_id,
                row.checksum.clone(),
                row.checksum.clone(),
                CheckResult::Match,
            ))
            .await
            .unwrap();
        assert_eq!(store.list_checks(row.bitstream_id).await.unwrap().len(), 1);

        store.expunge_bitstream(row.bitstream_id).await.unwrap();
        assert!(store.get_bitstream(row.bitstream_id).await.unwrap().is_none());
        assert!(store.list_checks(row.bitstream_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_requires_existing_bitstream() {
        let (_temp, store) = store().await;
        let orphan = ChecksumHistoryRow::new(Uuid::new_v4(), None, None, CheckResult::Missing);
        assert!(store.add_check(&orphan).await.is_err());
    }

    #[tokio::test]
    async fn test_unit_of_work_commit_and_rollback() {
        let (_temp, store) = store().await;
        let row = live("1234", 0);
        store.create_bitstream(&row).await.unwrap();

        let mut uow = store.begin().await.unwrap();
        let mut moved = uow.get_bitstream(row.bitstream_id).await.unwrap().unwrap();
        moved.store_number = 5;
        uow.update_bitstream(&moved).await.unwrap();
        uow.rollback().await.unwrap();
        let fetched = store.get_bitstream(row.bitstream_id).await.unwrap().unwrap();
        assert_eq!(fetched.store_number, 0);

        let mut uow = store.begin().await.unwrap();
        uow.update_bitstream(&moved).await.unwrap();
        assert_eq!(uow.count_live_duplicates("1234", Uuid::new_v4()).await.unwrap(), 1);
        assert_eq!(uow.count_live_duplicates("1234", row.bitstream_id).await.unwrap(), 0);
        uow.commit().await.unwrap();
        let fetched = store.get_bitstream(row.bitstream_id).await.unwrap().unwrap();
        assert_eq!(fetched.store_number, 5);
    }

    #[tokio::test]
    async fn test_dropped_unit_of_work_rolls_back() {
        let (_temp, store) = store().await;
        let row = live("1234", 0);
        store.create_bitstream(&row).await.unwrap();

        {
            let mut uow = store.begin().await.unwrap();
            uow.expunge_bitstream(row.bitstream_id).await.unwrap();
        }
        assert!(store.get_bitstream(row.bitstream_id).await.unwrap().is_some());
    }
}
