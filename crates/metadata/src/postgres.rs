//! PostgreSQL-based metadata store implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::models::*;
use crate::repos::{BitstreamRepo, ChecksumHistoryRepo, UnitOfWork};
use crate::store::{MetadataStore, count_param, offset_param};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgConnection, Pool, Postgres, Transaction};
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

const BITSTREAM_COLUMNS: &str = "bitstream_id, internal_id, store_number, size_bytes, checksum, checksum_algorithm, deleted, created_at, updated_at";

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// PostgreSQL-based metadata store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Connect using a connection URL and apply the schema.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::from_str(url)?;

        // Bound how long a sweep can sit on a hung query.
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{}ms", timeout_ms))]);
            tracing::info!("PostgreSQL statement_timeout set to {}ms", timeout_ms);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        // PostgreSQL doesn't allow multiple statements in a single prepared statement,
        // so we split the schema and execute each statement separately.
        let mut tx = self.pool.begin().await?;
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
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
        Ok(Box::new(PgUnitOfWork { tx }))
    }
}

#[async_trait]
impl BitstreamRepo for PostgresStore {
    async fn create_bitstream(&self, row: &BitstreamRow) -> MetadataResult<()> {
        let result = sqlx::query(
            "INSERT INTO bitstreams (bitstream_id, internal_id, store_number, size_bytes, checksum, checksum_algorithm, deleted, created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
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
            "SELECT {BITSTREAM_COLUMNS} FROM bitstreams WHERE bitstream_id = $1"
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
            "SELECT {BITSTREAM_COLUMNS} FROM bitstreams WHERE bitstream_id = $1 AND NOT deleted"
        ))
        .bind(bitstream_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn mark_deleted(&self, bitstream_id: Uuid) -> MetadataResult<()> {
        let result =
            sqlx::query("UPDATE bitstreams SET deleted = TRUE, updated_at = $1 WHERE bitstream_id = $2")
                .bind(OffsetDateTime::now_utc())
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
            "SELECT {BITSTREAM_COLUMNS} FROM bitstreams WHERE deleted ORDER BY created_at, bitstream_id LIMIT $1 OFFSET $2"
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
            "SELECT {BITSTREAM_COLUMNS} FROM bitstreams WHERE internal_id = $1 AND bitstream_id <> $2 AND NOT deleted"
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
            "SELECT {BITSTREAM_COLUMNS} FROM bitstreams WHERE store_number = $1 AND NOT deleted ORDER BY created_at, bitstream_id LIMIT $2 OFFSET $3"
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
            "SELECT COUNT(*) FROM bitstreams WHERE store_number = $1 AND NOT deleted",
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
impl ChecksumHistoryRepo for PostgresStore {
    async fn add_check(&self, check: &ChecksumHistoryRow) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO checksum_history (check_id, bitstream_id, checked_at, expected_checksum, computed_checksum, result) VALUES ($1, $2, $3, $4, $5, $6)",
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
            "SELECT check_id, bitstream_id, checked_at, expected_checksum, computed_checksum, result FROM checksum_history WHERE bitstream_id = $1 ORDER BY checked_at, check_id",
        )
        .bind(bitstream_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete_checks(&self, bitstream_id: Uuid) -> MetadataResult<u64> {
        let result = sqlx::query("DELETE FROM checksum_history WHERE bitstream_id = $1")
            .bind(bitstream_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Unit of work over a PostgreSQL transaction.
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn get_bitstream(&mut self, bitstream_id: Uuid) -> MetadataResult<Option<BitstreamRow>> {
        // Lock the row so a concurrent sweep cannot act on it at the same time.
        let row = sqlx::query_as::<_, BitstreamRow>(&format!(
            "SELECT {BITSTREAM_COLUMNS} FROM bitstreams WHERE bitstream_id = $1 FOR UPDATE"
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
            "SELECT COUNT(*) FROM bitstreams WHERE internal_id = $1 AND bitstream_id <> $2 AND NOT deleted",
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

async fn update_row(conn: &mut PgConnection, row: &BitstreamRow) -> MetadataResult<()> {
    let result = sqlx::query(
        "UPDATE bitstreams SET internal_id = $1, store_number = $2, size_bytes = $3, checksum = $4, checksum_algorithm = $5, deleted = $6, updated_at = $7 WHERE bitstream_id = $8",
    )
    .bind(&row.internal_id)
    .bind(row.store_number)
    .bind(row.size_bytes)
    .bind(&row.checksum)
    .bind(&row.checksum_algorithm)
    .bind(row.deleted)
    .bind(OffsetDateTime::now_utc())
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

async fn expunge_row(conn: &mut PgConnection, bitstream_id: Uuid) -> MetadataResult<()> {
    sqlx::query("DELETE FROM checksum_history WHERE bitstream_id = $1")
        .bind(bitstream_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM bitstreams WHERE bitstream_id = $1")
        .bind(bitstream_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_statements_skip_comment_only_chunks() {
        let statements = postgres_schema_statements(POSTGRES_SCHEMA);
        assert_eq!(statements.len(), 6);
        assert!(statements[0].contains("CREATE TABLE IF NOT EXISTS bitstreams"));
        assert!(statements.iter().all(|s| !s.trim().is_empty()));
    }

    #[test]
    fn test_schema_statements_handle_trailing_comment() {
        let schema = "CREATE TABLE a (x INT);\n-- trailing note\n";
        assert_eq!(
            postgres_schema_statements(schema),
            vec!["CREATE TABLE a (x INT)"]
        );
    }
}
