//! ImageRepository: image metadata in SQLite.
//!
//! The repository is handed an already constructed pool and borrows one
//! connection per operation. Nothing here retries: a failed query is reported
//! straight back to the caller.

use crate::models::image::ImageRecord;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("image `{0}` already exists")]
    DuplicateKey(String),
    #[error("image `{0}` not found")]
    NotFound(String),
    #[error("size {0} does not fit the size_bytes column")]
    SizeOutOfRange(u64),
    /// Pool exhaustion, I/O failure or a failed query. The driver error is
    /// kept for logging and never shown to clients.
    #[error("metadata store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Row shape of the `images` table. Timestamps are unix microseconds.
#[derive(FromRow, Debug)]
struct ImageRow {
    filename: String,
    size_bytes: i64,
    uploaded_at: i64,
}

impl ImageRow {
    fn into_record(self) -> ImageRecord {
        let uploaded_at = DateTime::from_timestamp_micros(self.uploaded_at).unwrap_or_else(|| {
            warn!(
                filename = %self.filename,
                raw = self.uploaded_at,
                "stored timestamp out of range"
            );
            DateTime::<Utc>::default()
        });
        ImageRecord {
            filename: self.filename,
            size_bytes: u64::try_from(self.size_bytes).unwrap_or_default(),
            uploaded_at,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ImageRepository {
    pool: SqlitePool,
}

impl ImageRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert the metadata row for a freshly written file.
    ///
    /// The stored timestamp is `max(uploaded_at, latest stored timestamp)`,
    /// which keeps `uploaded_at` non-decreasing in insert order even when
    /// worker clocks disagree. Returns the row as stored.
    pub async fn insert(
        &self,
        filename: &str,
        size_bytes: u64,
        uploaded_at: DateTime<Utc>,
    ) -> RepositoryResult<ImageRecord> {
        let size =
            i64::try_from(size_bytes).map_err(|_| RepositoryError::SizeOutOfRange(size_bytes))?;

        sqlx::query_as::<_, ImageRow>(
            r#"
            INSERT INTO images (filename, size_bytes, uploaded_at)
            SELECT ?1, ?2, MAX(?3, COALESCE((SELECT MAX(uploaded_at) FROM images), ?3))
            RETURNING filename, size_bytes, uploaded_at
            "#,
        )
        .bind(filename)
        .bind(size)
        .bind(uploaded_at.timestamp_micros())
        .fetch_one(&self.pool)
        .await
        .map(ImageRow::into_record)
        .map_err(|err| {
            if is_unique_violation(&err) {
                RepositoryError::DuplicateKey(filename.to_string())
            } else {
                RepositoryError::Unavailable(err)
            }
        })
    }

    pub async fn delete(&self, filename: &str) -> RepositoryResult<()> {
        let result = sqlx::query("DELETE FROM images WHERE filename = ?")
            .bind(filename)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(filename.to_string()));
        }
        Ok(())
    }

    pub async fn exists(&self, filename: &str) -> RepositoryResult<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM images WHERE filename = ?")
            .bind(filename)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Every record in storage order. Sorting is the paginator's job.
    pub async fn list_all(&self) -> RepositoryResult<Vec<ImageRecord>> {
        let rows = sqlx::query_as::<_, ImageRow>(
            "SELECT filename, size_bytes, uploaded_at FROM images ORDER BY rowid",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ImageRow::into_record).collect())
    }

    pub async fn count(&self) -> RepositoryResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM images")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Round-trip a trivial query; used by the readiness check.
    pub async fn ping(&self) -> RepositoryResult<()> {
        let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        if one != 1 {
            return Err(RepositoryError::Unavailable(sqlx::Error::Protocol(format!(
                "unexpected ping result: {}",
                one
            ))));
        }
        Ok(())
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err)
            if db_err.is_unique_violation()
                || db_err.message().to_ascii_lowercase().contains("unique")
    )
}
