//! Metadata store trait and implementations.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::FileRepo;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: FileRepo + Send + Sync {
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Release pooled connections. Further calls fail.
    async fn close(&self);
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    query_timeout: Duration,
    unique_content: bool,
}

impl SqliteStore {
    /// Create a new SQLite store and bring its schema up to date.
    ///
    /// With `unique_content`, at most one committed record may exist per
    /// `(container, length, content_hash)`.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
        unique_content: bool,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        let query_timeout = Duration::from_secs(query_timeout_secs.unwrap_or(600));

        let in_memory = path == Path::new(":memory:");
        if !in_memory && let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let mut pool_opts = SqlitePoolOptions::new()
            // SQLite serializes writers; one connection keeps concurrent uploads
            // from failing with "database is locked".
            .max_connections(1);
        if in_memory {
            // The database lives only as long as its connection.
            pool_opts = pool_opts.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_opts.connect_with(opts).await?;

        let store = Self {
            pool,
            query_timeout,
            unique_content,
        };
        store.migrate().await?;

        tracing::debug!(
            path = %path.display(),
            query_timeout_secs = query_timeout.as_secs(),
            unique_content,
            "SQLite metadata store ready"
        );

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Whether the identity uniqueness index is enforced.
    pub fn unique_content(&self) -> bool {
        self.unique_content
    }

    /// Run a query future under the configured timeout.
    ///
    /// SQLite cannot cancel a running statement; the caller stops waiting
    /// but the connection finishes the work.
    async fn bounded<T, F>(&self, fut: F) -> MetadataResult<T>
    where
        F: Future<Output = MetadataResult<T>> + Send,
    {
        match tokio::time::timeout(self.query_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(MetadataError::Timeout(self.query_timeout.as_secs())),
        }
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;

        if self.unique_content {
            sqlx::query(IDENTITY_INDEX_SQL)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    MetadataError::Config(format!(
                        "cannot enforce unique content, existing committed files collide: {e}"
                    ))
                })?;
        } else {
            sqlx::query("DROP INDEX IF EXISTS idx_files_identity_unique")
                .execute(&self.pool)
                .await?;
        }

        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

mod sqlite_impl {
    use super::*;
    use crate::models::FileRow;
    use coffer_core::{ContentHash, FileId, FileState};
    use time::OffsetDateTime;

    fn to_i64(value: u64, what: &str) -> MetadataResult<i64> {
        i64::try_from(value)
            .map_err(|_| MetadataError::Internal(format!("{what} {value} exceeds i64")))
    }

    #[async_trait]
    impl FileRepo for SqliteStore {
        async fn create_pending(&self, row: &FileRow) -> MetadataResult<FileId> {
            self.bounded(async {
                let result = sqlx::query(
                    r#"
                    INSERT INTO files (
                        file_id, container, filename, length, content_hash, chunk_size,
                        metadata, state, created_at, committed_at, commit_seq
                    ) VALUES (?, ?, ?, NULL, NULL, ?, ?, ?, ?, NULL, NULL)
                    "#,
                )
                .bind(row.file_id)
                .bind(&row.container)
                .bind(&row.filename)
                .bind(row.chunk_size)
                .bind(&row.metadata)
                .bind(FileState::Pending.as_str())
                .bind(row.created_at)
                .execute(&self.pool)
                .await;

                match result {
                    Ok(_) => Ok(row.id()),
                    Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                        Err(MetadataError::AlreadyExists(format!(
                            "file_id {} already exists",
                            row.file_id
                        )))
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await
        }

        async fn finalize(
            &self,
            id: FileId,
            length: u64,
            content_hash: &ContentHash,
            committed_at: OffsetDateTime,
        ) -> MetadataResult<FileRow> {
            let length = to_i64(length, "length")?;
            let hash = content_hash.to_hex();

            self.bounded(async {
                let mut tx = self.pool.begin().await?;

                let updated = sqlx::query(
                    r#"
                    UPDATE files
                    SET length = ?, content_hash = ?, state = 'committed', committed_at = ?,
                        commit_seq = (SELECT COALESCE(MAX(commit_seq), 0) + 1 FROM files)
                    WHERE file_id = ? AND state = 'pending'
                    "#,
                )
                .bind(length)
                .bind(&hash)
                .bind(committed_at)
                .bind(*id.as_uuid())
                .execute(&mut *tx)
                .await;

                let updated = match updated {
                    Ok(result) => result,
                    Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                        return Err(MetadataError::Constraint(format!(
                            "a committed file with length {length} and hash {hash} already exists"
                        )));
                    }
                    Err(e) => return Err(e.into()),
                };

                let row = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE file_id = ?")
                    .bind(*id.as_uuid())
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or_else(|| MetadataError::NotFound(format!("file {id}")))?;

                if updated.rows_affected() == 0 {
                    return Err(MetadataError::InvalidStateTransition {
                        from: row.state,
                        to: FileState::Committed.as_str().to_string(),
                    });
                }

                tx.commit().await?;
                Ok(row)
            })
            .await
        }

        async fn find_by_id(&self, id: FileId) -> MetadataResult<FileRow> {
            self.bounded(async {
                sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE file_id = ?")
                    .bind(*id.as_uuid())
                    .fetch_optional(&self.pool)
                    .await?
                    .ok_or_else(|| MetadataError::NotFound(format!("file {id}")))
            })
            .await
        }

        async fn find_by_container_and_name(
            &self,
            container: &str,
            filename: &str,
        ) -> MetadataResult<FileRow> {
            self.bounded(async {
                sqlx::query_as::<_, FileRow>(
                    r#"
                    SELECT * FROM files
                    WHERE container = ? AND filename = ? AND state = 'committed'
                    ORDER BY commit_seq DESC, file_id DESC
                    LIMIT 1
                    "#,
                )
                .bind(container)
                .bind(filename)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| MetadataError::NotFound(format!("file {container}/{filename}")))
            })
            .await
        }

        async fn find_by_identity(
            &self,
            length: u64,
            content_hash: &ContentHash,
            container: &str,
            exclude: Option<FileId>,
        ) -> MetadataResult<Option<FileRow>> {
            let length = to_i64(length, "length")?;
            let exclude = exclude.map(|id| *id.as_uuid());

            self.bounded(async {
                let row = sqlx::query_as::<_, FileRow>(
                    r#"
                    SELECT * FROM files
                    WHERE container = ? AND length = ? AND content_hash = ?
                      AND state = 'committed'
                      AND (? IS NULL OR file_id != ?)
                    ORDER BY commit_seq ASC, file_id ASC
                    LIMIT 1
                    "#,
                )
                .bind(container)
                .bind(length)
                .bind(content_hash.to_hex())
                .bind(exclude)
                .bind(exclude)
                .fetch_optional(&self.pool)
                .await?;
                Ok(row)
            })
            .await
        }

        async fn list_containers(&self) -> MetadataResult<Vec<String>> {
            self.bounded(async {
                let names = sqlx::query_scalar::<_, String>(
                    "SELECT DISTINCT container FROM files WHERE state = 'committed' ORDER BY container",
                )
                .fetch_all(&self.pool)
                .await?;
                Ok(names)
            })
            .await
        }

        async fn list_files(&self, container: &str) -> MetadataResult<Vec<FileRow>> {
            self.bounded(async {
                let rows = sqlx::query_as::<_, FileRow>(
                    r#"
                    SELECT * FROM files
                    WHERE container = ? AND state = 'committed'
                    ORDER BY commit_seq ASC
                    "#,
                )
                .bind(container)
                .fetch_all(&self.pool)
                .await?;
                Ok(rows)
            })
            .await
        }

        async fn list_stale_pending(
            &self,
            cutoff: OffsetDateTime,
        ) -> MetadataResult<Vec<FileRow>> {
            self.bounded(async {
                let rows = sqlx::query_as::<_, FileRow>(
                    r#"
                    SELECT * FROM files
                    WHERE state = 'pending' AND created_at < ?
                    ORDER BY created_at ASC
                    "#,
                )
                .bind(cutoff)
                .fetch_all(&self.pool)
                .await?;
                Ok(rows)
            })
            .await
        }

        async fn delete(&self, id: FileId) -> MetadataResult<()> {
            self.bounded(async {
                let result = sqlx::query("DELETE FROM files WHERE file_id = ?")
                    .bind(*id.as_uuid())
                    .execute(&self.pool)
                    .await?;
                if result.rows_affected() == 0 {
                    return Err(MetadataError::NotFound(format!("file {id}")));
                }
                Ok(())
            })
            .await
        }

        async fn delete_all_in_container(&self, container: &str) -> MetadataResult<u64> {
            self.bounded(async {
                let result = sqlx::query("DELETE FROM files WHERE container = ?")
                    .bind(container)
                    .execute(&self.pool)
                    .await?;
                Ok(result.rows_affected())
            })
            .await
        }
    }
}

/// SQL schema for SQLite.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    file_id BLOB PRIMARY KEY,
    container TEXT NOT NULL,
    filename TEXT NOT NULL,
    length INTEGER,
    content_hash TEXT,
    chunk_size INTEGER NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    state TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL,
    committed_at TEXT,
    commit_seq INTEGER UNIQUE
);
CREATE INDEX IF NOT EXISTS idx_files_container_name ON files(container, filename, commit_seq);
CREATE INDEX IF NOT EXISTS idx_files_identity ON files(container, length, content_hash);
CREATE INDEX IF NOT EXISTS idx_files_state_created ON files(state, created_at);
"#;

/// Partial unique index closing the concurrent duplicate upload race.
const IDENTITY_INDEX_SQL: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_files_identity_unique
ON files(container, length, content_hash) WHERE state = 'committed'
"#;
