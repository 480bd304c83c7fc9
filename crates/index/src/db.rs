//! Database connection and pool management.

use exn::ResultExt;
use sqlx::SqliteConnection;
use sqlx::pool::PoolConnectionMetadata;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::path::{Path, PathBuf};
use tracing::instrument;

use crate::error::{ErrorKind, Result};

// Reads are streamed while the manager keeps writing; a handful is plenty.
const MAX_CONNECTIONS: u32 = 5;

/// Database connection pool for the index.
///
/// The index is never the source of truth for content: it can be deleted and
/// rebuilt from the managed directory at any time.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    async fn new(options: SqliteConnectOptions, max: Option<u32>) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            // This is IMPORTANT to apply the query-based PRAGMAs to EVERY
            // connection (set by max connections) instead of only the
            // first connection returned by the pool.
            .after_connect(|conn, meta| Box::pin(async move { Self::apply_pragmas(conn, meta).await }))
            .max_connections(max.unwrap_or(MAX_CONNECTIONS))
            .connect_with(options)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(Self { pool })
    }

    /// Connect to the index database at the given path.
    ///
    /// Creates the database file if it doesn't exist. Table setup is left to
    /// [`Schema::verify`](crate::Schema::verify).
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let options = Self::base_options().filename(path).create_if_missing(true);
        Self::new(options, None).await
    }

    /// Connect to an in-memory database (useful for testing).
    ///
    /// Note:
    /// - In-memory databases are destroyed when the connection closes.
    /// - Do NOT apply `#[cfg(test)]` so that other crates can also use this in their tests.
    pub async fn connect_in_memory() -> Result<Self> {
        let options = Self::base_options().filename(":memory:");
        // In-memory database must either use the same cache `.shared_cache(true)`,
        // or be limited to one connection. Otherwise parallel connections will
        // see different databases that contain different data.
        Self::new(options, Some(1)).await
    }

    /// Base connection options shared between file and in-memory databases.
    fn base_options() -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            // WAL mode: searches can stream while CRUD operations write.
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            // PRAGMA synchronous = NORMAL (balance between safety and speed)
            .synchronous(SqliteSynchronous::Normal)
            // PRAGMA busy_timeout = 1500ms
            .busy_timeout(std::time::Duration::from_millis(1500))
    }

    /// Apply additional PRAGMA settings that aren't exposed via SqliteConnectOptions.
    async fn apply_pragmas(conn: &mut SqliteConnection, _meta: PoolConnectionMetadata) -> sqlx::Result<()> {
        sqlx::query(
            r#"
                PRAGMA wal_autocheckpoint = 800;
                PRAGMA cache_size = -8192;
                PRAGMA temp_store = MEMORY;
            "#,
        )
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Filesystem location of the main database; `None` when it lives in
    /// memory.
    pub async fn location(&self) -> Result<Option<PathBuf>> {
        let file: Option<String> = sqlx::query_scalar("SELECT file FROM pragma_database_list WHERE name = 'main'")
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(file.filter(|file| !file.is_empty()).map(PathBuf::from))
    }

    /// Close the database connection pool.
    ///
    /// This waits for all connections to be returned to the pool and then
    /// closes them. After calling this, the Database instance should not
    /// be used.
    pub async fn close(&self) {
        // Let SQLite update query planner statistics
        _ = sqlx::query("PRAGMA optimize").execute(&self.pool).await;
        self.pool.close().await;
    }
}
impl From<SqlitePool> for Database {
    /// Wrap an externally configured pool. No PRAGMAs are applied.
    fn from(pool: SqlitePool) -> Self {
        Self { pool }
    }
}
