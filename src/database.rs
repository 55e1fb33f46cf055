//! Embedded `SQLite` storage engine.
//!
//! Separates functional core (path/config validation, connection string
//! generation) from imperative shell (file system and connection I/O), the
//! same split the reference codebase drew between pure configuration and
//! its `DatabaseConnection` setup.

use crate::error::{StorageError, StorageResult};
use crate::operation_queue::OperationQueue;
use crate::time_provider::TimeProvider;
use nutype::nutype;
use sqlx::{Pool, Sqlite, SqlitePool};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Validated `.db` file path.
#[nutype(
    sanitize(with = |path: PathBuf| path),
    validate(predicate = |path| !path.as_os_str().is_empty() && path.extension().is_some_and(|ext| ext == "db")),
    derive(Clone, Debug, Eq, PartialEq)
)]
pub struct DatabasePath(PathBuf);

impl DatabasePath {
    /// Validates and wraps a candidate database file path.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the path is empty or does not end in
    /// `.db`.
    pub fn new<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let path_buf = path.as_ref().to_path_buf();
        Self::try_new(path_buf).map_err(|_| StorageError::InvalidPath(
            "database path must be non-empty and end in .db".to_string(),
        ))
    }

    /// Returns the underlying path.
    #[must_use]
    pub fn as_path(&self) -> PathBuf {
        self.clone().into_inner()
    }

    /// `SQLite` connection URI for this path, creating the file if missing.
    #[must_use]
    pub fn to_connection_string(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.as_path().display())
    }

    /// Parent directory, if any, so it can be created before connecting.
    #[must_use]
    pub fn parent_directory(&self) -> Option<PathBuf> {
        self.as_path().parent().map(Path::to_path_buf)
    }

    /// True if a file already exists at this path.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.as_path().exists()
    }
}

impl std::fmt::Display for DatabasePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_path().display())
    }
}

/// Connection pool size, bounded to a sane range for a device-resident
/// engine (never needs the hundreds of connections a server pool would).
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 32),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)
)]
pub struct PoolSize(u32);

impl Default for PoolSize {
    fn default() -> Self {
        Self::try_new(5).expect("5 is within the valid pool size range")
    }
}

/// Storage engine configuration.
#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    path: DatabasePath,
    #[allow(dead_code)]
    pool_size: PoolSize,
    open_timeout: Duration,
    migration_timeout: Duration,
    size_warn_mb: u64,
    max_concurrent_reads: usize,
}

impl DatabaseConfig {
    /// Builds a configuration from an [`crate::config::EngineConfig`] and a
    /// validated path.
    #[must_use]
    pub fn new(path: DatabasePath, engine_config: &crate::config::EngineConfig) -> Self {
        Self {
            path,
            pool_size: PoolSize::default(),
            open_timeout: engine_config.db_open_timeout,
            migration_timeout: engine_config.migration_timeout,
            size_warn_mb: engine_config.size_warn_mb,
            max_concurrent_reads: engine_config.max_concurrent_reads,
        }
    }

    /// A configuration tuned for tests: small pool, short timeouts.
    ///
    /// # Panics
    ///
    /// Panics if pool size 1 is outside the valid range (never happens).
    #[must_use]
    pub fn for_testing(path: DatabasePath) -> Self {
        Self {
            path,
            pool_size: PoolSize::try_new(1).expect("1 is within the valid pool size range"),
            open_timeout: Duration::from_millis(2_000),
            migration_timeout: Duration::from_millis(2_000),
            size_warn_mb: 100,
            max_concurrent_reads: 3,
        }
    }

    /// The validated database path.
    #[must_use]
    pub fn path(&self) -> &DatabasePath {
        &self.path
    }
}

/// An open connection pool to the campaign database, with migrations
/// already applied.
#[derive(Clone)]
pub struct StorageEngine {
    pool: Pool<Sqlite>,
    queue: OperationQueue,
    config: DatabaseConfig,
}

impl StorageEngine {
    fn connect_options(config: &DatabaseConfig) -> sqlx::sqlite::SqliteConnectOptions {
        use sqlx::ConnectOptions;
        use sqlx::sqlite::SqliteConnectOptions;

        SqliteConnectOptions::new()
            .filename(config.path().as_path())
            .create_if_missing(true)
            .disable_statement_logging()
    }

    /// Opens (creating if necessary) the database at `config.path()`, applies
    /// pragmas, verifies integrity, and runs pending migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InitTimeout`] if opening exceeds the
    /// configured timeout, or [`StorageError::IntegrityFailure`] if the
    /// database fails an integrity check even after recovery attempts.
    #[tracing::instrument(skip(time_provider), fields(path = %config.path()))]
    pub async fn open(
        config: DatabaseConfig,
        time_provider: &dyn TimeProvider,
    ) -> StorageResult<Self> {
        if let Some(parent) = config.path().parent_directory() {
            tokio::fs::create_dir_all(&parent).await?;
        }

        let open_fut = SqlitePool::connect_with(Self::connect_options(&config));
        let pool = tokio::time::timeout(config.open_timeout, open_fut)
            .await
            .map_err(|_| StorageError::InitTimeout(config.open_timeout))??;

        Self::apply_pragmas(&pool).await?;
        Self::verify_integrity_with_recovery(&pool, 2).await?;

        crate::migration::run_pending_migrations(&pool, time_provider, config.migration_timeout)
            .await
            .map_err(|e| match e {
                crate::error::MigrationError::Storage(inner) => inner,
                other => StorageError::IntegrityFailure {
                    attempts: 0,
                    reason: other.to_string(),
                },
            })?;

        let queue = OperationQueue::spawn(pool.clone(), config.max_concurrent_reads.max(1));
        let engine = Self { pool, queue, config };
        engine.warn_if_oversized().await;
        Ok(engine)
    }

    async fn apply_pragmas(pool: &Pool<Sqlite>) -> StorageResult<()> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(pool)
            .await?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(pool)
            .await?;
        sqlx::query("PRAGMA foreign_keys = ON").execute(pool).await?;
        sqlx::query("PRAGMA cache_size = -65536")
            .execute(pool)
            .await?;
        sqlx::query("PRAGMA temp_store = MEMORY")
            .execute(pool)
            .await?;
        sqlx::query("PRAGMA mmap_size = 268435456")
            .execute(pool)
            .await?;
        sqlx::query("PRAGMA busy_timeout = 5000")
            .execute(pool)
            .await?;
        sqlx::query("PRAGMA optimize").execute(pool).await?;
        Ok(())
    }

    async fn verify_integrity_with_recovery(
        pool: &Pool<Sqlite>,
        max_attempts: u32,
    ) -> StorageResult<()> {
        let mut attempts = 0;
        loop {
            let result: String = sqlx::query_scalar("PRAGMA integrity_check")
                .fetch_one(pool)
                .await?;
            if result == "ok" {
                return Ok(());
            }
            attempts += 1;
            warn!(attempts, result = %result, "integrity check failed, attempting recovery");
            if attempts >= max_attempts {
                return Err(StorageError::IntegrityFailure {
                    attempts,
                    reason: result,
                });
            }
            sqlx::query("REINDEX").execute(pool).await.ok();
            sqlx::query("VACUUM").execute(pool).await.ok();
        }
    }

    async fn warn_if_oversized(&self) {
        let Ok(Some(size_bytes)) = self.file_size_bytes().await else {
            return;
        };
        let size_mb = size_bytes / (1024 * 1024);
        if size_mb >= self.config.size_warn_mb {
            warn!(size_mb, limit_mb = self.config.size_warn_mb, "database size exceeds warning threshold");
        }
    }

    async fn file_size_bytes(&self) -> StorageResult<Option<u64>> {
        match tokio::fs::metadata(self.config.path().as_path()).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::FileSystem(e)),
        }
    }

    /// True if a file backs this engine's configured path.
    #[must_use]
    pub fn database_file_exists(&self) -> bool {
        self.config.path().exists()
    }

    /// Runs a trivial query to confirm the pool is responsive.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] if the query fails.
    pub async fn test_connection(&self) -> StorageResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// The underlying connection pool, for migrations and diagnostics.
    /// Repository implementations go through [`StorageEngine::queue`]
    /// instead so every mutation serialises through the single writer.
    #[must_use]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// The operation queue repositories submit their reads and writes
    /// through.
    #[must_use]
    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    /// The configuration this engine was opened with.
    #[must_use]
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }
}
