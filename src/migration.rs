//! Versioned schema migrations.
//!
//! `SQLx`'s `migrate!()` macro tracks applied migrations in its own
//! `_sqlx_migrations` table and only runs plain SQL. This engine needs an
//! explicit `schema_version` table plus the ability to run an imperative
//! step (e.g. seeding the subscription plan table from Rust constants), so
//! migrations are applied by hand here instead, each wrapped in its own
//! timeout the way the send pipeline wraps transport calls in a timeout.

use crate::error::{MigrationError, MigrationResult};
use crate::time_provider::TimeProvider;
use sqlx::{Pool, Sqlite};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::info;

type RunFnPtr =
    for<'a> fn(&'a Pool<Sqlite>) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>>;

/// Either a batch of plain SQL statements or an imperative step.
pub enum MigrationKind {
    /// Executed as a single multi-statement script inside a transaction.
    Sql(&'static str),
    /// An imperative step responsible for its own durability.
    RunFn(RunFnPtr),
}

/// A single versioned migration.
pub struct Migration {
    /// Monotonically increasing version number; also the sort key.
    pub version: i64,
    /// Human-readable name, surfaced in error messages.
    pub name: &'static str,
    /// The work this migration performs.
    pub kind: MigrationKind,
}

fn seed_default_plans(
    pool: &Pool<Sqlite>,
) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>> {
    Box::pin(async move {
        let plans: [(&str, &str, &str, i64); 3] = [
            ("weekly", "Weekly", "50", 7),
            ("monthly", "Monthly", "150", 30),
            ("annual", "Annual", "1500", 365),
        ];
        for (id, name, price, duration_days) in plans {
            sqlx::query(
                "INSERT OR IGNORE INTO subscription_plans (id, name, price_kes, duration_days)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(id)
            .bind(name)
            .bind(price)
            .bind(duration_days)
            .execute(pool)
            .await
            .map_err(|e| e.to_string())?;
        }
        Ok(())
    })
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "core_schema",
        kind: MigrationKind::Sql(include_str!("../migrations/0001_core_schema.sql")),
    },
    Migration {
        version: 2,
        name: "subscription_plans",
        kind: MigrationKind::Sql(include_str!("../migrations/0002_subscription_plans.sql")),
    },
    Migration {
        version: 3,
        name: "seed_default_plans",
        kind: MigrationKind::RunFn(seed_default_plans),
    },
    Migration {
        version: 4,
        name: "schema_placeholders",
        kind: MigrationKind::Sql(include_str!("../migrations/0003_schema_placeholders.sql")),
    },
    Migration {
        version: 5,
        name: "outbound_sim_slot",
        kind: MigrationKind::Sql(include_str!("../migrations/0004_outbound_sim_slot.sql")),
    },
];

async fn ensure_schema_version_table(pool: &Pool<Sqlite>) -> MigrationResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await
    .map_err(crate::error::StorageError::from)?;
    Ok(())
}

async fn applied_versions(pool: &Pool<Sqlite>) -> MigrationResult<Vec<i64>> {
    let rows: Vec<(i64,)> = sqlx::query_as("SELECT version FROM schema_version")
        .fetch_all(pool)
        .await
        .map_err(crate::error::StorageError::from)?;
    Ok(rows.into_iter().map(|(v,)| v).collect())
}

async fn record_applied(pool: &Pool<Sqlite>, migration: &Migration, applied_at: i64) -> MigrationResult<()> {
    sqlx::query("INSERT INTO schema_version (version, name, applied_at) VALUES (?1, ?2, ?3)")
        .bind(migration.version)
        .bind(migration.name)
        .bind(applied_at)
        .execute(pool)
        .await
        .map_err(crate::error::StorageError::from)?;
    Ok(())
}

async fn apply_sql_migration(
    pool: &Pool<Sqlite>,
    migration: &Migration,
    sql: &str,
    applied_at: i64,
) -> MigrationResult<()> {
    let mut tx = pool
        .begin()
        .await
        .map_err(crate::error::StorageError::from)?;
    sqlx::raw_sql(sql)
        .execute(&mut *tx)
        .await
        .map_err(|e| MigrationError::Failed {
            version: migration.version,
            name: migration.name.to_string(),
            reason: e.to_string(),
        })?;
    sqlx::query("INSERT INTO schema_version (version, name, applied_at) VALUES (?1, ?2, ?3)")
        .bind(migration.version)
        .bind(migration.name)
        .bind(applied_at)
        .execute(&mut *tx)
        .await
        .map_err(crate::error::StorageError::from)?;
    tx.commit().await.map_err(crate::error::StorageError::from)?;
    Ok(())
}

async fn apply_migration(
    pool: &Pool<Sqlite>,
    migration: &Migration,
    time_provider: &dyn TimeProvider,
    timeout: Duration,
) -> MigrationResult<()> {
    let started = time_provider.instant();
    let applied_at = time_provider.unix_millis();

    let outcome = tokio::time::timeout(timeout, async {
        match &migration.kind {
            MigrationKind::Sql(sql) => apply_sql_migration(pool, migration, sql, applied_at).await,
            MigrationKind::RunFn(run) => {
                run(pool).await.map_err(|reason| MigrationError::Failed {
                    version: migration.version,
                    name: migration.name.to_string(),
                    reason,
                })?;
                record_applied(pool, migration, applied_at).await
            }
        }
    })
    .await;

    match outcome {
        Ok(result) => result,
        Err(_) => Err(MigrationError::Timeout {
            version: migration.version,
            name: migration.name.to_string(),
            elapsed: started.elapsed(),
        }),
    }
}

/// Applies every migration newer than the database's recorded schema
/// version, each within its own timeout budget.
///
/// # Errors
///
/// Returns [`MigrationError::Timeout`] if a migration exceeds `timeout`, or
/// [`MigrationError::Failed`] if its statements or run function fail.
pub async fn run_pending_migrations(
    pool: &Pool<Sqlite>,
    time_provider: &dyn TimeProvider,
    timeout: Duration,
) -> MigrationResult<()> {
    ensure_schema_version_table(pool).await?;
    let applied = applied_versions(pool).await?;

    let pending: Vec<&Migration> = MIGRATIONS
        .iter()
        .filter(|m| !applied.contains(&m.version))
        .collect();

    if pending.is_empty() {
        return Ok(());
    }

    info!(count = pending.len(), "applying pending migrations");
    for migration in pending {
        apply_migration(pool, migration, time_provider, timeout).await?;
        info!(version = migration.version, name = migration.name, "migration applied");
    }
    Ok(())
}
