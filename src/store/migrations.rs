//! Schema management for the libSQL backend.
//!
//! Process-wide tables are versioned through `_migrations`; `run_migrations()`
//! applies only the versions not yet recorded. Per-namespace task partitions
//! are created on demand by `ensure_partition()` from a fixed DDL template.

use libsql::{Connection, params};

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "task_partitions",
    sql: r#"
        CREATE TABLE IF NOT EXISTS task_partitions (
            namespace TEXT PRIMARY KEY,
            table_name TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL
        );
    "#,
}];

/// Run all pending migrations against the given connection.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            conn.execute(
                "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
                params![migration.version, migration.name],
            )
            .await
            .map_err(|e| {
                DatabaseError::Migration(format!("Failed to record V{}: {e}", migration.version))
            })?;
        }
    }

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        Ok(None) => Ok(0),
        Err(e) => Err(DatabaseError::Migration(format!(
            "Failed to read migration version: {e}"
        ))),
    }
}

/// Create the task table and index for one namespace partition.
///
/// `table` must come from `partition_table_name`, which only emits
/// `[a-z0-9_]` characters.
pub async fn ensure_partition(
    conn: &Connection,
    namespace: &str,
    table: &str,
) -> Result<(), DatabaseError> {
    let ddl = format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id TEXT PRIMARY KEY,
            message TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'scheduled',
            created_at TEXT NOT NULL,
            scheduled_for TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            result TEXT,
            error TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_{table}_due ON {table}(status, scheduled_for);"
    );
    conn.execute_batch(&ddl)
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to create partition {table}: {e}")))?;

    conn.execute(
        "INSERT OR IGNORE INTO task_partitions (namespace, table_name, created_at)
         VALUES (?1, ?2, ?3)",
        params![namespace, table, chrono::Utc::now().to_rfc3339()],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to register partition {table}: {e}")))?;

    Ok(())
}

/// Deterministic, SQL-safe task table name for a namespace.
pub fn partition_table_name(namespace: &str) -> String {
    namespaced_table("tasks", namespace)
}

/// Deterministic, SQL-safe table name for `prefix` and a namespace.
///
/// The readable part keeps tables recognisable; the hash suffix keeps
/// namespaces that sanitize to the same text apart.
pub fn namespaced_table(prefix: &str, namespace: &str) -> String {
    let readable: String = namespace
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .take(32)
        .collect();
    format!("{prefix}_{readable}_{:016x}", fnv1a(namespace.as_bytes()))
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}
