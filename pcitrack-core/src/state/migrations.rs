//! Database migrations.
//!
//! - v1: `pci_devices` as first shipped
//! - v2: `parent_addr` column
//! - v3: `uuid` column; existing rows keep a null uuid until backfilled

use crate::error::{Result, TrackerError};
use sqlx::SqlitePool;
use tracing::{info, instrument};

pub const SCHEMA_VERSION: i64 = 3;

#[instrument(skip(pool))]
pub async fn run(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(migration_failed)?;

    let current_version = current_version(pool).await?;

    if current_version >= SCHEMA_VERSION {
        info!("Database schema is up to date (version {})", current_version);
        return Ok(());
    }

    info!("Migrating database from version {} to {}", current_version, SCHEMA_VERSION);

    if current_version < 1 {
        migrate_to_v1(pool).await?;
    }

    if current_version < 2 {
        migrate_to_v2(pool).await?;
    }

    if current_version < 3 {
        migrate_to_v3(pool).await?;
    }

    Ok(())
}

/// Schema version recorded in the database, 0 for a fresh one.
pub async fn current_version(pool: &SqlitePool) -> Result<i64> {
    let version: Option<i64> = sqlx::query_scalar("SELECT version FROM schema_version LIMIT 1")
        .fetch_optional(pool)
        .await
        .map_err(migration_failed)?;
    Ok(version.unwrap_or(0))
}

#[instrument(skip(pool))]
async fn migrate_to_v1(pool: &SqlitePool) -> Result<()> {
    info!("Running migration to schema version 1");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pci_devices (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            compute_node_id INTEGER,
            address TEXT NOT NULL,
            vendor_id TEXT NOT NULL,
            product_id TEXT NOT NULL,
            dev_type TEXT NOT NULL,
            status TEXT NOT NULL,
            dev_id TEXT,
            label TEXT,
            instance_uuid TEXT,
            request_id TEXT,
            extra_info TEXT NOT NULL DEFAULT '{}',
            numa_node INTEGER
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(migration_failed)?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_pci_devices_node_address \
         ON pci_devices(compute_node_id, address)",
    )
    .execute(pool)
    .await
    .map_err(migration_failed)?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_pci_devices_instance ON pci_devices(instance_uuid)",
    )
    .execute(pool)
    .await
    .map_err(migration_failed)?;

    set_version(pool, 1).await
}

#[instrument(skip(pool))]
async fn migrate_to_v2(pool: &SqlitePool) -> Result<()> {
    info!("Running migration to schema version 2");

    sqlx::query("ALTER TABLE pci_devices ADD COLUMN parent_addr TEXT")
        .execute(pool)
        .await
        .map_err(migration_failed)?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_pci_devices_parent \
         ON pci_devices(compute_node_id, parent_addr)",
    )
    .execute(pool)
    .await
    .map_err(migration_failed)?;

    set_version(pool, 2).await
}

#[instrument(skip(pool))]
async fn migrate_to_v3(pool: &SqlitePool) -> Result<()> {
    info!("Running migration to schema version 3");

    sqlx::query("ALTER TABLE pci_devices ADD COLUMN uuid TEXT")
        .execute(pool)
        .await
        .map_err(migration_failed)?;

    sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS idx_pci_devices_uuid ON pci_devices(uuid)")
        .execute(pool)
        .await
        .map_err(migration_failed)?;

    set_version(pool, 3).await
}

async fn set_version(pool: &SqlitePool, version: i64) -> Result<()> {
    sqlx::query("DELETE FROM schema_version")
        .execute(pool)
        .await
        .map_err(migration_failed)?;

    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await
        .map_err(migration_failed)?;

    info!("Migration to version {} complete", version);
    Ok(())
}

fn migration_failed(e: sqlx::Error) -> TrackerError {
    TrackerError::MigrationFailed { reason: e.to_string() }
}
