//! Device persistence.
//!
//! [`DeviceStore`] is the storage boundary the tracker is written against:
//! - [`StateManager`] keeps devices in SQLite
//! - [`MemoryStore`] keeps them in memory for tests and dry runs
//!
//! The functions in [`record`] build on the trait: loading devices with uuid backfill,
//! saving only changed columns, and the batch uuid backfill.

use crate::error::{Result, TrackerError};
use crate::types::{ColumnValue, DeviceChanges, DeviceField, DeviceRow};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{ConnectOptions, Row};
use std::path::Path;
use std::str::FromStr;
use tracing::{info, instrument};
use uuid::Uuid;

mod memory;
pub mod migrations;
pub mod record;

pub use memory::MemoryStore;
pub use record::{
    create_uuid, device_from_row, devices_by_instance, devices_by_node, devices_by_parent_address,
    get_by_address, get_by_id, populate_dev_uuids, save_device,
};


/// Row-level device storage.
///
/// Devices are keyed by `(compute_node_id, address)`; a `None` node matches rows without
/// one. Lookups of missing rows fail with [`TrackerError::DeviceNotFound`] or
/// [`TrackerError::DeviceNotFoundById`].
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn get_by_address(&self, compute_node_id: Option<i64>, address: &str)
        -> Result<DeviceRow>;

    async fn get_by_id(&self, id: i64) -> Result<DeviceRow>;

    /// Rows of one node, in id order.
    async fn get_all_by_node(&self, compute_node_id: i64) -> Result<Vec<DeviceRow>>;

    /// Rows owned by one instance, in id order.
    async fn get_all_by_instance(&self, instance_uuid: &str) -> Result<Vec<DeviceRow>>;

    /// VFs of one PF, in id order.
    async fn get_all_by_parent_address(
        &self,
        compute_node_id: i64,
        parent_addr: &str,
    ) -> Result<Vec<DeviceRow>>;

    /// Insert a row. The returned row carries the assigned id.
    async fn create(&self, row: &DeviceRow) -> Result<DeviceRow>;

    /// Write `changes` to an existing row and return the row as stored.
    async fn update(
        &self,
        compute_node_id: Option<i64>,
        address: &str,
        changes: &DeviceChanges,
    ) -> Result<DeviceRow>;

    /// Hard-delete a row.
    async fn destroy(&self, compute_node_id: Option<i64>, address: &str) -> Result<()>;

    /// Set `uuid` on row `id` only while its uuid is still null. Returns whether this
    /// call wrote it.
    async fn set_uuid_if_null(&self, id: i64, uuid: Uuid) -> Result<bool>;

    /// Ids of up to `limit` rows without a uuid, lowest first.
    async fn ids_missing_uuid(&self, limit: usize) -> Result<Vec<i64>>;
}

/// SQLite-backed device store.
#[derive(Clone)]
pub struct StateManager {
    pool: SqlitePool,
}

impl StateManager {
    /// Create a new StateManager with an in-memory database (for tests).
    pub async fn new_in_memory() -> Result<Self> {
        Self::new(":memory:").await
    }

    /// Get a reference to the underlying SQLite pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a new StateManager with a database at the specified path.
    #[instrument(skip(db_path))]
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        info!("Initializing state manager at {:?}", db_path);

        if db_path != Path::new(":memory:") {
            if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| TrackerError::IoError { path: parent.to_path_buf(), source: e })?;
            }
        }

        let mut options = SqliteConnectOptions::from_str(db_path.to_str().ok_or_else(|| {
            TrackerError::InvalidConfig { reason: "Invalid database path".to_string() }
        })?)
        .map_err(|e| TrackerError::DatabaseError(e.to_string()))?;

        options = options.create_if_missing(true).log_statements(tracing::log::LevelFilter::Debug);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| TrackerError::DatabaseError(e.to_string()))?;

        let manager = Self { pool };
        manager.run_migrations().await?;

        info!("State manager initialized successfully");
        Ok(manager)
    }

    #[instrument(skip(self))]
    async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");
        migrations::run(&self.pool).await?;
        info!("Database migrations complete");
        Ok(())
    }

    async fn id_for_key(&self, compute_node_id: Option<i64>, address: &str) -> Result<i64> {
        let id: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM pci_devices WHERE compute_node_id IS ? AND address = ?",
        )
        .bind(compute_node_id)
        .bind(address)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("lookup_device"))?;

        id.ok_or_else(|| TrackerError::DeviceNotFound {
            compute_node_id,
            address: address.to_string(),
        })
    }

    fn row_to_device(row: &SqliteRow) -> Result<DeviceRow> {
        let uuid: Option<String> = column(row, "uuid")?;
        let uuid = uuid
            .map(|u| Uuid::parse_str(&u))
            .transpose()
            .map_err(|e| TrackerError::DatabaseError(format!("Invalid uuid column: {}", e)))?;
        let dev_type: String = column(row, "dev_type")?;
        let status: String = column(row, "status")?;

        Ok(DeviceRow {
            id: column(row, "id")?,
            uuid,
            compute_node_id: column(row, "compute_node_id")?,
            address: column(row, "address")?,
            vendor_id: column(row, "vendor_id")?,
            product_id: column(row, "product_id")?,
            dev_type: dev_type.parse()?,
            status: status.parse()?,
            dev_id: column(row, "dev_id")?,
            label: column(row, "label")?,
            instance_uuid: column(row, "instance_uuid")?,
            request_id: column(row, "request_id")?,
            extra_info: column(row, "extra_info")?,
            numa_node: column(row, "numa_node")?,
            parent_addr: column(row, "parent_addr")?,
        })
    }

    async fn fetch_rows<'q>(
        &self,
        operation: &'static str,
        query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    ) -> Result<Vec<DeviceRow>> {
        let rows = query.fetch_all(&self.pool).await.map_err(db_error(operation))?;
        rows.iter().map(Self::row_to_device).collect()
    }
}

#[async_trait]
impl DeviceStore for StateManager {
    #[instrument(skip(self))]
    async fn get_by_address(
        &self,
        compute_node_id: Option<i64>,
        address: &str,
    ) -> Result<DeviceRow> {
        let row =
            sqlx::query("SELECT * FROM pci_devices WHERE compute_node_id IS ? AND address = ?")
                .bind(compute_node_id)
                .bind(address)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error("get_by_address"))?;

        match row {
            Some(row) => Self::row_to_device(&row),
            None => Err(TrackerError::DeviceNotFound {
                compute_node_id,
                address: address.to_string(),
            }),
        }
    }

    #[instrument(skip(self))]
    async fn get_by_id(&self, id: i64) -> Result<DeviceRow> {
        let row = sqlx::query("SELECT * FROM pci_devices WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("get_by_id"))?;

        match row {
            Some(row) => Self::row_to_device(&row),
            None => Err(TrackerError::DeviceNotFoundById { id }),
        }
    }

    #[instrument(skip(self))]
    async fn get_all_by_node(&self, compute_node_id: i64) -> Result<Vec<DeviceRow>> {
        let query = sqlx::query("SELECT * FROM pci_devices WHERE compute_node_id = ? ORDER BY id")
            .bind(compute_node_id);
        self.fetch_rows("get_all_by_node", query).await
    }

    #[instrument(skip(self))]
    async fn get_all_by_instance(&self, instance_uuid: &str) -> Result<Vec<DeviceRow>> {
        let query = sqlx::query("SELECT * FROM pci_devices WHERE instance_uuid = ? ORDER BY id")
            .bind(instance_uuid);
        self.fetch_rows("get_all_by_instance", query).await
    }

    #[instrument(skip(self))]
    async fn get_all_by_parent_address(
        &self,
        compute_node_id: i64,
        parent_addr: &str,
    ) -> Result<Vec<DeviceRow>> {
        let query = sqlx::query(
            "SELECT * FROM pci_devices WHERE compute_node_id = ? AND parent_addr = ? ORDER BY id",
        )
        .bind(compute_node_id)
        .bind(parent_addr);
        self.fetch_rows("get_all_by_parent_address", query).await
    }

    #[instrument(skip(self, row), fields(address = %row.address))]
    async fn create(&self, row: &DeviceRow) -> Result<DeviceRow> {
        let result = sqlx::query(
            r#"
            INSERT INTO pci_devices (uuid, compute_node_id, address, vendor_id, product_id,
                dev_type, status, dev_id, label, instance_uuid, request_id, extra_info,
                numa_node, parent_addr)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(row.uuid.map(|u| u.to_string()))
        .bind(row.compute_node_id)
        .bind(&row.address)
        .bind(&row.vendor_id)
        .bind(&row.product_id)
        .bind(row.dev_type.as_str())
        .bind(row.status.as_str())
        .bind(&row.dev_id)
        .bind(&row.label)
        .bind(&row.instance_uuid)
        .bind(&row.request_id)
        .bind(&row.extra_info)
        .bind(row.numa_node)
        .bind(&row.parent_addr)
        .execute(&self.pool)
        .await
        .map_err(db_error("create"))?;

        self.get_by_id(result.last_insert_rowid()).await
    }

    #[instrument(skip(self, changes), fields(columns = changes.len()))]
    async fn update(
        &self,
        compute_node_id: Option<i64>,
        address: &str,
        changes: &DeviceChanges,
    ) -> Result<DeviceRow> {
        if changes.contains_key(&DeviceField::Id) {
            return Err(TrackerError::DatabaseError("column id is read-only".to_string()));
        }

        let id = self.id_for_key(compute_node_id, address).await?;
        if changes.is_empty() {
            return self.get_by_id(id).await;
        }

        let assignments: Vec<String> =
            changes.keys().map(|field| format!("{} = ?", field.name())).collect();
        let sql = format!("UPDATE pci_devices SET {} WHERE id = ?", assignments.join(", "));

        let mut query = sqlx::query(&sql);
        for value in changes.values() {
            query = match value {
                ColumnValue::Null => query.bind(None::<String>),
                ColumnValue::Integer(i) => query.bind(*i),
                ColumnValue::Text(s) => query.bind(s.as_str()),
            };
        }
        query.bind(id).execute(&self.pool).await.map_err(db_error("update"))?;

        self.get_by_id(id).await
    }

    #[instrument(skip(self))]
    async fn destroy(&self, compute_node_id: Option<i64>, address: &str) -> Result<()> {
        let result =
            sqlx::query("DELETE FROM pci_devices WHERE compute_node_id IS ? AND address = ?")
                .bind(compute_node_id)
                .bind(address)
                .execute(&self.pool)
                .await
                .map_err(db_error("destroy"))?;

        if result.rows_affected() == 0 {
            return Err(TrackerError::DeviceNotFound {
                compute_node_id,
                address: address.to_string(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_uuid_if_null(&self, id: i64, uuid: Uuid) -> Result<bool> {
        let result = sqlx::query("UPDATE pci_devices SET uuid = ? WHERE id = ? AND uuid IS NULL")
            .bind(uuid.to_string())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_error("set_uuid_if_null"))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn ids_missing_uuid(&self, limit: usize) -> Result<Vec<i64>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        sqlx::query_scalar::<_, i64>(
            "SELECT id FROM pci_devices WHERE uuid IS NULL ORDER BY id LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("ids_missing_uuid"))
    }
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| TrackerError::DatabaseError(format!("Failed to read column {}: {}", name, e)))
}

fn db_error(operation: &'static str) -> impl FnOnce(sqlx::Error) -> TrackerError {
    move |e| {
        metrics::counter!("pcitrack_db_errors_total", "operation" => operation).increment(1);
        TrackerError::DatabaseError(e.to_string())
    }
}
