//! In-memory device store.

use super::DeviceStore;
use crate::error::{Result, TrackerError};
use crate::types::{DeviceChanges, DeviceField, DeviceRow};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Debug, Default)]
struct Table {
    next_id: i64,
    rows: BTreeMap<i64, DeviceRow>,
}

impl Table {
    fn id_for_key(&self, compute_node_id: Option<i64>, address: &str) -> Option<i64> {
        self.rows
            .values()
            .find(|r| r.compute_node_id == compute_node_id && r.address == address)
            .and_then(|r| r.id)
    }

    fn check_unique(&self, row: &DeviceRow, skip_id: Option<i64>) -> Result<()> {
        for other in self.rows.values().filter(|r| r.id != skip_id) {
            if other.compute_node_id == row.compute_node_id && other.address == row.address {
                return Err(TrackerError::DatabaseError(format!(
                    "UNIQUE constraint failed: compute_node_id, address ({})",
                    row.address
                )));
            }
            if row.uuid.is_some() && other.uuid == row.uuid {
                return Err(TrackerError::DatabaseError(
                    "UNIQUE constraint failed: pci_devices.uuid".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn select(&self, filter: impl Fn(&DeviceRow) -> bool) -> Vec<DeviceRow> {
        self.rows.values().filter(|r| filter(r)).cloned().collect()
    }
}

/// Device store backed by a map, with the same contract as the SQLite store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    table: Mutex<Table>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row as-is, keeping a null uuid. Used to stage rows written before uuids
    /// existed.
    pub fn insert_raw(&self, row: DeviceRow) -> Result<DeviceRow> {
        let mut table = self.lock()?;
        table.check_unique(&row, None)?;
        table.next_id += 1;
        let id = table.next_id;
        let mut row = row;
        row.id = Some(id);
        table.rows.insert(id, row.clone());
        Ok(row)
    }

    pub fn len(&self) -> usize {
        self.lock().map(|t| t.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, Table>> {
        self.table.lock().map_err(|_| TrackerError::Internal("device table lock poisoned".into()))
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn get_by_address(
        &self,
        compute_node_id: Option<i64>,
        address: &str,
    ) -> Result<DeviceRow> {
        let table = self.lock()?;
        table
            .id_for_key(compute_node_id, address)
            .and_then(|id| table.rows.get(&id).cloned())
            .ok_or_else(|| TrackerError::DeviceNotFound {
                compute_node_id,
                address: address.to_string(),
            })
    }

    async fn get_by_id(&self, id: i64) -> Result<DeviceRow> {
        self.lock()?.rows.get(&id).cloned().ok_or(TrackerError::DeviceNotFoundById { id })
    }

    async fn get_all_by_node(&self, compute_node_id: i64) -> Result<Vec<DeviceRow>> {
        Ok(self.lock()?.select(|r| r.compute_node_id == Some(compute_node_id)))
    }

    async fn get_all_by_instance(&self, instance_uuid: &str) -> Result<Vec<DeviceRow>> {
        Ok(self.lock()?.select(|r| r.instance_uuid.as_deref() == Some(instance_uuid)))
    }

    async fn get_all_by_parent_address(
        &self,
        compute_node_id: i64,
        parent_addr: &str,
    ) -> Result<Vec<DeviceRow>> {
        Ok(self.lock()?.select(|r| {
            r.compute_node_id == Some(compute_node_id)
                && r.parent_addr.as_deref() == Some(parent_addr)
        }))
    }

    async fn create(&self, row: &DeviceRow) -> Result<DeviceRow> {
        self.insert_raw(row.clone())
    }

    async fn update(
        &self,
        compute_node_id: Option<i64>,
        address: &str,
        changes: &DeviceChanges,
    ) -> Result<DeviceRow> {
        if changes.contains_key(&DeviceField::Id) {
            return Err(TrackerError::DatabaseError("column id is read-only".to_string()));
        }

        let mut table = self.lock()?;
        let id = table.id_for_key(compute_node_id, address).ok_or_else(|| {
            TrackerError::DeviceNotFound { compute_node_id, address: address.to_string() }
        })?;
        let mut updated = table.rows[&id].clone();
        updated.apply(changes)?;
        table.check_unique(&updated, Some(id))?;
        table.rows.insert(id, updated.clone());
        Ok(updated)
    }

    async fn destroy(&self, compute_node_id: Option<i64>, address: &str) -> Result<()> {
        let mut table = self.lock()?;
        let id = table.id_for_key(compute_node_id, address).ok_or_else(|| {
            TrackerError::DeviceNotFound { compute_node_id, address: address.to_string() }
        })?;
        table.rows.remove(&id);
        Ok(())
    }

    async fn set_uuid_if_null(&self, id: i64, uuid: Uuid) -> Result<bool> {
        let mut table = self.lock()?;
        match table.rows.get_mut(&id) {
            Some(row) if row.uuid.is_none() => {
                row.uuid = Some(uuid);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ids_missing_uuid(&self, limit: usize) -> Result<Vec<i64>> {
        let table = self.lock()?;
        Ok(table
            .rows
            .values()
            .filter(|r| r.uuid.is_none())
            .filter_map(|r| r.id)
            .take(limit)
            .collect())
    }
}
