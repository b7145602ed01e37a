//! Device-level persistence on top of a [`DeviceStore`].

use super::DeviceStore;
use crate::error::{Result, TrackerError};
use crate::tree::DeviceCollection;
use crate::types::{DeviceRow, DeviceStatus, PciDevice};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Compare-and-swap attempts before giving up on a uuid backfill.
const UUID_CAS_ATTEMPTS: usize = 2;

/// Assign a uuid to a legacy row that has none.
///
/// The write only lands while the row's uuid is still null. When a concurrent writer wins,
/// its uuid is read back and returned instead.
#[instrument(skip(store))]
pub async fn create_uuid(store: &dyn DeviceStore, id: i64) -> Result<Uuid> {
    for attempt in 1..=UUID_CAS_ATTEMPTS {
        let candidate = Uuid::new_v4();
        if store.set_uuid_if_null(id, candidate).await? {
            metrics::counter!("pcitrack_uuid_backfill_total", "outcome" => "assigned")
                .increment(1);
            debug!(uuid = %candidate, "Assigned uuid to legacy device row");
            return Ok(candidate);
        }

        if let Some(winner) = store.get_by_id(id).await?.uuid {
            metrics::counter!("pcitrack_uuid_backfill_total", "outcome" => "lost_race")
                .increment(1);
            debug!(uuid = %winner, "Concurrent writer assigned uuid first");
            return Ok(winner);
        }

        warn!(attempt, "uuid compare-and-swap did not apply and the row still has no uuid");
    }

    metrics::counter!("pcitrack_uuid_backfill_total", "outcome" => "conflict").increment(1);
    Err(TrackerError::UuidBackfillConflict { id })
}

/// Build a device from a stored row, backfilling a missing uuid first.
pub async fn device_from_row(store: &dyn DeviceStore, mut row: DeviceRow) -> Result<PciDevice> {
    if row.uuid.is_none() {
        if let Some(id) = row.id {
            row.uuid = Some(create_uuid(store, id).await?);
        }
    }
    PciDevice::from_row(row)
}

pub async fn get_by_address(
    store: &dyn DeviceStore,
    compute_node_id: Option<i64>,
    address: &str,
) -> Result<PciDevice> {
    let row = store.get_by_address(compute_node_id, address).await?;
    device_from_row(store, row).await
}

pub async fn get_by_id(store: &dyn DeviceStore, id: i64) -> Result<PciDevice> {
    let row = store.get_by_id(id).await?;
    device_from_row(store, row).await
}

/// Persist a device.
///
/// - REMOVED: the row is destroyed and the device becomes DELETED
/// - DELETED: nothing to do
/// - never saved: the row is created
/// - otherwise: only changed columns are written
///
/// A missing uuid is assigned before any other column is written. On success the device
/// reflects the stored row.
#[instrument(skip(store, device), fields(address = %device.address))]
pub async fn save_device(store: &dyn DeviceStore, device: &mut PciDevice) -> Result<()> {
    match device.status {
        DeviceStatus::Deleted => return Ok(()),
        DeviceStatus::Removed => {
            if device.is_persisted() {
                let (compute_node_id, address) = device.persisted_key();
                let address = address.to_string();
                store.destroy(compute_node_id, &address).await?;
            }
            device.status = DeviceStatus::Deleted;
            device.reset_changes();
            info!("Deleted removed device");
            return Ok(());
        }
        _ => {}
    }

    if !device.is_persisted() {
        if device.uuid.is_none() {
            device.uuid = Some(Uuid::new_v4());
        }
        let row = store.create(&device.to_row()).await?;
        device.reload(row)?;
        debug!(id = ?device.id, "Created device row");
        return Ok(());
    }

    if device.uuid.is_none() {
        if let Some(id) = device.id {
            let uuid = create_uuid(store, id).await?;
            device.mark_uuid_persisted(uuid);
        }
    }

    let changes = device.changes();
    if changes.is_empty() {
        return Ok(());
    }

    let (compute_node_id, address) = device.persisted_key();
    let address = address.to_string();
    let row = store.update(compute_node_id, &address, &changes).await?;
    device.reload(row)?;
    debug!(columns = changes.len(), "Updated device row");
    Ok(())
}

/// Backfill uuids on up to `max_count` legacy rows. Returns `(found, done)`.
#[instrument(skip(store))]
pub async fn populate_dev_uuids(
    store: &dyn DeviceStore,
    max_count: usize,
) -> Result<(usize, usize)> {
    let ids = store.ids_missing_uuid(max_count).await?;
    let found = ids.len();
    let mut done = 0;

    for id in ids {
        match create_uuid(store, id).await {
            Ok(_) => done += 1,
            // Deleted between listing and backfill
            Err(TrackerError::DeviceNotFoundById { .. }) => debug!(id, "Device row vanished"),
            Err(e) => return Err(e),
        }
    }

    info!(found, done, "Populated device uuids");
    Ok((found, done))
}

async fn collect(store: &dyn DeviceStore, rows: Vec<DeviceRow>) -> Result<DeviceCollection> {
    let mut collection = DeviceCollection::new();
    for row in rows {
        collection.push_unlinked(device_from_row(store, row).await?);
    }
    collection.link_tree();
    Ok(collection)
}

/// Every device of a node, linked into its PF/VF tree.
pub async fn devices_by_node(
    store: &dyn DeviceStore,
    compute_node_id: i64,
) -> Result<DeviceCollection> {
    let rows = store.get_all_by_node(compute_node_id).await?;
    collect(store, rows).await
}

/// Devices owned by an instance.
pub async fn devices_by_instance(
    store: &dyn DeviceStore,
    instance_uuid: &str,
) -> Result<DeviceCollection> {
    let rows = store.get_all_by_instance(instance_uuid).await?;
    collect(store, rows).await
}

/// VFs of one PF.
pub async fn devices_by_parent_address(
    store: &dyn DeviceStore,
    compute_node_id: i64,
    parent_addr: &str,
) -> Result<DeviceCollection> {
    let rows = store.get_all_by_parent_address(compute_node_id, parent_addr).await?;
    collect(store, rows).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStore;
    use crate::testing::device;
    use crate::types::{DeviceChanges, DeviceField};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn legacy_row(address: &str) -> DeviceRow {
        let mut row = device(1, address, "type-VF", Some("0000:01:00.0")).to_row();
        row.uuid = None;
        row
    }

    /// Store whose uuid writes lose to a concurrent writer.
    struct RacingStore {
        inner: MemoryStore,
        winner: Option<Uuid>,
        cas_calls: AtomicUsize,
    }

    impl RacingStore {
        fn new(winner: Option<Uuid>) -> Self {
            Self { inner: MemoryStore::new(), winner, cas_calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl DeviceStore for RacingStore {
        async fn get_by_address(&self, node: Option<i64>, address: &str) -> Result<DeviceRow> {
            self.inner.get_by_address(node, address).await
        }

        async fn get_by_id(&self, id: i64) -> Result<DeviceRow> {
            self.inner.get_by_id(id).await
        }

        async fn get_all_by_node(&self, node: i64) -> Result<Vec<DeviceRow>> {
            self.inner.get_all_by_node(node).await
        }

        async fn get_all_by_instance(&self, instance_uuid: &str) -> Result<Vec<DeviceRow>> {
            self.inner.get_all_by_instance(instance_uuid).await
        }

        async fn get_all_by_parent_address(
            &self,
            node: i64,
            parent_addr: &str,
        ) -> Result<Vec<DeviceRow>> {
            self.inner.get_all_by_parent_address(node, parent_addr).await
        }

        async fn create(&self, row: &DeviceRow) -> Result<DeviceRow> {
            self.inner.create(row).await
        }

        async fn update(
            &self,
            node: Option<i64>,
            address: &str,
            changes: &DeviceChanges,
        ) -> Result<DeviceRow> {
            self.inner.update(node, address, changes).await
        }

        async fn destroy(&self, node: Option<i64>, address: &str) -> Result<()> {
            self.inner.destroy(node, address).await
        }

        async fn set_uuid_if_null(&self, id: i64, _uuid: Uuid) -> Result<bool> {
            self.cas_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(winner) = self.winner {
                self.inner.set_uuid_if_null(id, winner).await?;
            }
            Ok(false)
        }

        async fn ids_missing_uuid(&self, limit: usize) -> Result<Vec<i64>> {
            self.inner.ids_missing_uuid(limit).await
        }
    }

    #[tokio::test]
    async fn test_create_uuid_assigns_once() {
        let store = MemoryStore::new();
        let row = store.insert_raw(legacy_row("0000:01:00.1")).unwrap();
        let id = row.id.unwrap();

        let uuid = create_uuid(&store, id).await.unwrap();
        assert_eq!(store.get_by_id(id).await.unwrap().uuid, Some(uuid));

        // A second backfill returns the stored value
        assert_eq!(create_uuid(&store, id).await.unwrap(), uuid);
    }

    #[tokio::test]
    async fn test_create_uuid_returns_concurrent_winner() {
        let winner = Uuid::new_v4();
        let store = RacingStore::new(Some(winner));
        let id = store.inner.insert_raw(legacy_row("0000:01:00.1")).unwrap().id.unwrap();

        assert_eq!(create_uuid(&store, id).await.unwrap(), winner);
        assert_eq!(store.cas_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_create_uuid_retries_once_then_fails() {
        let store = RacingStore::new(None);
        let id = store.inner.insert_raw(legacy_row("0000:01:00.1")).unwrap().id.unwrap();

        let err = create_uuid(&store, id).await.unwrap_err();
        assert!(matches!(err, TrackerError::UuidBackfillConflict { id: failed } if failed == id));
        assert_eq!(store.cas_calls.load(Ordering::SeqCst), UUID_CAS_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_create_uuid_missing_row() {
        let store = MemoryStore::new();
        let err = create_uuid(&store, 42).await.unwrap_err();
        assert!(matches!(err, TrackerError::DeviceNotFoundById { id: 42 }));
    }

    #[tokio::test]
    async fn test_load_backfills_legacy_uuid() {
        let store = MemoryStore::new();
        store.insert_raw(legacy_row("0000:01:00.1")).unwrap();

        let dev = get_by_address(&store, Some(1), "0000:01:00.1").await.unwrap();
        let stored = store.get_by_address(Some(1), "0000:01:00.1").await.unwrap();
        assert!(dev.uuid.is_some());
        assert_eq!(dev.uuid, stored.uuid);
        // Backfill alone leaves nothing to save
        assert!(dev.changes().is_empty());
    }

    #[tokio::test]
    async fn test_save_creates_then_updates_changed_columns() {
        let store = MemoryStore::new();
        let mut dev = device(1, "0000:01:00.1", "type-VF", Some("0000:01:00.0"));
        assert!(dev.needs_save());

        save_device(&store, &mut dev).await.unwrap();
        assert!(dev.is_persisted());
        assert!(!dev.needs_save());

        dev.label = Some("fast-nic".to_string());
        assert_eq!(dev.changes().keys().copied().collect::<Vec<_>>(), vec![DeviceField::Label]);
        save_device(&store, &mut dev).await.unwrap();

        let stored = store.get_by_address(Some(1), "0000:01:00.1").await.unwrap();
        assert_eq!(stored.label.as_deref(), Some("fast-nic"));
        assert_eq!(stored.uuid, dev.uuid);
        assert!(dev.changes().is_empty());
    }

    #[tokio::test]
    async fn test_save_backfills_uuid_before_update() {
        let store = MemoryStore::new();
        let row = store.insert_raw(legacy_row("0000:01:00.1")).unwrap();
        // Bypass the load path so the device still lacks a uuid
        let mut dev = PciDevice::from_row(row).unwrap();
        dev.numa_node = Some(1);

        save_device(&store, &mut dev).await.unwrap();
        let stored = store.get_by_address(Some(1), "0000:01:00.1").await.unwrap();
        assert!(stored.uuid.is_some());
        assert_eq!(stored.uuid, dev.uuid);
        assert_eq!(stored.numa_node, Some(1));
    }

    #[tokio::test]
    async fn test_save_removed_deletes_row() {
        let store = MemoryStore::new();
        let mut dev = device(1, "0000:01:00.1", "type-VF", None);
        save_device(&store, &mut dev).await.unwrap();

        dev.remove().unwrap();
        save_device(&store, &mut dev).await.unwrap();
        assert_eq!(dev.status, DeviceStatus::Deleted);
        assert!(store.is_empty());

        // Saving a deleted device is a no-op
        save_device(&store, &mut dev).await.unwrap();
        assert!(!dev.needs_save());
    }

    #[tokio::test]
    async fn test_update_uses_stored_key_after_address_change() {
        let store = MemoryStore::new();
        let mut dev = device(1, "0000:01:00.1", "type-PCI", None);
        save_device(&store, &mut dev).await.unwrap();

        dev.address = "0000:01:00.7".to_string();
        save_device(&store, &mut dev).await.unwrap();
        assert!(store.get_by_address(Some(1), "0000:01:00.1").await.is_err());
        assert!(store.get_by_address(Some(1), "0000:01:00.7").await.is_ok());
    }

    #[tokio::test]
    async fn test_populate_dev_uuids_in_batches() {
        let store = MemoryStore::new();
        for func in 1..=3 {
            store.insert_raw(legacy_row(&format!("0000:01:00.{}", func))).unwrap();
        }

        assert_eq!(populate_dev_uuids(&store, 2).await.unwrap(), (2, 2));
        assert_eq!(populate_dev_uuids(&store, 2).await.unwrap(), (1, 1));
        assert_eq!(populate_dev_uuids(&store, 2).await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn test_loaders_link_tree() {
        let store = MemoryStore::new();
        let mut pf = device(1, "0000:01:00.0", "type-PF", None);
        let mut vf = device(1, "0000:01:00.1", "type-VF", Some("0000:01:00.0"));
        let mut other = device(2, "0000:01:00.1", "type-PCI", None);
        vf.instance_uuid = Some("inst-1".to_string());
        vf.status = DeviceStatus::Allocated;
        for dev in [&mut pf, &mut vf, &mut other] {
            save_device(&store, dev).await.unwrap();
        }

        let node = devices_by_node(&store, 1).await.unwrap();
        assert_eq!(node.len(), 2);
        let pf_key = node.find(Some(1), "0000:01:00.0").unwrap();
        let vf_key = node.find(Some(1), "0000:01:00.1").unwrap();
        assert_eq!(node.parent_of(vf_key), Some(pf_key));

        let owned = devices_by_instance(&store, "inst-1").await.unwrap();
        assert_eq!(owned.len(), 1);

        let children = devices_by_parent_address(&store, 1, "0000:01:00.0").await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children.iter().next().map(|(_, d)| d.address.as_str()), Some("0000:01:00.1"));
    }
}
