//! Per-node device tracking.
//!
//! A [`NodeTracker`] owns the device collection of one compute node and writes every
//! state change through its [`DeviceStore`]. Callers serialize access per node; the
//! tracker itself takes `&mut self` for every mutation.

use crate::error::{Result, TrackerError};
use crate::observability::metrics::set_device_count;
use crate::state::{devices_by_node, save_device, DeviceStore};
use crate::tree::{DeviceCollection, DeviceKey};
use crate::types::{normalize_pci_address, DeviceAttrs, DeviceStatus, Instance, PciDevice};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Outcome of a discovery pass, as device addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    /// Gone from discovery but still owned, so left in place
    pub kept: Vec<String>,
}

pub struct NodeTracker {
    compute_node_id: i64,
    store: Arc<dyn DeviceStore>,
    devices: DeviceCollection,
}

impl NodeTracker {
    /// Load every stored device of `compute_node_id`.
    #[instrument(skip(store))]
    pub async fn load(store: Arc<dyn DeviceStore>, compute_node_id: i64) -> Result<Self> {
        let devices = devices_by_node(store.as_ref(), compute_node_id).await?;
        info!(count = devices.len(), "Loaded node devices");

        let tracker = Self { compute_node_id, store, devices };
        tracker.update_gauges();
        Ok(tracker)
    }

    pub fn compute_node_id(&self) -> i64 {
        self.compute_node_id
    }

    pub fn devices(&self) -> &DeviceCollection {
        &self.devices
    }

    /// Look up a device of this node by address.
    pub fn device(&self, address: &str) -> Result<&PciDevice> {
        let key = self.key(address)?;
        Ok(&self.devices[key])
    }

    fn key(&self, address: &str) -> Result<DeviceKey> {
        let address = normalize_pci_address(address)?;
        self.devices.find(Some(self.compute_node_id), &address).ok_or(
            TrackerError::DeviceNotFound { compute_node_id: Some(self.compute_node_id), address },
        )
    }

    /// Claim a device for `instance_uuid` and persist the affected devices.
    #[instrument(skip(self), fields(node = self.compute_node_id))]
    pub async fn claim(&mut self, address: &str, instance_uuid: &str) -> Result<()> {
        let key = self.key(address)?;
        self.devices.claim(key, instance_uuid)?;
        self.persist_dirty().await.map(|_| ())
    }

    /// Allocate a device to `instance` and persist the affected devices.
    #[instrument(
        skip(self, instance),
        fields(node = self.compute_node_id, instance = %instance.uuid)
    )]
    pub async fn allocate(&mut self, address: &str, instance: &mut Instance) -> Result<()> {
        let key = self.key(address)?;
        self.devices.allocate(key, instance)?;
        self.persist_dirty().await.map(|_| ())
    }

    /// Free a device and persist the affected devices.
    ///
    /// Returns the addresses whose status changed, cascaded devices first.
    #[instrument(skip(self, instance), fields(node = self.compute_node_id))]
    pub async fn free(
        &mut self,
        address: &str,
        instance: Option<&mut Instance>,
    ) -> Result<Vec<String>> {
        let key = self.key(address)?;
        let changed = self.devices.free(key, instance)?;
        let addresses = changed.iter().map(|k| self.devices[*k].address.clone()).collect();
        self.persist_dirty().await?;
        Ok(addresses)
    }

    /// Remove a device and delete it from storage.
    #[instrument(skip(self), fields(node = self.compute_node_id))]
    pub async fn remove(&mut self, address: &str) -> Result<()> {
        let key = self.key(address)?;
        self.devices.remove(key)?;
        self.persist_dirty().await.map(|_| ())
    }

    /// Persist every device with unsaved changes. Returns how many were written.
    pub async fn save_all(&mut self) -> Result<usize> {
        self.persist_dirty().await
    }

    /// Merge one discovery pass into the tracked devices.
    ///
    /// Known addresses are updated, new ones created, and devices missing from `discovered`
    /// are removed. Owned devices that vanished are kept and logged. Everything is then
    /// persisted.
    #[instrument(
        skip(self, discovered),
        fields(node = self.compute_node_id, count = discovered.len())
    )]
    pub async fn reconcile(&mut self, discovered: &[DeviceAttrs]) -> Result<ReconcileReport> {
        let mut incoming: BTreeMap<String, DeviceAttrs> = BTreeMap::new();
        for attrs in discovered {
            let address = attrs.get("address").and_then(Value::as_str).ok_or_else(|| {
                TrackerError::invalid_primitive("discovered device lacks an address")
            })?;
            let address = normalize_pci_address(address)?;
            let mut attrs = attrs.clone();
            attrs.insert("address".to_string(), Value::from(address.clone()));
            attrs.insert("compute_node_id".to_string(), Value::from(self.compute_node_id));
            incoming.insert(address, attrs);
        }

        let mut report = ReconcileReport::default();

        // Stage every change on copies so a bad entry leaves the collection untouched
        let mut removals: Vec<(DeviceKey, PciDevice)> = Vec::new();
        let vanished = self
            .devices
            .iter()
            .filter(|(_, d)| !matches!(d.status, DeviceStatus::Deleted | DeviceStatus::Removed))
            .filter(|(_, d)| !incoming.contains_key(&d.address));
        for (key, device) in vanished {
            let mut removed = device.clone();
            match removed.remove() {
                Ok(()) => {
                    report.removed.push(device.address.clone());
                    removals.push((key, removed));
                }
                Err(
                    e @ (TrackerError::InvalidStatus { .. } | TrackerError::InvalidOwner { .. }),
                ) => {
                    warn!(
                        address = %device.address,
                        status = %device.status,
                        instance_uuid = ?device.instance_uuid,
                        error = %e,
                        "Unable to remove device that is no longer reported; delete or migrate \
                         its owner to release it"
                    );
                    report.kept.push(device.address.clone());
                }
                Err(e) => return Err(e),
            }
        }

        let mut updates: Vec<(DeviceKey, PciDevice)> = Vec::new();
        let mut additions: Vec<PciDevice> = Vec::new();
        for (address, attrs) in incoming {
            match self.devices.find(Some(self.compute_node_id), &address) {
                Some(key) => {
                    let mut updated = self.devices[key].clone();
                    updated.update_device(&attrs)?;
                    if !updated.changes().is_empty() {
                        report.updated.push(address);
                    }
                    updates.push((key, updated));
                }
                None => {
                    additions.push(PciDevice::create(&attrs)?);
                    report.added.push(address);
                }
            }
        }

        for (key, device) in removals.into_iter().chain(updates) {
            if let Some(slot) = self.devices.get_mut(key) {
                *slot = device;
            }
        }
        for device in additions {
            self.devices.push_unlinked(device);
        }
        self.devices.link_tree();

        self.persist_dirty().await?;
        info!(
            added = report.added.len(),
            updated = report.updated.len(),
            removed = report.removed.len(),
            kept = report.kept.len(),
            "Reconciled discovered devices"
        );
        Ok(report)
    }

    /// Number of tracked devices per status.
    pub fn status_counts(&self) -> BTreeMap<DeviceStatus, usize> {
        let mut counts = BTreeMap::new();
        for (_, device) in self.devices.iter() {
            *counts.entry(device.status).or_insert(0) += 1;
        }
        counts
    }

    /// Save every device that needs it. All saves are attempted; the first error is
    /// returned after the rest have run.
    async fn persist_dirty(&mut self) -> Result<usize> {
        let mut saved = 0;
        let mut first_error = None;

        for device in self.devices.iter_mut() {
            if !device.needs_save() {
                continue;
            }
            match save_device(self.store.as_ref(), device).await {
                Ok(()) => saved += 1,
                Err(e) => {
                    warn!(address = %device.address, error = %e, "Failed to persist device");
                    first_error.get_or_insert(e);
                }
            }
        }

        self.devices.retain_live();
        self.update_gauges();
        debug!(saved, "Persisted changed devices");

        match first_error {
            Some(e) => Err(e),
            None => Ok(saved),
        }
    }

    fn update_gauges(&self) {
        let counts = self.status_counts();
        for status in DeviceStatus::ALL {
            set_device_count(status, counts.get(&status).copied().unwrap_or(0));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStore;
    use crate::testing::{attrs, device};
    use crate::types::{DeviceChanges, DeviceRow};
    use async_trait::async_trait;
    use serde_json::json;
    use uuid::Uuid;

    const PF: &str = "0000:01:00.0";
    const VF1: &str = "0000:01:00.1";
    const VF2: &str = "0000:01:00.2";

    async fn seeded(store: Arc<dyn DeviceStore>) -> NodeTracker {
        for (address, dev_type, parent) in
            [(PF, "type-PF", None), (VF1, "type-VF", Some(PF)), (VF2, "type-VF", Some(PF))]
        {
            let mut dev = device(1, address, dev_type, parent);
            save_device(store.as_ref(), &mut dev).await.unwrap();
        }
        NodeTracker::load(store, 1).await.unwrap()
    }

    fn discovered(address: &str, dev_type: &str, parent: Option<&str>) -> DeviceAttrs {
        let mut value = json!({
            "address": address,
            "vendor_id": "8086",
            "product_id": "1528",
            "dev_type": dev_type,
        });
        if let Some(parent) = parent {
            value["parent_addr"] = json!(parent);
        }
        attrs(value)
    }

    #[tokio::test]
    async fn test_operations_persist_cascades() {
        let store = Arc::new(MemoryStore::new());
        let mut tracker = seeded(store.clone()).await;
        let mut inst = Instance::new("inst-1");

        tracker.claim(VF1, "inst-1").await.unwrap();
        let pf = store.get_by_address(Some(1), PF).await.unwrap();
        assert_eq!(pf.status, DeviceStatus::Unclaimable);
        let vf1 = store.get_by_address(Some(1), VF1).await.unwrap();
        assert_eq!(vf1.status, DeviceStatus::Claimed);
        assert_eq!(vf1.instance_uuid.as_deref(), Some("inst-1"));

        tracker.allocate(VF1, &mut inst).await.unwrap();
        let pf = store.get_by_address(Some(1), PF).await.unwrap();
        assert_eq!(pf.status, DeviceStatus::Unavailable);
        assert_eq!(inst.pci_devices.len(), 1);

        let changed = tracker.free(VF1, Some(&mut inst)).await.unwrap();
        assert_eq!(changed, vec![PF.to_string(), VF1.to_string()]);
        assert!(inst.pci_devices.is_empty());
        for address in [PF, VF1, VF2] {
            let row = store.get_by_address(Some(1), address).await.unwrap();
            assert_eq!(row.status, DeviceStatus::Available);
            assert_eq!(row.instance_uuid, None);
        }
    }

    #[tokio::test]
    async fn test_failed_operation_persists_nothing() {
        let store = Arc::new(MemoryStore::new());
        let mut tracker = seeded(store.clone()).await;
        let mut other = Instance::new("inst-2");

        tracker.claim(VF1, "inst-1").await.unwrap();
        let err = tracker.allocate(VF1, &mut other).await.unwrap_err();
        assert!(matches!(err, TrackerError::InvalidOwner { .. }));
        let vf1 = store.get_by_address(Some(1), VF1).await.unwrap();
        assert_eq!(vf1.status, DeviceStatus::Claimed);

        let err = tracker.claim("0000:07:00.0", "inst-1").await.unwrap_err();
        assert!(matches!(err, TrackerError::DeviceNotFound { .. }));
        let err = tracker.claim("bogus", "inst-1").await.unwrap_err();
        assert!(matches!(err, TrackerError::InvalidAddress { .. }));
    }

    #[tokio::test]
    async fn test_remove_deletes_from_store_and_memory() {
        let store = Arc::new(MemoryStore::new());
        let mut tracker = seeded(store.clone()).await;

        tracker.remove(VF2).await.unwrap();
        assert!(store.get_by_address(Some(1), VF2).await.is_err());
        assert!(tracker.device(VF2).is_err());
        assert_eq!(tracker.devices().len(), 2);
        let pf = tracker.devices().find(Some(1), PF).unwrap();
        assert_eq!(tracker.devices().children_of(pf).len(), 1);
    }

    #[tokio::test]
    async fn test_reconcile() {
        let store = Arc::new(MemoryStore::new());
        let mut tracker = seeded(store.clone()).await;
        tracker.claim(VF1, "inst-1").await.unwrap();

        // VF1 and VF2 vanish, a standard device appears, PF gains a label
        let mut pf = discovered(PF, "type-PF", None);
        pf.insert("label".to_string(), json!("uplink"));
        let report = tracker
            .reconcile(&[pf, discovered("0000:05:00.0", "type-PCI", None)])
            .await
            .unwrap();

        assert_eq!(report.added, vec!["0000:05:00.0".to_string()]);
        assert_eq!(report.updated, vec![PF.to_string()]);
        assert_eq!(report.removed, vec![VF2.to_string()]);
        assert_eq!(report.kept, vec![VF1.to_string()]);

        assert!(store.get_by_address(Some(1), VF2).await.is_err());
        let vf1 = store.get_by_address(Some(1), VF1).await.unwrap();
        assert_eq!(vf1.status, DeviceStatus::Claimed);
        let added = store.get_by_address(Some(1), "0000:05:00.0").await.unwrap();
        assert_eq!(added.status, DeviceStatus::Available);
        assert!(added.uuid.is_some());
        let pf = store.get_by_address(Some(1), PF).await.unwrap();
        assert_eq!(pf.label.as_deref(), Some("uplink"));

        // A second identical pass changes nothing
        let mut pf = discovered(PF, "type-PF", None);
        pf.insert("label".to_string(), json!("uplink"));
        let again = tracker
            .reconcile(&[pf, discovered("0000:05:00.0", "type-PCI", None)])
            .await
            .unwrap();
        assert!(again.added.is_empty() && again.updated.is_empty() && again.removed.is_empty());
        assert_eq!(again.kept, vec![VF1.to_string()]);
    }

    #[tokio::test]
    async fn test_reconcile_rejects_discovery_without_address() {
        let store = Arc::new(MemoryStore::new());
        let mut tracker = seeded(store).await;
        let err = tracker.reconcile(&[attrs(json!({"vendor_id": "8086"}))]).await.unwrap_err();
        assert!(matches!(err, TrackerError::InvalidPrimitive { .. }));
        assert_eq!(tracker.devices().len(), 3);
    }

    #[tokio::test]
    async fn test_status_counts() {
        let store = Arc::new(MemoryStore::new());
        let mut tracker = seeded(store).await;
        tracker.claim(VF1, "inst-1").await.unwrap();

        let counts = tracker.status_counts();
        assert_eq!(counts.get(&DeviceStatus::Available), Some(&1));
        assert_eq!(counts.get(&DeviceStatus::Claimed), Some(&1));
        assert_eq!(counts.get(&DeviceStatus::Unclaimable), Some(&1));
    }

    #[tokio::test]
    async fn test_reconcile_with_bad_entry_changes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let mut tracker = seeded(store.clone()).await;

        let mut bad = discovered("0000:02:00.0", "type-PCI", None);
        bad.insert("numa_node".to_string(), json!("abc"));
        let mut pf = discovered(PF, "type-PF", None);
        pf.insert("label".to_string(), json!("uplink"));
        let err = tracker
            .reconcile(&[pf, discovered("0000:01:00.3", "type-VF", Some(PF)), bad])
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::InvalidPrimitive { .. }));

        // Nothing applied: VFs still tracked and linked, no new device, PF unchanged
        assert_eq!(tracker.devices().len(), 3);
        assert!(tracker.device("0000:01:00.3").is_err());
        assert_eq!(tracker.device(VF2).unwrap().status, DeviceStatus::Available);
        assert_eq!(tracker.device(PF).unwrap().label, None);
        assert!(!tracker.device(PF).unwrap().needs_save());
        assert_eq!(store.len(), 3);

        // The tree is intact, so claiming a VF still locks its PF
        tracker.claim(VF1, "inst-vf").await.unwrap();
        assert_eq!(tracker.device(PF).unwrap().status, DeviceStatus::Unclaimable);
        let pf = store.get_by_address(Some(1), PF).await.unwrap();
        assert_eq!(pf.status, DeviceStatus::Unclaimable);
    }

    /// Store that refuses updates to one address.
    struct FlakyStore {
        inner: MemoryStore,
        broken: &'static str,
    }

    #[async_trait]
    impl DeviceStore for FlakyStore {
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
            if address == self.broken {
                return Err(TrackerError::DatabaseError("disk I/O error".to_string()));
            }
            self.inner.update(node, address, changes).await
        }

        async fn destroy(&self, node: Option<i64>, address: &str) -> Result<()> {
            self.inner.destroy(node, address).await
        }

        async fn set_uuid_if_null(&self, id: i64, uuid: Uuid) -> Result<bool> {
            self.inner.set_uuid_if_null(id, uuid).await
        }

        async fn ids_missing_uuid(&self, limit: usize) -> Result<Vec<i64>> {
            self.inner.ids_missing_uuid(limit).await
        }
    }

    #[tokio::test]
    async fn test_persist_is_best_effort() {
        let store = Arc::new(FlakyStore { inner: MemoryStore::new(), broken: PF });
        let mut tracker = seeded(store.clone()).await;

        // The VF claim lands even though the cascaded PF write fails
        let err = tracker.claim(VF1, "inst-1").await.unwrap_err();
        assert!(matches!(err, TrackerError::DatabaseError(_)));
        assert_eq!(tracker.device(PF).unwrap().status, DeviceStatus::Unclaimable);
        let vf1 = store.inner.get_by_address(Some(1), VF1).await.unwrap();
        assert_eq!(vf1.status, DeviceStatus::Claimed);
        let pf = store.inner.get_by_address(Some(1), PF).await.unwrap();
        assert_eq!(pf.status, DeviceStatus::Available);

        // The PF stays dirty for the next save
        assert!(tracker.device(PF).unwrap().needs_save());
        assert!(tracker.save_all().await.is_err());
    }
}
