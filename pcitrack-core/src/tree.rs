//! Device collections and the PF/VF tree.
//!
//! A [`DeviceCollection`] owns every loaded device in an arena. Parent/child links are
//! indices into that arena, rebuilt from `parent_addr` by [`DeviceCollection::link_tree`];
//! devices never hold references to each other.

use crate::types::{DeviceStatus, DeviceType, PciDevice};
use std::collections::HashMap;
use std::ops::Index;
use tracing::debug;

/// Handle to a device inside one [`DeviceCollection`].
///
/// Keys are only meaningful for the collection that issued them and are invalidated by
/// [`DeviceCollection::retain_live`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceKey(pub(crate) usize);

/// Devices of one node (or one instance) plus their parent/child linkage.
#[derive(Debug, Clone, Default)]
pub struct DeviceCollection {
    pub(crate) devices: Vec<PciDevice>,
    pub(crate) parents: Vec<Option<DeviceKey>>,
    pub(crate) children: Vec<Vec<DeviceKey>>,
}

impl DeviceCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a linked collection from devices, keeping their order.
    pub fn from_devices(devices: impl IntoIterator<Item = PciDevice>) -> Self {
        let mut collection = Self { devices: devices.into_iter().collect(), ..Self::default() };
        collection.link_tree();
        collection
    }

    /// Add a device and relink.
    pub fn push(&mut self, device: PciDevice) -> DeviceKey {
        let key = self.push_unlinked(device);
        self.link_tree();
        key
    }

    /// Add a device without relinking; call [`Self::link_tree`] once the batch is in.
    pub fn push_unlinked(&mut self, device: PciDevice) -> DeviceKey {
        self.devices.push(device);
        self.parents.push(None);
        self.children.push(Vec::new());
        DeviceKey(self.devices.len() - 1)
    }

    /// Rebuild parent/child links from `parent_addr`.
    ///
    /// Only PFs on the same compute node accept children. Children keep collection order.
    pub fn link_tree(&mut self) {
        let count = self.devices.len();
        self.parents = vec![None; count];
        self.children = vec![Vec::new(); count];

        let pfs: HashMap<(Option<i64>, &str), usize> = self
            .devices
            .iter()
            .enumerate()
            .filter(|(_, d)| d.dev_type == DeviceType::SriovPf)
            .map(|(idx, d)| ((d.compute_node_id, d.address.as_str()), idx))
            .collect();

        for (idx, device) in self.devices.iter().enumerate() {
            let Some(parent_addr) = device.parent_addr.as_deref() else {
                continue;
            };
            match pfs.get(&(device.compute_node_id, parent_addr)) {
                Some(&parent) if parent != idx => {
                    self.parents[idx] = Some(DeviceKey(parent));
                    self.children[parent].push(DeviceKey(idx));
                }
                _ => debug!(
                    address = %device.address,
                    parent_addr = %parent_addr,
                    "Parent device not present in collection"
                ),
            }
        }
    }

    /// Drop DELETED devices and relink. All previously issued keys become invalid.
    pub fn retain_live(&mut self) {
        self.devices.retain(|d| d.status != DeviceStatus::Deleted);
        self.link_tree();
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, key: DeviceKey) -> Option<&PciDevice> {
        self.devices.get(key.0)
    }

    /// Mutable access to a device. Changing `parent_addr`, `address` or `dev_type` requires
    /// a [`Self::link_tree`] afterwards.
    pub fn get_mut(&mut self, key: DeviceKey) -> Option<&mut PciDevice> {
        self.devices.get_mut(key.0)
    }

    /// Find a non-deleted device by node and address.
    pub fn find(&self, compute_node_id: Option<i64>, address: &str) -> Option<DeviceKey> {
        self.devices
            .iter()
            .position(|d| {
                d.status != DeviceStatus::Deleted
                    && d.compute_node_id == compute_node_id
                    && d.address == address
            })
            .map(DeviceKey)
    }

    /// Find the first non-deleted device with `address` on any node.
    pub fn find_by_address(&self, address: &str) -> Option<DeviceKey> {
        self.devices
            .iter()
            .position(|d| d.status != DeviceStatus::Deleted && d.address == address)
            .map(DeviceKey)
    }

    pub fn iter(&self) -> impl Iterator<Item = (DeviceKey, &PciDevice)> {
        self.devices.iter().enumerate().map(|(idx, d)| (DeviceKey(idx), d))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PciDevice> {
        self.devices.iter_mut()
    }

    /// The PF a VF or vDPA device is linked to.
    pub fn parent_of(&self, key: DeviceKey) -> Option<DeviceKey> {
        self.parents.get(key.0).copied().flatten()
    }

    /// The VFs linked to a PF, in collection order.
    pub fn children_of(&self, key: DeviceKey) -> &[DeviceKey] {
        self.children.get(key.0).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl Index<DeviceKey> for DeviceCollection {
    type Output = PciDevice;

    fn index(&self, key: DeviceKey) -> &PciDevice {
        &self.devices[key.0]
    }
}
