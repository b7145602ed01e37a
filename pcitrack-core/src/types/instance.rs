//! Workload owning devices.

use super::device::PciDevice;

/// An instance as seen by the device tracker: its uuid and the devices allocated to it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Instance {
    /// Instance uuid (device owner key)
    pub uuid: String,

    /// Devices allocated to this instance
    pub pci_devices: Vec<PciDevice>,
}

impl Instance {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self { uuid: uuid.into(), pci_devices: Vec::new() }
    }

    /// Find the position of `device` in this instance's device list.
    ///
    /// Saved devices match by id, unsaved ones by node and address.
    pub(crate) fn position_of(&self, device: &PciDevice) -> Option<usize> {
        self.pci_devices.iter().position(|d| match (d.id, device.id) {
            (Some(a), Some(b)) => a == b,
            _ => d.compute_node_id == device.compute_node_id && d.address == device.address,
        })
    }
}
