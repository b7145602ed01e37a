//! Device state transitions: claim, allocate, free and remove.
//!
//! Operations are synchronous and only touch memory. Claiming or allocating a PF locks all
//! of its VFs; claiming or allocating a VF (or vDPA device) locks its PF. Every check runs
//! before the first mutation, so a failed operation leaves the collection untouched.
//! Persisting the affected devices is the caller's job.

use crate::error::{Result, TrackerError};
use crate::observability::metrics::record_transition;
use crate::tree::{DeviceCollection, DeviceKey};
use crate::types::{DeviceStatus, DeviceType, Instance, PciDevice};
use tracing::{debug, warn};

/// Statuses a PF may be in while one of its VFs is claimed or allocated.
const PARENT_OK_STATUSES: [DeviceStatus; 3] =
    [DeviceStatus::Available, DeviceStatus::Unclaimable, DeviceStatus::Unavailable];

/// Non-free VF statuses tolerated when claiming their PF.
const INCONSISTENT_CHILD_STATUSES: [DeviceStatus; 2] =
    [DeviceStatus::Unclaimable, DeviceStatus::Unavailable];

const ALLOCATE_OK_STATUSES: [DeviceStatus; 2] = [DeviceStatus::Available, DeviceStatus::Claimed];

const ALLOCATE_CHILD_OK_STATUSES: [DeviceStatus; 2] =
    [DeviceStatus::Available, DeviceStatus::Unclaimable];

const FREE_OK_STATUSES: [DeviceStatus; 2] = [DeviceStatus::Allocated, DeviceStatus::Claimed];

const REMOVE_OK_STATUSES: [DeviceStatus; 3] =
    [DeviceStatus::Available, DeviceStatus::Unavailable, DeviceStatus::Unclaimable];

impl PciDevice {
    /// Mark the device as gone from the host.
    ///
    /// Only unowned devices can be removed. The removal reaches storage on the next save,
    /// which deletes the row and moves the device to DELETED.
    pub fn remove(&mut self) -> Result<()> {
        let result = self.remove_unrecorded();
        record_transition("remove", &result);
        result
    }

    fn remove_unrecorded(&mut self) -> Result<()> {
        if self.instance_uuid.is_some() {
            return Err(TrackerError::InvalidOwner {
                compute_node_id: self.compute_node_id,
                address: self.address.clone(),
                owner: self.instance_uuid.clone(),
                hopeowner: None,
            });
        }
        if !REMOVE_OK_STATUSES.contains(&self.status) {
            return Err(invalid_status(self, &REMOVE_OK_STATUSES));
        }

        self.status = DeviceStatus::Removed;
        self.instance_uuid = None;
        self.request_id = None;
        Ok(())
    }
}

impl DeviceCollection {
    /// Reserve a device for `instance_uuid`.
    ///
    /// Claiming a PF makes all its VFs UNCLAIMABLE; claiming a VF makes an AVAILABLE parent
    /// UNCLAIMABLE.
    pub fn claim(&mut self, key: DeviceKey, instance_uuid: &str) -> Result<()> {
        let result = self.claim_unrecorded(key, instance_uuid);
        record_transition("claim", &result);
        result
    }

    fn claim_unrecorded(&mut self, key: DeviceKey, instance_uuid: &str) -> Result<()> {
        let idx = self.slot(key)?;
        let device = &self.devices[idx];
        if device.status != DeviceStatus::Available {
            return Err(invalid_status(device, &[DeviceStatus::Available]));
        }

        match device.dev_type {
            DeviceType::SriovPf => {
                let children = self.children[idx].clone();
                let non_free: Vec<&PciDevice> = children
                    .iter()
                    .map(|c| &self.devices[c.0])
                    .filter(|c| !c.is_available())
                    .collect();

                if !non_free.is_empty() {
                    if non_free.iter().all(|c| INCONSISTENT_CHILD_STATUSES.contains(&c.status)) {
                        let listing: Vec<String> = non_free
                            .iter()
                            .map(|c| format!("{} - {}", c.address, c.status))
                            .collect();
                        warn!(
                            address = %device.address,
                            children = %listing.join(","),
                            "Some child device of parent is in an inconsistent state"
                        );
                    } else {
                        return Err(TrackerError::VfInvalidStatus {
                            compute_node_id: device.compute_node_id,
                            address: device.address.clone(),
                        });
                    }
                }
                self.bulk_update_status(&children, DeviceStatus::Unclaimable);
            }
            DeviceType::SriovVf | DeviceType::Vdpa => match self.parents[idx] {
                Some(parent) => {
                    self.check_parent(idx, parent)?;
                    let pf = &mut self.devices[parent.0];
                    if pf.status == DeviceStatus::Available {
                        pf.status = DeviceStatus::Unclaimable;
                    }
                }
                None => log_missing_parent(device),
            },
            DeviceType::Standard => {}
        }

        let device = &mut self.devices[idx];
        device.status = DeviceStatus::Claimed;
        device.instance_uuid = Some(instance_uuid.to_string());
        Ok(())
    }

    /// Commit a device to `instance`, which receives a copy of the allocated device.
    ///
    /// A CLAIMED device must already belong to the instance. Allocating a PF makes its VFs
    /// UNAVAILABLE; allocating a VF makes its parent UNAVAILABLE.
    pub fn allocate(&mut self, key: DeviceKey, instance: &mut Instance) -> Result<()> {
        let result = self.allocate_unrecorded(key, instance);
        record_transition("allocate", &result);
        result
    }

    fn allocate_unrecorded(&mut self, key: DeviceKey, instance: &mut Instance) -> Result<()> {
        let idx = self.slot(key)?;
        let device = &self.devices[idx];
        if !ALLOCATE_OK_STATUSES.contains(&device.status) {
            return Err(invalid_status(device, &ALLOCATE_OK_STATUSES));
        }
        if device.status == DeviceStatus::Claimed
            && device.instance_uuid.as_deref() != Some(instance.uuid.as_str())
        {
            return Err(TrackerError::InvalidOwner {
                compute_node_id: device.compute_node_id,
                address: device.address.clone(),
                owner: device.instance_uuid.clone(),
                hopeowner: Some(instance.uuid.clone()),
            });
        }

        match device.dev_type {
            DeviceType::SriovPf => {
                let children = self.children[idx].clone();
                if !children
                    .iter()
                    .all(|c| ALLOCATE_CHILD_OK_STATUSES.contains(&self.devices[c.0].status))
                {
                    return Err(TrackerError::VfInvalidStatus {
                        compute_node_id: device.compute_node_id,
                        address: device.address.clone(),
                    });
                }
                self.bulk_update_status(&children, DeviceStatus::Unavailable);
            }
            DeviceType::SriovVf | DeviceType::Vdpa => match self.parents[idx] {
                Some(parent) => {
                    self.check_parent(idx, parent)?;
                    self.devices[parent.0].status = DeviceStatus::Unavailable;
                }
                None => log_missing_parent(device),
            },
            DeviceType::Standard => {}
        }

        let device = &mut self.devices[idx];
        device.status = DeviceStatus::Allocated;
        device.instance_uuid = Some(instance.uuid.clone());
        instance.pci_devices.push(device.clone());
        Ok(())
    }

    /// Release a claimed or allocated device.
    ///
    /// Freeing a PF makes all its VFs AVAILABLE. Freeing a VF makes its parent AVAILABLE
    /// once no other VF of that parent is in use. Returns every device whose status changed
    /// (cascaded devices first, the freed device last); all of them must be persisted.
    pub fn free(
        &mut self,
        key: DeviceKey,
        instance: Option<&mut Instance>,
    ) -> Result<Vec<DeviceKey>> {
        let result = self.free_unrecorded(key, instance);
        record_transition("free", &result);
        result
    }

    fn free_unrecorded(
        &mut self,
        key: DeviceKey,
        instance: Option<&mut Instance>,
    ) -> Result<Vec<DeviceKey>> {
        let idx = self.slot(key)?;
        let device = &self.devices[idx];
        if !FREE_OK_STATUSES.contains(&device.status) {
            return Err(invalid_status(device, &FREE_OK_STATUSES));
        }
        if let Some(inst) = instance.as_deref() {
            if device.instance_uuid.as_deref() != Some(inst.uuid.as_str()) {
                return Err(TrackerError::InvalidOwner {
                    compute_node_id: device.compute_node_id,
                    address: device.address.clone(),
                    owner: device.instance_uuid.clone(),
                    hopeowner: Some(inst.uuid.clone()),
                });
            }
        }

        let mut changed = Vec::new();
        match device.dev_type {
            DeviceType::SriovPf => {
                let children = self.children[idx].clone();
                self.bulk_update_status(&children, DeviceStatus::Available);
                changed.extend(children);
            }
            DeviceType::SriovVf | DeviceType::Vdpa => match self.parents[idx] {
                Some(parent) => {
                    let siblings_free = self.children[parent.0]
                        .iter()
                        .filter(|c| **c != key)
                        .all(|c| self.devices[c.0].is_available());
                    if siblings_free {
                        self.devices[parent.0].status = DeviceStatus::Available;
                        changed.push(parent);
                    }
                }
                None => log_missing_parent(device),
            },
            DeviceType::Standard => {}
        }

        let device = &mut self.devices[idx];
        let old_status = device.status;
        device.status = DeviceStatus::Available;
        device.instance_uuid = None;
        device.request_id = None;
        changed.push(key);

        if let (DeviceStatus::Allocated, Some(inst)) = (old_status, instance) {
            match inst.position_of(device) {
                Some(pos) => {
                    inst.pci_devices.remove(pos);
                }
                None => debug!(
                    address = %device.address,
                    instance = %inst.uuid,
                    "Freed device was not in the instance device list"
                ),
            }
        }

        Ok(changed)
    }

    /// Mark a device in this collection as removed. See [`PciDevice::remove`].
    pub fn remove(&mut self, key: DeviceKey) -> Result<()> {
        let idx = self.slot(key)?;
        self.devices[idx].remove()
    }

    fn slot(&self, key: DeviceKey) -> Result<usize> {
        if key.0 < self.devices.len() {
            Ok(key.0)
        } else {
            Err(TrackerError::Internal(format!("device key {} out of range", key.0)))
        }
    }

    /// Fail unless the VF at `idx` may take a device from `parent`.
    fn check_parent(&self, idx: usize, parent: DeviceKey) -> Result<()> {
        let pf = &self.devices[parent.0];
        if PARENT_OK_STATUSES.contains(&pf.status) {
            return Ok(());
        }
        let vf = &self.devices[idx];
        Err(TrackerError::PfInvalidStatus {
            compute_node_id: vf.compute_node_id,
            address: pf.address.clone(),
            vf_address: vf.address.clone(),
            status: pf.status,
            hopestatus: PARENT_OK_STATUSES.to_vec(),
        })
    }

    fn bulk_update_status(&mut self, keys: &[DeviceKey], status: DeviceStatus) {
        for key in keys {
            self.devices[key.0].status = status;
        }
    }
}

fn invalid_status(device: &PciDevice, hopestatus: &[DeviceStatus]) -> TrackerError {
    TrackerError::InvalidStatus {
        compute_node_id: device.compute_node_id,
        address: device.address.clone(),
        status: device.status,
        hopestatus: hopestatus.to_vec(),
    }
}

fn log_missing_parent(device: &PciDevice) {
    debug!(
        pf_addr = ?device.parent_addr,
        vf_addr = %device.address,
        "Physical function parent of VF was not found"
    );
}
