//! PCI device records.
//!
//! A [`PciDevice`] is one physical or virtual function on a compute node together with its
//! current allocation state. Records are created from discovered attribute maps, merged with
//! later discoveries via [`PciDevice::update_device`], and remember the last persisted row so
//! that saves only write the columns that changed.

use super::address::normalize_pci_address;
use super::row::{DeviceChanges, DeviceField, DeviceRow};
use crate::error::{Result, TrackerError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Device-specific properties (capabilities, parent netdev, MAC, tags).
pub type ExtraInfo = BTreeMap<String, String>;

/// Attribute map produced by device discovery.
pub type DeviceAttrs = Map<String, Value>;

/// `extra_info` tags that only exist while discovery keeps reporting them.
const TRANSIENT_TAGS: [&str; 2] = ["managed", "live_migratable"];

/// Device kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    /// Plain PCI device
    #[serde(rename = "type-PCI")]
    Standard,

    /// SR-IOV physical function
    #[serde(rename = "type-PF")]
    SriovPf,

    /// SR-IOV virtual function
    #[serde(rename = "type-VF")]
    SriovVf,

    /// vDPA device, coupled to its parent like a VF
    #[serde(rename = "vdpa")]
    Vdpa,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "type-PCI",
            Self::SriovPf => "type-PF",
            Self::SriovVf => "type-VF",
            Self::Vdpa => "vdpa",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "type-PCI" => Ok(Self::Standard),
            "type-PF" => Ok(Self::SriovPf),
            "type-VF" => Ok(Self::SriovVf),
            "vdpa" => Ok(Self::Vdpa),
            other => Err(TrackerError::invalid_primitive(format!("unknown dev_type {}", other))),
        }
    }
}

/// Device allocation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Free for claiming
    Available,

    /// Reserved for an instance, not yet committed
    Claimed,

    /// Assigned to a running instance
    Allocated,

    /// Gone from the host, pending deletion from storage
    Removed,

    /// Deleted from storage (terminal)
    Deleted,

    /// Parent or child of a claimed device
    Unclaimable,

    /// Parent or child of an allocated device
    Unavailable,
}

impl DeviceStatus {
    pub const ALL: [DeviceStatus; 7] = [
        Self::Available,
        Self::Claimed,
        Self::Allocated,
        Self::Removed,
        Self::Deleted,
        Self::Unclaimable,
        Self::Unavailable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Claimed => "claimed",
            Self::Allocated => "allocated",
            Self::Removed => "removed",
            Self::Deleted => "deleted",
            Self::Unclaimable => "unclaimable",
            Self::Unavailable => "unavailable",
        }
    }

    /// Statuses in which the device belongs to an instance.
    pub fn is_owned(&self) -> bool {
        matches!(self, Self::Claimed | Self::Allocated)
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "available" => Ok(Self::Available),
            "claimed" => Ok(Self::Claimed),
            "allocated" => Ok(Self::Allocated),
            "removed" => Ok(Self::Removed),
            "deleted" => Ok(Self::Deleted),
            "unclaimable" => Ok(Self::Unclaimable),
            "unavailable" => Ok(Self::Unavailable),
            other => Err(TrackerError::invalid_primitive(format!("unknown status {}", other))),
        }
    }
}

/// One PCI device on a compute node.
#[derive(Debug, Clone)]
pub struct PciDevice {
    /// Storage identifier (None until first save)
    pub id: Option<i64>,
    pub uuid: Option<Uuid>,
    /// None until the owning compute node is registered
    pub compute_node_id: Option<i64>,
    /// Bus address, unique within a node
    pub address: String,
    pub vendor_id: String,
    pub product_id: String,
    pub dev_type: DeviceType,
    pub status: DeviceStatus,
    /// Hypervisor-specific identifier
    pub dev_id: Option<String>,
    pub label: Option<String>,
    /// Owning instance, set only while claimed or allocated
    pub instance_uuid: Option<String>,
    pub request_id: Option<String>,
    pub extra_info: ExtraInfo,
    pub numa_node: Option<i64>,
    /// Address of the owning PF
    pub parent_addr: Option<String>,

    /// Row as last read from or written to storage
    persisted: Option<DeviceRow>,
}

impl PciDevice {
    /// Create a new, unsaved device from a discovered attribute map.
    ///
    /// The device starts AVAILABLE with a fresh uuid.
    pub fn create(attrs: &DeviceAttrs) -> Result<Self> {
        let address = attrs
            .get("address")
            .and_then(Value::as_str)
            .ok_or_else(|| TrackerError::invalid_primitive("device attributes lack an address"))?;

        let mut device = Self::blank(normalize_pci_address(address)?);
        device.update_device(attrs)?;
        device.status = DeviceStatus::Available;
        device.uuid = Some(Uuid::new_v4());
        Ok(device)
    }

    /// Unsaved AVAILABLE device with only an address set.
    pub(crate) fn blank(address: String) -> Self {
        Self {
            id: None,
            uuid: None,
            compute_node_id: None,
            address,
            vendor_id: String::new(),
            product_id: String::new(),
            dev_type: DeviceType::Standard,
            status: DeviceStatus::Available,
            dev_id: None,
            label: None,
            instance_uuid: None,
            request_id: None,
            extra_info: ExtraInfo::new(),
            numa_node: None,
            parent_addr: None,
            persisted: None,
        }
    }

    /// Rebuild a device from a persisted row. The row becomes the change-tracking baseline.
    pub fn from_row(row: DeviceRow) -> Result<Self> {
        let extra_info = parse_extra_info(&row.extra_info)?;
        Ok(Self {
            id: row.id,
            uuid: row.uuid,
            compute_node_id: row.compute_node_id,
            address: row.address.clone(),
            vendor_id: row.vendor_id.clone(),
            product_id: row.product_id.clone(),
            dev_type: row.dev_type,
            status: row.status,
            dev_id: row.dev_id.clone(),
            label: row.label.clone(),
            instance_uuid: row.instance_uuid.clone(),
            request_id: row.request_id.clone(),
            extra_info,
            numa_node: row.numa_node,
            parent_addr: row.parent_addr.clone(),
            persisted: Some(row),
        })
    }

    /// Merge a discovered attribute map into this device.
    ///
    /// `status`, `instance_uuid`, `id` and `extra_info` are never taken from discovery.
    /// Unknown keys land in `extra_info` (strings as-is, anything else JSON encoded), and
    /// transient tags missing from `attrs` are dropped. Either every attribute applies or
    /// none does.
    pub fn update_device(&mut self, attrs: &DeviceAttrs) -> Result<()> {
        let mut updated = self.clone();

        for (key, value) in attrs {
            match DeviceField::from_name(key) {
                Some(
                    DeviceField::Status
                    | DeviceField::InstanceUuid
                    | DeviceField::Id
                    | DeviceField::ExtraInfo,
                ) => {}
                Some(field) => updated.set_attr(field, value)?,
                None => {
                    let data = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    updated.extra_info.insert(key.clone(), data);
                }
            }
        }

        if !attrs.contains_key(DeviceField::ParentAddr.name()) {
            updated.parent_addr = None;
        }

        for tag in TRANSIENT_TAGS {
            if !attrs.contains_key(tag) {
                updated.extra_info.remove(tag);
            }
        }

        *self = updated;
        Ok(())
    }

    fn set_attr(&mut self, field: DeviceField, value: &Value) -> Result<()> {
        match field {
            DeviceField::Uuid => {
                self.uuid = attr_text(field, value)?
                    .map(|s| Uuid::parse_str(&s))
                    .transpose()
                    .map_err(|e| TrackerError::invalid_primitive(format!("uuid: {}", e)))?;
            }
            DeviceField::ComputeNodeId => self.compute_node_id = attr_integer(field, value)?,
            DeviceField::Address => {
                self.address = normalize_pci_address(&attr_required(field, value)?)?;
            }
            DeviceField::VendorId => self.vendor_id = attr_required(field, value)?,
            DeviceField::ProductId => self.product_id = attr_required(field, value)?,
            DeviceField::DevType => self.dev_type = attr_required(field, value)?.parse()?,
            DeviceField::DevId => self.dev_id = attr_text(field, value)?,
            DeviceField::Label => self.label = attr_text(field, value)?,
            DeviceField::RequestId => self.request_id = attr_text(field, value)?,
            DeviceField::NumaNode => self.numa_node = attr_integer(field, value)?,
            DeviceField::ParentAddr => {
                self.parent_addr =
                    attr_text(field, value)?.map(|a| normalize_pci_address(&a)).transpose()?;
            }
            DeviceField::Status
            | DeviceField::InstanceUuid
            | DeviceField::Id
            | DeviceField::ExtraInfo => {}
        }
        Ok(())
    }

    /// True iff the device can be claimed right now.
    pub fn is_available(&self) -> bool {
        self.status == DeviceStatus::Available
    }

    /// True once the device has been written to storage.
    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }

    /// Persisted form of the current state.
    pub fn to_row(&self) -> DeviceRow {
        DeviceRow {
            id: self.id,
            uuid: self.uuid,
            compute_node_id: self.compute_node_id,
            address: self.address.clone(),
            vendor_id: self.vendor_id.clone(),
            product_id: self.product_id.clone(),
            dev_type: self.dev_type,
            status: self.status,
            dev_id: self.dev_id.clone(),
            label: self.label.clone(),
            instance_uuid: self.instance_uuid.clone(),
            request_id: self.request_id.clone(),
            extra_info: serialize_extra_info(&self.extra_info),
            numa_node: self.numa_node,
            parent_addr: self.parent_addr.clone(),
        }
    }

    /// Columns changed since the last load or save. An unsaved device reports every column.
    pub fn changes(&self) -> DeviceChanges {
        let row = self.to_row();
        match &self.persisted {
            Some(base) => row.diff(base),
            None => DeviceField::ALL
                .into_iter()
                .filter(|f| *f != DeviceField::Id)
                .map(|f| (f, row.value(f)))
                .collect(),
        }
    }

    /// True if a save would touch storage.
    pub fn needs_save(&self) -> bool {
        match self.status {
            DeviceStatus::Removed => true,
            DeviceStatus::Deleted => false,
            _ => !self.is_persisted() || !self.changes().is_empty(),
        }
    }

    /// Node and address under which storage currently knows this device.
    pub fn persisted_key(&self) -> (Option<i64>, &str) {
        match &self.persisted {
            Some(row) => (row.compute_node_id, row.address.as_str()),
            None => (self.compute_node_id, self.address.as_str()),
        }
    }

    /// Replace every field with a freshly persisted row and reset change tracking.
    pub(crate) fn reload(&mut self, row: DeviceRow) -> Result<()> {
        *self = Self::from_row(row)?;
        Ok(())
    }

    /// Record that storage already holds `uuid` for this device.
    pub(crate) fn mark_uuid_persisted(&mut self, uuid: Uuid) {
        self.uuid = Some(uuid);
        if let Some(row) = self.persisted.as_mut() {
            row.uuid = Some(uuid);
        }
    }

    /// Treat the current state as persisted.
    pub(crate) fn reset_changes(&mut self) {
        self.persisted = Some(self.to_row());
    }

    /// Parsed `capabilities` object from `extra_info`; empty when missing or malformed.
    pub fn capabilities(&self) -> Map<String, Value> {
        self.extra_info
            .get("capabilities")
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
            .and_then(|value| match value {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// SR-IOV capability block (`capabilities.sriov`).
    pub fn sriov_cap(&self) -> Map<String, Value> {
        match self.capabilities().remove("sriov") {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Network capability names (`capabilities.network`).
    pub fn network_caps(&self) -> Vec<String> {
        match self.capabilities().remove("network") {
            Some(Value::Array(items)) => {
                items.into_iter().filter_map(|v| v.as_str().map(str::to_string)).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Card serial number from the VPD capability, if reported.
    pub fn card_serial_number(&self) -> Option<String> {
        self.capabilities()
            .get("vpd")
            .and_then(|vpd| vpd.get("card_serial_number"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// MAC address of the PF, if known.
    pub fn mac_address(&self) -> Option<&str> {
        self.extra_info.get("mac_address").map(String::as_str)
    }

    /// Netdev name of the parent PF of a VF.
    pub fn parent_ifname(&self) -> Option<&str> {
        self.extra_info.get("parent_ifname").map(String::as_str)
    }

    /// Whether the hypervisor manages the device; None when not reported.
    pub fn is_managed(&self) -> Option<bool> {
        self.extra_info.get("managed").and_then(|v| parse_flag(v))
    }

    /// Whether the device can be live migrated; None when not reported.
    pub fn is_live_migratable(&self) -> Option<bool> {
        self.extra_info.get("live_migratable").and_then(|v| parse_flag(v))
    }
}

impl PartialEq for PciDevice {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.uuid == other.uuid
            && self.compute_node_id == other.compute_node_id
            && self.address == other.address
            && self.vendor_id == other.vendor_id
            && self.product_id == other.product_id
            && self.dev_type == other.dev_type
            && self.status == other.status
            && self.dev_id == other.dev_id
            && self.label == other.label
            && self.instance_uuid == other.instance_uuid
            && self.request_id == other.request_id
            && self.extra_info == other.extra_info
            && self.numa_node == other.numa_node
            && self.parent_addr == other.parent_addr
    }
}

impl fmt::Display for PciDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let node = self.compute_node_id.map_or_else(|| "None".to_string(), |n| n.to_string());
        write!(f, "PciDevice(address={}, compute_node_id={})", self.address, node)
    }
}

/// Serialize `extra_info` to its stored JSON object form.
pub fn serialize_extra_info(extra_info: &ExtraInfo) -> String {
    // A string-keyed map of strings always serializes.
    serde_json::to_string(extra_info).unwrap_or_else(|_| "{}".to_string())
}

/// Parse a stored `extra_info` blob. An empty blob is an empty map.
pub fn parse_extra_info(raw: &str) -> Result<ExtraInfo> {
    if raw.trim().is_empty() {
        return Ok(ExtraInfo::new());
    }
    serde_json::from_str(raw)
        .map_err(|e| TrackerError::invalid_primitive(format!("extra_info: {}", e)))
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

fn attr_text(field: DeviceField, value: &Value) -> Result<Option<String>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        Value::Number(n) => Ok(Some(n.to_string())),
        _ => Err(TrackerError::invalid_primitive(format!("{} must be a string", field))),
    }
}

fn attr_required(field: DeviceField, value: &Value) -> Result<String> {
    attr_text(field, value)?
        .ok_or_else(|| TrackerError::invalid_primitive(format!("{} cannot be null", field)))
}

fn attr_integer(field: DeviceField, value: &Value) -> Result<Option<i64>> {
    let not_integer = || TrackerError::invalid_primitive(format!("{} must be an integer", field));
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n.as_i64().map(Some).ok_or_else(not_integer),
        Value::String(s) => s.trim().parse().map(Some).map_err(|_| not_integer()),
        _ => Err(not_integer()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: Value) -> DeviceAttrs {
        match value {
            Value::Object(map) => map,
            _ => panic!("attrs must be an object"),
        }
    }

    fn vf_attrs() -> DeviceAttrs {
        attrs(json!({
            "compute_node_id": 1,
            "address": "0000:01:00.1",
            "vendor_id": "8086",
            "product_id": "154c",
            "dev_type": "type-VF",
            "numa_node": "0",
            "parent_addr": "0000:01:00.0",
            "status": "allocated",
            "instance_uuid": "should-be-ignored",
            "parent_ifname": "enp1s0f0",
            "capabilities": {"network": ["gso", "tso"]},
            "managed": "true",
        }))
    }

    #[test]
    fn test_create_from_attrs() {
        let dev = PciDevice::create(&vf_attrs()).unwrap();

        assert_eq!(dev.address, "0000:01:00.1");
        assert_eq!(dev.compute_node_id, Some(1));
        assert_eq!(dev.dev_type, DeviceType::SriovVf);
        assert_eq!(dev.status, DeviceStatus::Available);
        assert_eq!(dev.instance_uuid, None);
        assert_eq!(dev.numa_node, Some(0));
        assert_eq!(dev.parent_addr.as_deref(), Some("0000:01:00.0"));
        assert!(dev.uuid.is_some());
        assert!(dev.is_available());
        assert!(!dev.is_persisted());
        assert_eq!(dev.parent_ifname(), Some("enp1s0f0"));
        assert_eq!(dev.network_caps(), vec!["gso".to_string(), "tso".to_string()]);
        assert_eq!(dev.is_managed(), Some(true));
    }

    #[test]
    fn test_create_requires_valid_address() {
        let missing = attrs(json!({"vendor_id": "8086"}));
        assert!(matches!(PciDevice::create(&missing), Err(TrackerError::InvalidPrimitive { .. })));

        let bad = attrs(json!({"address": "01:00.1", "vendor_id": "8086", "product_id": "1"}));
        assert!(matches!(PciDevice::create(&bad), Err(TrackerError::InvalidAddress { .. })));
    }

    #[test]
    fn test_update_device_prunes_transient_tags_and_parent() {
        let mut dev = PciDevice::create(&vf_attrs()).unwrap();
        dev.reset_changes();

        let rediscovered = attrs(json!({
            "address": "0000:01:00.1",
            "vendor_id": "8086",
            "product_id": "154c",
            "dev_type": "type-VF",
            "label": "label_8086_154c",
        }));
        dev.update_device(&rediscovered).unwrap();

        assert_eq!(dev.is_managed(), None);
        assert_eq!(dev.parent_addr, None);
        // Non-transient extra_info keys survive
        assert_eq!(dev.parent_ifname(), Some("enp1s0f0"));

        let changes = dev.changes();
        assert!(changes.contains_key(&DeviceField::ExtraInfo));
        assert!(changes.contains_key(&DeviceField::ParentAddr));
        assert!(changes.contains_key(&DeviceField::Label));
        assert!(!changes.contains_key(&DeviceField::Status));
    }

    #[test]
    fn test_update_device_is_all_or_nothing() {
        let mut dev = PciDevice::create(&vf_attrs()).unwrap();
        let before = dev.clone();

        let broken = attrs(json!({"label": "new", "numa_node": "not-a-number"}));
        assert!(dev.update_device(&broken).is_err());
        assert_eq!(dev, before);
    }

    #[test]
    fn test_unchanged_update_has_no_changes() {
        let mut dev = PciDevice::create(&vf_attrs()).unwrap();
        dev.reset_changes();
        dev.update_device(&vf_attrs()).unwrap();
        assert!(dev.changes().is_empty());
    }

    #[test]
    fn test_accessors_tolerate_malformed_capabilities() {
        let mut dev = PciDevice::create(&vf_attrs()).unwrap();
        dev.extra_info.insert("capabilities".to_string(), "{not json".to_string());

        assert!(dev.capabilities().is_empty());
        assert!(dev.sriov_cap().is_empty());
        assert!(dev.network_caps().is_empty());
        assert_eq!(dev.card_serial_number(), None);
        assert_eq!(dev.mac_address(), None);
    }

    #[test]
    fn test_card_serial_number_and_sriov_cap() {
        let mut dev = PciDevice::create(&vf_attrs()).unwrap();
        dev.extra_info.insert(
            "capabilities".to_string(),
            json!({
                "vpd": {"card_serial_number": "MT2113X00000"},
                "sriov": {"pf_mac_address": "52:54:00:1e:59:c6", "vf_num": 1},
            })
            .to_string(),
        );

        assert_eq!(dev.card_serial_number().as_deref(), Some("MT2113X00000"));
        assert_eq!(dev.sriov_cap().get("vf_num"), Some(&json!(1)));
    }

    #[test]
    fn test_status_and_type_strings() {
        for status in DeviceStatus::ALL {
            assert_eq!(status.as_str().parse::<DeviceStatus>().unwrap(), status);
        }
        assert_eq!("vdpa".parse::<DeviceType>().unwrap(), DeviceType::Vdpa);
        assert_eq!(serde_json::to_string(&DeviceType::SriovPf).unwrap(), "\"type-PF\"");
        assert!("type-USB".parse::<DeviceType>().is_err());
    }

    #[test]
    fn test_row_round_trip_keeps_baseline() {
        let mut dev = PciDevice::create(&vf_attrs()).unwrap();
        dev.id = Some(7);
        let restored = PciDevice::from_row(dev.to_row()).unwrap();

        assert_eq!(restored, dev);
        assert!(restored.changes().is_empty());
        assert!(!restored.needs_save());
    }
}
