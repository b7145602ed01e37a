//! Versioned device primitives for consumers running older releases.
//!
//! Version history of the device object:
//! - 1.2: `request_id`
//! - 1.3: `numa_node`
//! - 1.4: `parent_addr` (older consumers read `extra_info["phys_function"]`)
//! - 1.5: statuses `unclaimable` and `unavailable`
//! - 1.6: `uuid`
//! - 1.7: dev_type `vdpa`
//!
//! Downgrading drops fields the target does not know. Enum values the target does not know
//! cannot be dropped silently and fail with [`TrackerError::ValueTooNew`].

use crate::error::{Result, TrackerError};
use crate::types::{DeviceStatus, DeviceType, ExtraInfo, PciDevice};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const DEVICE_OBJECT_NAME: &str = "PciDevice";
pub const DEVICE_LIST_OBJECT_NAME: &str = "PciDeviceList";

/// Current device object version.
pub const DEVICE_VERSION: ObjectVersion = ObjectVersion::new(1, 7);

/// Current device list version.
pub const DEVICE_LIST_VERSION: ObjectVersion = ObjectVersion::new(1, 3);

/// Device version carried by each device list version.
const LIST_CHILD_VERSIONS: [(ObjectVersion, ObjectVersion); 4] = [
    (ObjectVersion::new(1, 0), ObjectVersion::new(1, 1)),
    (ObjectVersion::new(1, 1), ObjectVersion::new(1, 2)),
    (ObjectVersion::new(1, 2), ObjectVersion::new(1, 3)),
    (ObjectVersion::new(1, 3), DEVICE_VERSION),
];

/// `major.minor` object version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectVersion {
    pub major: u16,
    pub minor: u16,
}

impl ObjectVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for ObjectVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ObjectVersion {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self> {
        let unsupported = || TrackerError::UnsupportedVersion { version: s.to_string() };
        let (major, minor) = s.split_once('.').ok_or_else(unsupported)?;
        Ok(Self {
            major: major.parse().map_err(|_| unsupported())?,
            minor: minor.parse().map_err(|_| unsupported())?,
        })
    }
}

impl TryFrom<String> for ObjectVersion {
    type Error = TrackerError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ObjectVersion> for String {
    fn from(version: ObjectVersion) -> Self {
        version.to_string()
    }
}

/// A serialized object tagged with its name and version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedPrimitive {
    pub name: String,
    pub version: ObjectVersion,
    pub data: Map<String, Value>,
}

fn check_target(target: ObjectVersion, current: ObjectVersion) -> Result<()> {
    if target.major != current.major || target > current {
        return Err(TrackerError::UnsupportedVersion { version: target.to_string() });
    }
    Ok(())
}

impl PciDevice {
    /// Serialize for a consumer speaking device version `target`.
    pub fn to_primitive(&self, target: ObjectVersion) -> Result<VersionedPrimitive> {
        check_target(target, DEVICE_VERSION)?;

        let mut data = Map::new();
        if let Some(id) = self.id {
            data.insert("id".into(), json!(id));
        }
        if let Some(uuid) = self.uuid {
            data.insert("uuid".into(), json!(uuid.to_string()));
        }
        data.insert("compute_node_id".into(), json!(self.compute_node_id));
        data.insert("address".into(), json!(self.address));
        data.insert("vendor_id".into(), json!(self.vendor_id));
        data.insert("product_id".into(), json!(self.product_id));
        data.insert("dev_type".into(), json!(self.dev_type.as_str()));
        data.insert("status".into(), json!(self.status.as_str()));
        data.insert("dev_id".into(), json!(self.dev_id));
        data.insert("label".into(), json!(self.label));
        data.insert("instance_uuid".into(), json!(self.instance_uuid));
        data.insert("request_id".into(), json!(self.request_id));
        data.insert("extra_info".into(), json!(self.extra_info));
        data.insert("numa_node".into(), json!(self.numa_node));
        data.insert("parent_addr".into(), json!(self.parent_addr));

        make_compatible(&mut data, target)?;
        Ok(VersionedPrimitive { name: DEVICE_OBJECT_NAME.to_string(), version: target, data })
    }

    /// Rebuild a device from a primitive of any supported version.
    ///
    /// Fields missing from the primitive stay unset. A primitive carrying an id is treated
    /// as already persisted.
    pub fn from_primitive(primitive: &VersionedPrimitive) -> Result<Self> {
        if primitive.name != DEVICE_OBJECT_NAME {
            return Err(TrackerError::invalid_primitive(format!(
                "expected {} but got {}",
                DEVICE_OBJECT_NAME, primitive.name
            )));
        }
        check_target(primitive.version, DEVICE_VERSION)?;
        let data = &primitive.data;

        let uuid = optional_str(data, "uuid")?
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .map_err(|e| TrackerError::invalid_primitive(format!("uuid: {}", e)))?;
        let extra_info: ExtraInfo = match data.get("extra_info") {
            None | Some(Value::Null) => ExtraInfo::new(),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| TrackerError::invalid_primitive(format!("extra_info: {}", e)))?,
        };

        let mut dev = PciDevice::blank(required_str(data, "address")?);
        dev.id = optional_int(data, "id")?;
        dev.uuid = uuid;
        dev.compute_node_id = optional_int(data, "compute_node_id")?;
        dev.vendor_id = required_str(data, "vendor_id")?;
        dev.product_id = required_str(data, "product_id")?;
        dev.dev_type = required_str(data, "dev_type")?.parse::<DeviceType>()?;
        dev.status = required_str(data, "status")?.parse::<DeviceStatus>()?;
        dev.dev_id = optional_str(data, "dev_id")?;
        dev.label = optional_str(data, "label")?;
        dev.instance_uuid = optional_str(data, "instance_uuid")?;
        dev.request_id = optional_str(data, "request_id")?;
        dev.extra_info = extra_info;
        dev.numa_node = optional_int(data, "numa_node")?;
        dev.parent_addr = optional_str(data, "parent_addr")?;

        if dev.is_persisted() {
            dev.reset_changes();
        }
        Ok(dev)
    }
}

/// Downgrade device primitive `data` in place to `target`.
pub fn make_compatible(data: &mut Map<String, Value>, target: ObjectVersion) -> Result<()> {
    if target < ObjectVersion::new(1, 2) {
        data.remove("request_id");
    }
    if target < ObjectVersion::new(1, 3) {
        data.remove("numa_node");
    }
    if target < ObjectVersion::new(1, 4) {
        if let Some(parent_addr) = data.remove("parent_addr") {
            if let Value::String(addr) = parent_addr {
                let extra_info =
                    data.entry("extra_info").or_insert_with(|| Value::Object(Map::new()));
                if let Value::Object(extra) = extra_info {
                    extra.insert("phys_function".into(), Value::String(addr));
                }
            }
        }
    }
    if target < ObjectVersion::new(1, 5) {
        raise_on_too_new_values(
            data,
            "status",
            &[DeviceStatus::Unclaimable.as_str(), DeviceStatus::Unavailable.as_str()],
            target,
        )?;
    }
    if target < ObjectVersion::new(1, 6) {
        data.remove("uuid");
    }
    if target < ObjectVersion::new(1, 7) {
        raise_on_too_new_values(data, "dev_type", &[DeviceType::Vdpa.as_str()], target)?;
    }
    Ok(())
}

fn raise_on_too_new_values(
    data: &Map<String, Value>,
    field: &str,
    too_new: &[&str],
    target: ObjectVersion,
) -> Result<()> {
    match data.get(field).and_then(Value::as_str) {
        Some(value) if too_new.contains(&value) => Err(TrackerError::ValueTooNew {
            field: field.to_string(),
            value: value.to_string(),
            target: target.to_string(),
        }),
        _ => Ok(()),
    }
}

/// Serialize a device list for a consumer speaking list version `target`.
pub fn list_to_primitive(
    devices: &[PciDevice],
    target: ObjectVersion,
) -> Result<VersionedPrimitive> {
    check_target(target, DEVICE_LIST_VERSION)?;
    let child_version = LIST_CHILD_VERSIONS
        .iter()
        .rev()
        .find(|(list, _)| *list <= target)
        .map(|(_, child)| *child)
        .ok_or_else(|| TrackerError::UnsupportedVersion { version: target.to_string() })?;

    let objects = devices
        .iter()
        .map(|d| {
            let primitive = d.to_primitive(child_version)?;
            serde_json::to_value(primitive).map_err(TrackerError::internal)
        })
        .collect::<Result<Vec<_>>>()?;

    let mut data = Map::new();
    data.insert("objects".into(), Value::Array(objects));
    Ok(VersionedPrimitive { name: DEVICE_LIST_OBJECT_NAME.to_string(), version: target, data })
}

fn required_str(data: &Map<String, Value>, key: &str) -> Result<String> {
    optional_str(data, key)?
        .ok_or_else(|| TrackerError::invalid_primitive(format!("missing field {}", key)))
}

fn optional_str(data: &Map<String, Value>, key: &str) -> Result<Option<String>> {
    match data.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(TrackerError::invalid_primitive(format!("{} must be a string", key))),
    }
}

fn optional_int(data: &Map<String, Value>, key: &str) -> Result<Option<i64>> {
    match data.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_i64()
            .map(Some)
            .ok_or_else(|| TrackerError::invalid_primitive(format!("{} must be an integer", key))),
    }
}
