//! Persisted form of a device: one `pci_devices` row.

use super::device::{DeviceStatus, DeviceType};
use crate::error::{Result, TrackerError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// A persisted device column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceField {
    Id,
    Uuid,
    ComputeNodeId,
    Address,
    VendorId,
    ProductId,
    DevType,
    Status,
    DevId,
    Label,
    InstanceUuid,
    RequestId,
    ExtraInfo,
    NumaNode,
    ParentAddr,
}

impl DeviceField {
    /// Every persisted column, in table order.
    pub const ALL: [DeviceField; 15] = [
        Self::Id,
        Self::Uuid,
        Self::ComputeNodeId,
        Self::Address,
        Self::VendorId,
        Self::ProductId,
        Self::DevType,
        Self::Status,
        Self::DevId,
        Self::Label,
        Self::InstanceUuid,
        Self::RequestId,
        Self::ExtraInfo,
        Self::NumaNode,
        Self::ParentAddr,
    ];

    /// Column (and attribute) name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Uuid => "uuid",
            Self::ComputeNodeId => "compute_node_id",
            Self::Address => "address",
            Self::VendorId => "vendor_id",
            Self::ProductId => "product_id",
            Self::DevType => "dev_type",
            Self::Status => "status",
            Self::DevId => "dev_id",
            Self::Label => "label",
            Self::InstanceUuid => "instance_uuid",
            Self::RequestId => "request_id",
            Self::ExtraInfo => "extra_info",
            Self::NumaNode => "numa_node",
            Self::ParentAddr => "parent_addr",
        }
    }

    /// Look up a field by its column name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }
}

impl fmt::Display for DeviceField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single column value as handed to storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnValue {
    Null,
    Integer(i64),
    Text(String),
}

impl ColumnValue {
    fn text(value: Option<&str>) -> Self {
        value.map_or(Self::Null, |s| Self::Text(s.to_string()))
    }

    fn integer(value: Option<i64>) -> Self {
        value.map_or(Self::Null, Self::Integer)
    }

    fn into_text(self, field: DeviceField) -> Result<Option<String>> {
        match self {
            Self::Null => Ok(None),
            Self::Text(s) => Ok(Some(s)),
            Self::Integer(_) => Err(type_mismatch(field, "text")),
        }
    }

    fn into_integer(self, field: DeviceField) -> Result<Option<i64>> {
        match self {
            Self::Null => Ok(None),
            Self::Integer(i) => Ok(Some(i)),
            Self::Text(_) => Err(type_mismatch(field, "integer")),
        }
    }
}

fn type_mismatch(field: DeviceField, expected: &str) -> TrackerError {
    TrackerError::DatabaseError(format!("column {} expects {} value", field, expected))
}

fn required(field: DeviceField, value: Option<String>) -> Result<String> {
    value.ok_or_else(|| TrackerError::DatabaseError(format!("column {} cannot be null", field)))
}

/// Changed columns of one device, keyed by column.
pub type DeviceChanges = BTreeMap<DeviceField, ColumnValue>;

/// Column values of one persisted device.
///
/// `extra_info` travels in its serialized (JSON object) form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRow {
    /// Storage-assigned identifier; `None` until the row is created.
    pub id: Option<i64>,
    /// `None` only for legacy rows written before uuids existed.
    pub uuid: Option<Uuid>,
    pub compute_node_id: Option<i64>,
    pub address: String,
    pub vendor_id: String,
    pub product_id: String,
    pub dev_type: DeviceType,
    pub status: DeviceStatus,
    pub dev_id: Option<String>,
    pub label: Option<String>,
    pub instance_uuid: Option<String>,
    pub request_id: Option<String>,
    pub extra_info: String,
    pub numa_node: Option<i64>,
    pub parent_addr: Option<String>,
}

impl DeviceRow {
    /// Read one column.
    pub fn value(&self, field: DeviceField) -> ColumnValue {
        match field {
            DeviceField::Id => ColumnValue::integer(self.id),
            DeviceField::Uuid => {
                self.uuid.map_or(ColumnValue::Null, |u| ColumnValue::Text(u.to_string()))
            }
            DeviceField::ComputeNodeId => ColumnValue::integer(self.compute_node_id),
            DeviceField::Address => ColumnValue::Text(self.address.clone()),
            DeviceField::VendorId => ColumnValue::Text(self.vendor_id.clone()),
            DeviceField::ProductId => ColumnValue::Text(self.product_id.clone()),
            DeviceField::DevType => ColumnValue::Text(self.dev_type.to_string()),
            DeviceField::Status => ColumnValue::Text(self.status.to_string()),
            DeviceField::DevId => ColumnValue::text(self.dev_id.as_deref()),
            DeviceField::Label => ColumnValue::text(self.label.as_deref()),
            DeviceField::InstanceUuid => ColumnValue::text(self.instance_uuid.as_deref()),
            DeviceField::RequestId => ColumnValue::text(self.request_id.as_deref()),
            DeviceField::ExtraInfo => ColumnValue::Text(self.extra_info.clone()),
            DeviceField::NumaNode => ColumnValue::integer(self.numa_node),
            DeviceField::ParentAddr => ColumnValue::text(self.parent_addr.as_deref()),
        }
    }

    /// Write one column. The id is owned by storage and cannot be set.
    pub fn set(&mut self, field: DeviceField, value: ColumnValue) -> Result<()> {
        match field {
            DeviceField::Id => {
                return Err(TrackerError::DatabaseError("column id is read-only".to_string()))
            }
            DeviceField::Uuid => {
                self.uuid = value
                    .into_text(field)?
                    .map(|s| Uuid::parse_str(&s))
                    .transpose()
                    .map_err(|e| TrackerError::DatabaseError(format!("invalid uuid: {}", e)))?;
            }
            DeviceField::ComputeNodeId => self.compute_node_id = value.into_integer(field)?,
            DeviceField::Address => self.address = required(field, value.into_text(field)?)?,
            DeviceField::VendorId => self.vendor_id = required(field, value.into_text(field)?)?,
            DeviceField::ProductId => self.product_id = required(field, value.into_text(field)?)?,
            DeviceField::DevType => {
                self.dev_type = required(field, value.into_text(field)?)?.parse()?;
            }
            DeviceField::Status => {
                self.status = required(field, value.into_text(field)?)?.parse()?;
            }
            DeviceField::DevId => self.dev_id = value.into_text(field)?,
            DeviceField::Label => self.label = value.into_text(field)?,
            DeviceField::InstanceUuid => self.instance_uuid = value.into_text(field)?,
            DeviceField::RequestId => self.request_id = value.into_text(field)?,
            DeviceField::ExtraInfo => self.extra_info = required(field, value.into_text(field)?)?,
            DeviceField::NumaNode => self.numa_node = value.into_integer(field)?,
            DeviceField::ParentAddr => self.parent_addr = value.into_text(field)?,
        }
        Ok(())
    }

    /// Apply a set of changed columns.
    pub fn apply(&mut self, changes: &DeviceChanges) -> Result<()> {
        for (field, value) in changes {
            self.set(*field, value.clone())?;
        }
        Ok(())
    }

    /// Columns whose values differ from `base`.
    pub fn diff(&self, base: &DeviceRow) -> DeviceChanges {
        DeviceField::ALL
            .into_iter()
            .filter(|f| *f != DeviceField::Id)
            .filter_map(|f| {
                let value = self.value(f);
                (value != base.value(f)).then_some((f, value))
            })
            .collect()
    }
}
