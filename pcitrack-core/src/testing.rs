//! Shared fixtures for unit tests.

use crate::types::{DeviceAttrs, PciDevice};
use serde_json::{json, Value};

/// Attribute map from a JSON object literal.
pub(crate) fn attrs(value: Value) -> DeviceAttrs {
    serde_json::from_value(value).expect("attrs must be a JSON object")
}

/// A freshly discovered device on `node`.
pub(crate) fn device(node: i64, address: &str, dev_type: &str, parent: Option<&str>) -> PciDevice {
    let mut value = json!({
        "compute_node_id": node,
        "address": address,
        "vendor_id": "8086",
        "product_id": "1528",
        "dev_type": dev_type,
    });
    if let Some(parent) = parent {
        value["parent_addr"] = json!(parent);
    }
    PciDevice::create(&attrs(value)).expect("valid device attributes")
}
