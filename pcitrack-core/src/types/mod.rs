//! Core domain types for pcitrack.

pub mod address;
pub mod device;
pub mod instance;
pub mod row;

// Re-exports
pub use address::{is_valid_pci_address, normalize_pci_address};
pub use device::{DeviceAttrs, DeviceStatus, DeviceType, ExtraInfo, PciDevice};
pub use instance::Instance;
pub use row::{ColumnValue, DeviceChanges, DeviceField, DeviceRow};
