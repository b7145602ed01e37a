//! pcitrack core library
//!
//! Bookkeeping for PCI devices on compute nodes: device records, the PF/VF tree, the
//! claim/allocate/free/remove state machine, SQLite persistence and versioned
//! serialization for older consumers.

pub mod compat;
pub mod config;
pub mod engine;
pub mod error;
pub mod observability;
pub mod paths;
pub mod state;
pub mod tracker;
pub mod tree;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export commonly used items
pub use compat::{ObjectVersion, VersionedPrimitive, DEVICE_LIST_VERSION, DEVICE_VERSION};
pub use config::Config;
pub use error::{Result, TrackerError};
pub use observability::init as init_observability;
pub use state::{DeviceStore, MemoryStore, StateManager};
pub use tracker::{NodeTracker, ReconcileReport};
pub use tree::{DeviceCollection, DeviceKey};
pub use types::{
    DeviceAttrs, DeviceRow, DeviceStatus, DeviceType, ExtraInfo, Instance, PciDevice,
};
