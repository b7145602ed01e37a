//! Error types for pcitrack.

use crate::types::DeviceStatus;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for pcitrack operations.
pub type Result<T> = std::result::Result<T, TrackerError>;

/// Main error type for pcitrack.
#[derive(Error, Debug)]
pub enum TrackerError {
    // State engine errors
    #[error(
        "PCI device {}:{address} is {status} instead of {}",
        node_label(.compute_node_id),
        status_list(.hopestatus)
    )]
    InvalidStatus {
        compute_node_id: Option<i64>,
        address: String,
        status: DeviceStatus,
        hopestatus: Vec<DeviceStatus>,
    },

    #[error("Not all Virtual Functions of PF {}:{address} are free", node_label(.compute_node_id))]
    VfInvalidStatus { compute_node_id: Option<i64>, address: String },

    #[error(
        "Physical Function {}:{address}, related to VF {}:{vf_address} is {status} instead of {}",
        node_label(.compute_node_id),
        node_label(.compute_node_id),
        status_list(.hopestatus)
    )]
    PfInvalidStatus {
        compute_node_id: Option<i64>,
        address: String,
        vf_address: String,
        status: DeviceStatus,
        hopestatus: Vec<DeviceStatus>,
    },

    #[error(
        "PCI device {}:{address} is owned by {} instead of {}",
        node_label(.compute_node_id),
        owner_label(.owner),
        owner_label(.hopeowner)
    )]
    InvalidOwner {
        compute_node_id: Option<i64>,
        address: String,
        owner: Option<String>,
        hopeowner: Option<String>,
    },

    // Persistence errors
    #[error("PCI device {}:{address} not found", node_label(.compute_node_id))]
    DeviceNotFound { compute_node_id: Option<i64>, address: String },

    #[error("PCI device with id {id} not found")]
    DeviceNotFoundById { id: i64 },

    #[error("Could not assign a uuid to PCI device {id}: concurrent writers kept conflicting")]
    UuidBackfillConflict { id: i64 },

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Database migration failed: {reason}")]
    MigrationFailed { reason: String },

    // Versioned serialization errors
    #[error("Unsupported object version: {version}")]
    UnsupportedVersion { version: String },

    #[error("Value {value} of field {field} cannot be sent to a version {target} consumer")]
    ValueTooNew { field: String, value: String, target: String },

    #[error("Invalid device primitive: {reason}")]
    InvalidPrimitive { reason: String },

    // Input errors
    #[error("Invalid PCI address: {address} (expected: 0000:01:00.0)")]
    InvalidAddress { address: String },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TrackerError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Create an InvalidPrimitive error.
    pub fn invalid_primitive(reason: impl Into<String>) -> Self {
        Self::InvalidPrimitive { reason: reason.into() }
    }
}

fn node_label(compute_node_id: &Option<i64>) -> String {
    compute_node_id.map_or_else(|| "None".to_string(), |id| id.to_string())
}

fn owner_label(owner: &Option<String>) -> &str {
    owner.as_deref().unwrap_or("None")
}

fn status_list(statuses: &[DeviceStatus]) -> String {
    let names: Vec<&str> = statuses.iter().map(DeviceStatus::as_str).collect();
    format!("[{}]", names.join(", "))
}
