//! CLI command implementations

use anyhow::{Context as _, Result};
use pcitrack_core::{Config, NodeTracker, PciDevice, StateManager};
use std::sync::Arc;
use tabled::Tabled;
use tracing::debug;

pub mod backfill;
pub mod free;
pub mod instance;
pub mod list;
pub mod remove;
pub mod show;

pub use backfill::backfill_uuids;
pub use free::free;
pub use instance::instance;
pub use list::list;
pub use remove::remove;
pub use show::show;

/// Configuration plus an open database, shared by every command.
pub struct Context {
    pub config: Config,
    pub store: Arc<StateManager>,
}

impl Context {
    pub async fn open(config: Config) -> Result<Self> {
        let db_path = config.db_path();
        debug!("Opening device database at {}", db_path.display());
        let store = StateManager::new(&db_path)
            .await
            .with_context(|| format!("Failed to open database {}", db_path.display()))?;
        Ok(Self { config, store: Arc::new(store) })
    }

    /// The node given on the command line, else the configured one.
    pub fn node(&self, node: Option<i64>) -> Result<i64> {
        node.or(self.config.compute_node_id).ok_or_else(|| {
            anyhow::anyhow!("No compute node given: pass --node or set compute_node_id")
        })
    }

    pub async fn tracker(&self, node: Option<i64>) -> Result<NodeTracker> {
        let node = self.node(node)?;
        let tracker = NodeTracker::load(self.store.clone(), node)
            .await
            .with_context(|| format!("Failed to load devices of node {}", node))?;
        Ok(tracker)
    }
}

#[derive(Tabled)]
pub(crate) struct DeviceRowView {
    #[tabled(rename = "ADDRESS")]
    address: String,
    #[tabled(rename = "TYPE")]
    dev_type: String,
    #[tabled(rename = "VENDOR:PRODUCT")]
    ids: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "INSTANCE")]
    instance: String,
    #[tabled(rename = "PARENT")]
    parent: String,
    #[tabled(rename = "NUMA")]
    numa: String,
}

impl From<&PciDevice> for DeviceRowView {
    fn from(dev: &PciDevice) -> Self {
        Self {
            address: dev.address.clone(),
            dev_type: dev.dev_type.to_string(),
            ids: format!("{}:{}", dev.vendor_id, dev.product_id),
            status: dev.status.to_string(),
            instance: dev.instance_uuid.clone().unwrap_or_else(|| "-".to_string()),
            parent: dev.parent_addr.clone().unwrap_or_else(|| "-".to_string()),
            numa: dev.numa_node.map(|n| n.to_string()).unwrap_or_else(|| "-".to_string()),
        }
    }
}
