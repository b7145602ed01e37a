use super::{Context, DeviceRowView};
use anyhow::{Context as _, Result};
use pcitrack_core::DeviceStatus;
use tabled::{settings::Style, Table};

pub async fn list(ctx: &Context, node: Option<i64>, status: Option<&str>) -> Result<()> {
    let status: Option<DeviceStatus> = status
        .map(|s| s.parse().with_context(|| format!("Unknown status: {}", s)))
        .transpose()?;
    let tracker = ctx.tracker(node).await?;

    let rows: Vec<DeviceRowView> = tracker
        .devices()
        .iter()
        .map(|(_, dev)| dev)
        .filter(|dev| status.map_or(true, |s| dev.status == s))
        .map(DeviceRowView::from)
        .collect();

    if rows.is_empty() {
        println!("No devices found on node {}", tracker.compute_node_id());
        return Ok(());
    }

    let mut table = Table::new(rows);
    table.with(Style::modern());
    println!("{}", table);

    let counts = tracker.status_counts();
    let summary: Vec<String> =
        counts.iter().map(|(status, count)| format!("{} {}", count, status)).collect();
    println!("{}", summary.join(", "));

    Ok(())
}
