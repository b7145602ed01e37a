use super::{Context, DeviceRowView};
use anyhow::Result;
use pcitrack_core::state::devices_by_instance;
use tabled::{settings::Style, Table};

pub async fn instance(ctx: &Context, uuid: &str) -> Result<()> {
    let devices = devices_by_instance(ctx.store.as_ref(), uuid).await?;

    if devices.is_empty() {
        println!("No devices owned by instance {}", uuid);
        return Ok(());
    }

    let rows: Vec<DeviceRowView> =
        devices.iter().map(|(_, dev)| DeviceRowView::from(dev)).collect();
    let mut table = Table::new(rows);
    table.with(Style::modern());
    println!("{}", table);

    Ok(())
}
