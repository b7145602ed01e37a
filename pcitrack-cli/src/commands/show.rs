use super::Context;
use anyhow::Result;
use colored::Colorize;

pub async fn show(ctx: &Context, node: Option<i64>, address: &str) -> Result<()> {
    let tracker = ctx.tracker(node).await?;
    let dev = tracker.device(address)?;
    let devices = tracker.devices();

    println!("{}", dev.address.bold());
    println!("  Node:       {}", tracker.compute_node_id());
    println!("  Type:       {}", dev.dev_type);
    println!("  Vendor:     {}", dev.vendor_id);
    println!("  Product:    {}", dev.product_id);
    println!("  Status:     {}", dev.status);
    if let Some(uuid) = dev.uuid {
        println!("  UUID:       {}", uuid);
    }
    if let Some(label) = &dev.label {
        println!("  Label:      {}", label);
    }
    if let Some(numa) = dev.numa_node {
        println!("  NUMA node:  {}", numa);
    }
    if let Some(owner) = &dev.instance_uuid {
        println!("  Instance:   {}", owner);
    }
    if let Some(request) = &dev.request_id {
        println!("  Request:    {}", request);
    }
    if let Some(mac) = dev.mac_address() {
        println!("  MAC:        {}", mac);
    }
    let network = dev.network_caps();
    if !network.is_empty() {
        println!("  Network:    {}", network.join(", "));
    }

    if let Some(key) = devices.find(dev.compute_node_id, &dev.address) {
        if let Some(parent) = devices.parent_of(key).and_then(|k| devices.get(k)) {
            println!("  Parent:     {} ({})", parent.address, parent.status);
        } else if let Some(parent_addr) = &dev.parent_addr {
            println!("  Parent:     {} ({})", parent_addr, "not tracked".dimmed());
        }

        let children = devices.children_of(key);
        if !children.is_empty() {
            println!("  Children:");
            for child in children.iter().filter_map(|k| devices.get(*k)) {
                println!("    {} ({})", child.address, child.status);
            }
        }
    }

    Ok(())
}
