use super::Context;
use anyhow::Result;
use colored::Colorize;
use pcitrack_core::Instance;

pub async fn free(
    ctx: &Context,
    node: Option<i64>,
    address: &str,
    instance_uuid: Option<&str>,
) -> Result<()> {
    let mut tracker = ctx.tracker(node).await?;
    let mut instance = instance_uuid.map(Instance::new);
    let changed = tracker.free(address, instance.as_mut()).await?;

    println!("{} Freed {}", "✓".green().bold(), address);
    for other in changed.iter().filter(|a| a.as_str() != address) {
        println!("  {} released with it", other);
    }
    Ok(())
}
