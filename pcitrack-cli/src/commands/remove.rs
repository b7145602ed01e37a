use super::Context;
use anyhow::Result;
use colored::Colorize;

pub async fn remove(ctx: &Context, node: Option<i64>, address: &str) -> Result<()> {
    let mut tracker = ctx.tracker(node).await?;
    tracker.remove(address).await?;

    println!("{} Removed {}", "✓".green().bold(), address);
    Ok(())
}
