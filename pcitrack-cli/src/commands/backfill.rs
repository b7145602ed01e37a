use super::Context;
use anyhow::Result;
use colored::Colorize;
use pcitrack_core::state::populate_dev_uuids;

pub async fn backfill_uuids(ctx: &Context, max_count: Option<usize>) -> Result<()> {
    let max_count = max_count.unwrap_or(ctx.config.uuid_backfill_batch);
    let (found, done) = populate_dev_uuids(ctx.store.as_ref(), max_count).await?;

    if found == 0 {
        println!("{} All devices have uuids", "✓".green().bold());
    } else {
        println!("{} Assigned uuids to {} of {} devices", "✓".green().bold(), done, found);
        if found == max_count {
            println!("More devices may be missing uuids; run again to continue");
        }
    }

    Ok(())
}
