use super::format_size;
use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;
use kegbrew::{Downloader, PackageManager};

#[derive(Subcommand, Debug, Clone, Copy)]
pub enum CacheAction {
    /// Show cache location and usage (default)
    Stats,
    /// Drop expired metadata and evict down to the size budget
    Clean,
    /// Re-hash cached artifacts and drop the ones that no longer match
    Verify,
    /// Remove every unpinned entry
    Purge,
}

pub fn cache<D: Downloader>(pm: &PackageManager<D>, action: CacheAction) -> Result<()> {
    let cache = pm.cache();

    match action {
        CacheAction::Stats => {
            let stats = cache.stats();
            println!("{}", "==> Artifact Cache".bold().green());
            println!();
            println!(
                "{}: {}",
                "Location".bold(),
                cache.root().display().to_string().cyan()
            );
            println!(
                "{}: {} ({} artifacts, {} metadata)",
                "Entries".bold(),
                stats.entries.to_string().cyan(),
                stats.artifacts,
                stats.metadata
            );
            println!(
                "{}: {} of {}",
                "Size".bold(),
                format_size(stats.total_size).cyan(),
                format_size(stats.budget)
            );
            if stats.entries > 0 {
                println!();
                println!("Run {} to free space", "keg cache purge".dimmed());
            }
        }
        CacheAction::Clean => {
            println!("Cleaning artifact cache...");
            let expired = cache.purge_expired()?;
            let evicted = cache.evict_if_over_budget()?;
            let freed: u64 = expired.iter().chain(&evicted).map(|e| e.size).sum();
            println!(
                "{} Removed {} expired and {} evicted entries, freed {}",
                "✓".green().bold(),
                expired.len().to_string().bold(),
                evicted.len().to_string().bold(),
                format_size(freed).bold()
            );
        }
        CacheAction::Verify => {
            let invalid = cache.verify()?;
            if invalid.is_empty() {
                println!("{} All cache entries verified", "✓".green());
            } else {
                for fingerprint in &invalid {
                    println!("  {} Dropped corrupt entry {}", "✗".red(), fingerprint);
                }
            }
        }
        CacheAction::Purge => {
            let before = cache.stats().total_size;
            let removed = cache.clear()?;
            let freed = before.saturating_sub(cache.stats().total_size);
            println!(
                "{} Removed {} entries, freed {}",
                "✓".green().bold(),
                removed.to_string().bold(),
                format_size(freed).bold()
            );
        }
    }
    Ok(())
}
