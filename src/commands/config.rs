use super::format_size;
use anyhow::Result;
use colored::Colorize;
use kegbrew::{Downloader, PackageManager};

/// Show the effective configuration
pub fn config<D: Downloader>(pm: &PackageManager<D>, json: bool) -> Result<()> {
    let config = pm.config();
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
        return Ok(());
    }

    let layout = pm.layout();
    println!("{}", "==> Configuration".bold().green());
    println!();

    println!("{}", "Paths:".bold());
    for (label, path) in [
        ("Prefix", &layout.prefix),
        ("Cellar", &layout.cellar),
        ("Receipts", &layout.receipts),
        ("Cache", &config.cache_dir),
    ] {
        println!(
            "  {}: {}",
            label.dimmed(),
            path.display().to_string().cyan()
        );
    }
    println!(
        "  {}: {}",
        "Formulae".dimmed(),
        config.formula_dir().display().to_string().cyan()
    );
    println!();

    println!("{}", "Settings:".bold());
    println!("  {}: {}", "Platform".dimmed(), config.platform.cyan());
    println!("  {}: {}", "Jobs".dimmed(), config.jobs.to_string().cyan());
    println!(
        "  {}: {}",
        "Cache budget".dimmed(),
        format_size(config.cache_budget_bytes).cyan()
    );
    println!(
        "  {}: {}s",
        "Metadata TTL".dimmed(),
        config.metadata_ttl_secs.to_string().cyan()
    );
    println!(
        "  {}: {}",
        "Soft edges".dimmed(),
        config.soft_edge_policy.to_string().cyan()
    );
    println!();

    println!("{}", "Statistics:".bold());
    println!(
        "  {}: {}",
        "Installed packages".dimmed(),
        pm.list()?.len().to_string().cyan()
    );
    println!(
        "  {}: {}",
        "Known formulae".dimmed(),
        pm.store().all_names().len().to_string().cyan()
    );
    Ok(())
}
