use anyhow::Result;
use colored::Colorize;
use kegbrew::{Downloader, PackageManager};

/// Recreate the links of installed packages
pub fn link<D: Downloader>(pm: &PackageManager<D>, names: &[String]) -> Result<()> {
    for name in names {
        let report = pm.link(name)?;
        println!(
            "  {} Linked {} ({} files)",
            "✓".green(),
            name.bold(),
            report.linked.len().to_string().dimmed()
        );
        for path in &report.conflicts {
            println!(
                "    {} Not linked (already exists): {}",
                "⚠".yellow(),
                path.display()
            );
        }
    }
    Ok(())
}
