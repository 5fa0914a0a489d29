use super::install::{cancel_on_interrupt, print_plan, warn_if_inconsistent};
use anyhow::Result;
use colored::Colorize;
use kegbrew::progress::IndicatifProgress;
use kegbrew::{Action, CancellationToken, Downloader, PackageManager};

/// List installed packages that have a newer version available
pub fn outdated<D: Downloader>(pm: &PackageManager<D>, names: &[String], json: bool) -> Result<()> {
    let outdated = pm.outdated(names)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outdated)?);
        return Ok(());
    }

    if outdated.is_empty() {
        println!("{} All packages are up to date", "✓".green());
        return Ok(());
    }
    for package in &outdated {
        println!(
            "{} {} → {}",
            package.name.bold(),
            package.installed.to_string().dimmed(),
            package.latest.to_string().cyan()
        );
    }
    Ok(())
}

pub async fn upgrade<D: Downloader>(
    pm: &PackageManager<D>,
    names: &[String],
    dry_run: bool,
) -> Result<()> {
    if dry_run {
        println!("{} Dry run mode - no packages will be upgraded", "ℹ".blue());
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel_on_interrupt(&cancel);

    println!("Checking for outdated packages...");
    let plan = match pm.plan_upgrade(names, &cancel) {
        Ok(plan) => plan,
        Err(err) => {
            interrupt.abort();
            return Err(err.into());
        }
    };

    let changes = plan.changes().count();
    if changes == 0 {
        interrupt.abort();
        println!("{} All packages are up to date", "✓".green());
        return Ok(());
    }
    print_plan(&plan);

    if dry_run {
        interrupt.abort();
        println!("{} Dry run complete - no packages were upgraded", "✓".green());
        return Ok(());
    }

    let progress = IndicatifProgress::new(changes);
    let result = pm.apply(&plan, &progress, &cancel).await;
    interrupt.abort();

    let report = match result {
        Ok(report) => {
            progress.finish();
            report
        }
        Err(err) => {
            progress.fail();
            warn_if_inconsistent(&err);
            return Err(err.into());
        }
    };

    for name in &report.upgraded {
        if let Some(node) = plan.get(name) {
            if let Action::Upgrade { from } = &node.action {
                println!(
                    "  {} {} {} → {}",
                    "✓".green(),
                    name.bold(),
                    from.to_string().dimmed(),
                    node.version.to_string().cyan()
                );
            }
        }
    }
    for name in &report.installed {
        let version = plan.get(name).map(|n| n.version.to_string()).unwrap_or_default();
        println!(
            "  {} {} {} {}",
            "+".green(),
            name.bold(),
            version.dimmed(),
            "(new dependency)".dimmed()
        );
    }

    println!(
        "{} Upgraded {} packages in {}",
        "✓".green().bold(),
        report.upgraded.len().to_string().bold(),
        progress.elapsed()
    );
    Ok(())
}
