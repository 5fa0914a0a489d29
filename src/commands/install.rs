use super::parse_specs;
use anyhow::Result;
use colored::Colorize;
use kegbrew::progress::IndicatifProgress;
use kegbrew::{
    Action, CancellationToken, Downloader, InstallError, InstallationPlan, KegError, PackageManager,
    plan_summary,
};

/// Cancel `token` on Ctrl-C
pub(super) fn cancel_on_interrupt(token: &CancellationToken) -> tokio::task::JoinHandle<()> {
    let token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n{} Interrupted, cleaning up...", "⚠".yellow());
            token.cancel();
        }
    })
}

pub(super) fn print_plan(plan: &InstallationPlan) {
    for (line, node) in plan_summary(plan).iter().zip(plan.nodes()) {
        let marker = match node.action {
            Action::Install => "+".green(),
            Action::Upgrade { .. } => "↑".cyan(),
            Action::Skip => "=".dimmed(),
        };
        println!("  {} {}", marker, line);
    }
    for line in plan_summary(plan).iter().skip(plan.len()) {
        println!("  {} {}", "⚠".yellow(), line);
    }
}

/// Point at `keg link` when a failed commit could not fully roll back
pub(super) fn warn_if_inconsistent(err: &KegError) {
    if let KegError::Install(install_err) = err {
        if install_err.state_changed() {
            eprintln!(
                "{} The prefix may be inconsistent; run {} to repair links",
                "⚠".yellow(),
                "keg link <package>".dimmed()
            );
        }
    }
}

/// Resolve and show what `install` would do
pub fn plan<D: Downloader>(pm: &PackageManager<D>, args: &[String]) -> Result<()> {
    let specs = parse_specs(args)?;
    println!("Resolving dependencies...");
    let plan = pm.plan(&specs)?;
    print_plan(&plan);
    println!(
        "{} {} to install or upgrade",
        "==>".bold().green(),
        plan.changes().count().to_string().bold()
    );
    Ok(())
}

pub async fn install<D: Downloader>(
    pm: &PackageManager<D>,
    args: &[String],
    dry_run: bool,
) -> Result<()> {
    let specs = parse_specs(args)?;
    if dry_run {
        println!("Dry run mode - no packages will be installed");
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel_on_interrupt(&cancel);

    println!("Resolving dependencies...");
    let plan = pm.plan_with_cancel(&specs, &cancel)?;
    print_plan(&plan);

    let changes = plan.changes().count();
    if dry_run || changes == 0 {
        if changes == 0 {
            println!("{} Everything is already installed", "✓".green());
        }
        interrupt.abort();
        return Ok(());
    }

    println!(
        "Installing {} packages...",
        changes.to_string().bold()
    );
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

    for name in &report.installed {
        let version = plan.get(name).map(|n| n.version.to_string()).unwrap_or_default();
        println!("  {} {} {}", "✓".green(), name.bold(), version.dimmed());
    }
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
    for path in &report.link_conflicts {
        println!(
            "  {} Not linked (already exists): {}",
            "⚠".yellow(),
            path.display()
        );
    }

    println!(
        "{} Installed {} packages in {}",
        "✓".green().bold(),
        report.actions().to_string().bold(),
        progress.elapsed()
    );
    Ok(())
}

pub fn uninstall<D: Downloader>(
    pm: &PackageManager<D>,
    names: &[String],
    force: bool,
) -> Result<()> {
    let names = pm.removal_order(names)?;
    println!("Uninstalling {} packages...", names.len().to_string().bold());

    for name in &names {
        match pm.uninstall(std::slice::from_ref(name), force) {
            Ok(removed) => {
                for receipt in removed {
                    println!(
                        "  {} Uninstalled {} {}",
                        "✓".green(),
                        receipt.name.bold(),
                        receipt.version.to_string().dimmed()
                    );
                }
            }
            Err(KegError::Install(InstallError::RequiredBy { dependents, .. })) => {
                println!(
                    "  {} Cannot uninstall {} - required by: {}",
                    "⚠".yellow(),
                    name.bold(),
                    dependents.join(", ").cyan()
                );
                println!("    Use {} to force uninstall", "--force".dimmed());
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}
