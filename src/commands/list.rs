use anyhow::Result;
use colored::Colorize;
use kegbrew::{Downloader, PackageManager};

pub fn list<D: Downloader>(pm: &PackageManager<D>, versions: bool, json: bool) -> Result<()> {
    let receipts = pm.list()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&receipts)?);
        return Ok(());
    }

    // Names only when piped, like brew
    let is_tty = std::io::IsTerminal::is_terminal(&std::io::stdout());
    if !is_tty && !versions {
        for receipt in &receipts {
            println!("{}", receipt.name);
        }
        return Ok(());
    }

    if receipts.is_empty() {
        println!("No packages installed");
        return Ok(());
    }

    if is_tty {
        println!("{}", "==> Installed".bold().green());
    }
    for receipt in &receipts {
        let mut line = format!("{}", receipt.name.bold());
        if versions {
            line.push_str(&format!(" {}", receipt.version.to_string().cyan()));
            if !receipt.variants.is_empty() {
                let variants: Vec<&str> = receipt.variants.iter().map(String::as_str).collect();
                line.push_str(&format!(" [{}]", variants.join(",")));
            }
        }
        if !receipt.installed_on_request {
            line.push_str(&format!(" {}", "(dependency)".dimmed()));
        }
        println!("{}", line);
    }
    Ok(())
}
