//! Command implementations for the keg CLI
//!
//! - **install**: planning, installation and removal
//! - **list**: installed packages
//! - **upgrade**: outdated packages and upgrading them
//! - **linking**: symlink repair
//! - **cache**: artifact cache maintenance
//! - **config**: effective configuration

pub mod cache;
pub mod config;
pub mod install;
pub mod linking;
pub mod list;
pub mod upgrade;

pub use cache::{CacheAction, cache};
pub use config::config;
pub use install::{install, plan, uninstall};
pub use linking::link;
pub use list::list;
pub use upgrade::{outdated, upgrade};

use anyhow::{Context, Result};
use kegbrew::PackageSpec;

/// Parse `name[variant,...]<constraint>` arguments, e.g. `wget[with-gpgme]>=1.21`
pub(crate) fn parse_specs(args: &[String]) -> Result<Vec<PackageSpec>> {
    args.iter()
        .map(|arg| {
            arg.parse::<PackageSpec>()
                .with_context(|| format!("Invalid package spec '{}'", arg))
        })
        .collect()
}

pub(crate) fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
