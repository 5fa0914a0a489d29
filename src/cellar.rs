//! Prefix layout - where kegs, receipts and staging directories live

use std::fs;
use std::path::{Path, PathBuf};

/// Detect the install prefix on this system
pub fn detect_prefix() -> PathBuf {
    // First check environment variable
    if let Ok(prefix) = std::env::var("KEG_PREFIX") {
        return PathBuf::from(prefix);
    }

    // Detect by architecture
    #[cfg(target_arch = "aarch64")]
    {
        PathBuf::from("/opt/keg")
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        PathBuf::from("/usr/local")
    }
}

/// Paths below one prefix
///
/// ```text
/// <prefix>/
///   Cellar/<name>/<version>/     kegs
///   bin/ lib/ share/ ...         links into kegs
///   var/keg/receipts/            receipt store
///   var/keg/staging/<txid>/      per-transaction staging
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub prefix: PathBuf,
    pub cellar: PathBuf,
    pub receipts: PathBuf,
    pub staging: PathBuf,
}

impl Layout {
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        let prefix = prefix.into();
        Self {
            cellar: prefix.join("Cellar"),
            receipts: prefix.join("var/keg/receipts"),
            staging: prefix.join("var/keg/staging"),
            prefix,
        }
    }

    /// Create the Cellar, receipt and staging directories
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.cellar, &self.receipts, &self.staging] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// `Cellar/<name>/<version>`
    pub fn keg_path(&self, name: &str, version: &str) -> PathBuf {
        self.cellar.join(name).join(version)
    }

    /// `Cellar/<name>`
    pub fn rack_path(&self, name: &str) -> PathBuf {
        self.cellar.join(name)
    }

    /// Make an absolute path under the prefix relative to it
    pub fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.prefix).unwrap_or(path)
    }

    /// Versions present on disk for `name`, whether or not a receipt exists
    pub fn kegs(&self, name: &str) -> Vec<String> {
        let Ok(entries) = fs::read_dir(self.rack_path(name)) else {
            return Vec::new();
        };
        let mut versions: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|v| !v.starts_with('.'))
            .collect();
        versions.sort();
        versions
    }
}
