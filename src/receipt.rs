//! Install receipts and the receipt store.
//!
//! A receipt is the durable record that a package is installed. The store
//! keeps one JSON file per package name:
//!
//! ```text
//! <prefix>/var/keg/receipts/
//!   .lock            # advisory lock serializing commits system-wide
//!   openssl@3.json
//!   wget.json
//! ```
//!
//! The receipt store is the only source of truth for "is X installed"; a keg
//! directory without a receipt is treated as debris from an interrupted
//! transaction.
//!
//! Each receipt records:
//! - **Files**: every path the keg installed, relative to the prefix
//! - **Links**: the entry points created in the shared namespace (`bin/`, ...)
//! - **Dependencies**: direct dependencies at install time, flagged
//!   `build_only` when they were only needed to build
//!
//! # Examples
//!
//! ```no_run
//! use kegbrew::receipt::ReceiptStore;
//! use std::path::Path;
//!
//! fn main() -> anyhow::Result<()> {
//!     let store = ReceiptStore::open(Path::new("/opt/keg/var/keg/receipts"))?;
//!     for receipt in store.all()? {
//!         println!("{} {}", receipt.name, receipt.version);
//!     }
//!     Ok(())
//! }
//! ```

use crate::error::ReceiptError;
use crate::version::Version;
use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = ".lock";

/// A dependency edge as it stood when the package was installed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptDependency {
    pub name: String,
    /// Needed only to build; no receipt is required to exist for it
    #[serde(default)]
    pub build_only: bool,
}

/// Durable record of one installed package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub name: String,
    pub version: Version,
    #[serde(default)]
    pub variants: BTreeSet<String>,
    /// Installed files, relative to the prefix
    #[serde(default)]
    pub files: Vec<PathBuf>,
    /// Links created in the shared namespace, relative to the prefix
    #[serde(default)]
    pub links: Vec<PathBuf>,
    #[serde(default)]
    pub dependencies: Vec<ReceiptDependency>,
    pub installed_at: DateTime<Utc>,
    #[serde(default)]
    pub installed_on_request: bool,
}

impl Receipt {
    /// Names of dependencies that must stay installed for this package to run
    pub fn runtime_dependencies(&self) -> impl Iterator<Item = &str> {
        self.dependencies
            .iter()
            .filter(|d| !d.build_only)
            .map(|d| d.name.as_str())
    }

    /// Whether this installation satisfies a version constraint and variant
    /// flags
    pub fn satisfies(
        &self,
        constraint: &crate::version::VersionConstraint,
        variants: &BTreeSet<String>,
        latest: Option<&Version>,
    ) -> bool {
        constraint.matches(&self.version, latest) && variants.is_subset(&self.variants)
    }
}

/// Directory of receipts, one JSON file per package name
#[derive(Debug, Clone)]
pub struct ReceiptStore {
    dir: PathBuf,
}

impl ReceiptStore {
    /// Open the store, creating its directory if needed
    pub fn open(dir: &Path) -> Result<Self, ReceiptError> {
        fs::create_dir_all(dir).map_err(|source| ReceiptError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    /// Load the receipt for `name`, if installed
    pub fn load(&self, name: &str) -> Result<Option<Receipt>, ReceiptError> {
        let path = self.path_for(name);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(ReceiptError::Io { path, source }),
        };
        let receipt =
            serde_json::from_str(&contents).map_err(|source| ReceiptError::Parse { path, source })?;
        Ok(Some(receipt))
    }

    /// Every receipt in the store, sorted by name
    pub fn all(&self) -> Result<Vec<Receipt>, ReceiptError> {
        let io_err = |source| ReceiptError::Io {
            path: self.dir.clone(),
            source,
        };

        let mut receipts = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();

            // Skip the lock file and temp files
            if file_name.starts_with('.') {
                continue;
            }
            let Some(name) = file_name.strip_suffix(".json") else {
                continue;
            };
            if let Some(receipt) = self.load(name)? {
                receipts.push(receipt);
            }
        }

        receipts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(receipts)
    }

    /// Write a receipt, replacing any existing one for the same name
    pub fn write(&self, receipt: &Receipt) -> Result<(), ReceiptError> {
        let path = self.path_for(&receipt.name);
        let tmp = self.dir.join(format!(".{}.json.tmp", receipt.name));
        let json = serde_json::to_string_pretty(receipt).map_err(|source| ReceiptError::Parse {
            path: path.clone(),
            source,
        })?;

        fs::write(&tmp, json).map_err(|source| ReceiptError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| ReceiptError::Io { path, source })?;
        Ok(())
    }

    /// Delete the receipt for `name`. Missing receipts are not an error.
    pub fn remove(&self, name: &str) -> Result<(), ReceiptError> {
        let path = self.path_for(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ReceiptError::Io { path, source }),
        }
    }

    /// Receipts whose runtime dependencies include `name`
    pub fn dependents(&self, name: &str) -> Result<Vec<String>, ReceiptError> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|r| r.name != name && r.runtime_dependencies().any(|d| d == name))
            .map(|r| r.name)
            .collect())
    }

    /// Take the exclusive advisory lock that serializes commits.
    ///
    /// Blocks until the lock is available. Released when the guard drops.
    pub fn lock(&self) -> Result<ReceiptLock, ReceiptError> {
        let path = self.dir.join(LOCK_FILE);
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| ReceiptError::Io {
                path: path.clone(),
                source,
            })?;
        file.lock_exclusive()
            .map_err(|source| ReceiptError::Io { path, source })?;
        tracing::debug!("Acquired receipt lock in {}", self.dir.display());
        Ok(ReceiptLock { file })
    }
}

/// Held while a transaction commits; unlocks on drop
#[derive(Debug)]
pub struct ReceiptLock {
    file: fs::File,
}

impl Drop for ReceiptLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
