//! Symlink management for installed kegs
//!
//! Kegs expose their entry points by symlinking files from the linkable
//! directories (`bin`, `lib`, `share`, ...) into the same directories under
//! the prefix. Links are relative so the prefix can be relocated as a whole:
//!
//! ```text
//! <prefix>/bin/wget -> ../Cellar/wget/1.24.5/bin/wget
//! ```
//!
//! Linking is idempotent. A link that already points into another version of
//! the same package is repointed; a link or file owned by something else is
//! left alone and reported as a conflict.

use crate::cellar::Layout;
use std::fs;
use std::io;
use std::os::unix::fs as unix_fs;
use std::path::{Component, Path, PathBuf};

/// Directories to symlink from a keg to the prefix
pub const LINKABLE_DIRS: &[&str] = &[
    "bin",
    "sbin",
    "lib",
    "include",
    "share",
    "etc",
    "Frameworks",
];

/// Outcome of linking one keg
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkReport {
    /// Links that now point into the keg, relative to the prefix
    pub linked: Vec<PathBuf>,
    /// Paths left untouched because something else owns them
    pub conflicts: Vec<PathBuf>,
}

/// Resolve `.` and `..` components without touching the filesystem
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push("..");
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// Relative path that leads from directory `from` to `to`
fn relative_path(from: &Path, to: &Path) -> PathBuf {
    let from = normalize_path(from);
    let to = normalize_path(to);
    let from: Vec<Component> = from.components().collect();
    let to: Vec<Component> = to.components().collect();

    let common = from
        .iter()
        .zip(to.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut path = PathBuf::new();
    for _ in common..from.len() {
        path.push("..");
    }
    for component in &to[common..] {
        path.push(component.as_os_str());
    }
    path
}

/// Where an existing symlink points, as an absolute normalized path
fn resolve_link(link: &Path) -> Option<PathBuf> {
    let target = fs::read_link(link).ok()?;
    let resolved = if target.is_relative() {
        link.parent()?.join(target)
    } else {
        target
    };
    Some(normalize_path(&resolved))
}

/// Create symlinks in the prefix for every file in the keg's linkable
/// directories.
pub fn link_keg(layout: &Layout, name: &str, keg: &Path) -> io::Result<LinkReport> {
    let rack = normalize_path(&layout.rack_path(name));
    let mut report = LinkReport::default();

    for dir_name in LINKABLE_DIRS {
        let source_dir = keg.join(dir_name);

        // Skip if directory doesn't exist in the keg
        if !source_dir.is_dir() {
            continue;
        }

        let target_dir = layout.prefix.join(dir_name);
        fs::create_dir_all(&target_dir)?;
        link_directory(layout, &source_dir, &target_dir, &rack, &mut report)?;
    }

    report.linked.sort();
    Ok(report)
}

fn link_directory(
    layout: &Layout,
    source: &Path,
    target: &Path,
    rack: &Path,
    report: &mut LinkReport,
) -> io::Result<()> {
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let source_path = entry.path();
        let target_path = target.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            match target_path.symlink_metadata() {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => {
                    report.conflicts.push(layout.relative(&target_path).to_path_buf());
                    continue;
                }
                Err(_) => fs::create_dir_all(&target_path)?,
            }
            link_directory(layout, &source_path, &target_path, rack, report)?;
        } else {
            link_file(layout, &source_path, &target_path, rack, report)?;
        }
    }

    Ok(())
}

fn link_file(
    layout: &Layout,
    source: &Path,
    target: &Path,
    rack: &Path,
    report: &mut LinkReport,
) -> io::Result<()> {
    let source = normalize_path(source);
    let relative = layout.relative(target).to_path_buf();

    if let Ok(meta) = target.symlink_metadata() {
        if !meta.file_type().is_symlink() {
            tracing::warn!("Not linking {}: file exists", target.display());
            report.conflicts.push(relative);
            return Ok(());
        }

        match resolve_link(target) {
            Some(existing) if existing == source => {
                // Already linked correctly
                report.linked.push(relative);
                return Ok(());
            }
            Some(existing) if existing.starts_with(rack) => {
                // Points at another version of this package
                fs::remove_file(target)?;
            }
            _ => {
                tracing::warn!(
                    "Not linking {}: already linked by another package",
                    target.display()
                );
                report.conflicts.push(relative);
                return Ok(());
            }
        }
    }

    let parent = target.parent().unwrap_or(&layout.prefix);
    let link_target = relative_path(parent, &source);
    unix_fs::symlink(&link_target, target)?;
    report.linked.push(relative);
    Ok(())
}

/// Remove links (relative to the prefix) that still point under `owner`.
///
/// Links that were repointed elsewhere in the meantime are kept. Returns the
/// links that were removed.
pub fn unlink_paths(layout: &Layout, links: &[PathBuf], owner: &Path) -> io::Result<Vec<PathBuf>> {
    let owner = normalize_path(owner);
    let mut removed = Vec::new();

    for link in links {
        let path = layout.prefix.join(link);
        let is_symlink = path
            .symlink_metadata()
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if !is_symlink {
            continue;
        }
        if resolve_link(&path).is_some_and(|target| target.starts_with(&owner)) {
            fs::remove_file(&path)?;
            removed.push(link.clone());
        }
    }

    Ok(removed)
}

/// Remove every link in the prefix that points into `keg`
pub fn unlink_keg(layout: &Layout, keg: &Path) -> io::Result<Vec<PathBuf>> {
    let mut candidates = Vec::new();
    for dir_name in LINKABLE_DIRS {
        let source_dir = keg.join(dir_name);
        if !source_dir.is_dir() {
            continue;
        }
        for entry in walkdir::WalkDir::new(&source_dir).min_depth(1) {
            let entry = entry.map_err(io::Error::other)?;
            if entry.file_type().is_dir() {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(keg) {
                candidates.push(rel.to_path_buf());
            }
        }
    }
    unlink_paths(layout, &candidates, keg)
}
