//! Keg relocation - replace path placeholders after extraction
//!
//! Bottles are built for a generic location and carry placeholders such as
//! `@@HOMEBREW_PREFIX@@` and `@@HOMEBREW_CELLAR@@` in scripts, pkg-config
//! files and other text. These are rewritten in the staged keg so the
//! committed keg refers to the real prefix. Binary files (anything containing
//! a NUL byte) are left untouched.

use rayon::prelude::*;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const PREFIX_PLACEHOLDERS: &[&str] = &["@@HOMEBREW_PREFIX@@", "@@KEG_PREFIX@@"];
const CELLAR_PLACEHOLDERS: &[&str] = &["@@HOMEBREW_CELLAR@@", "@@KEG_CELLAR@@"];

/// Rewrite placeholders in every text file under `keg`.
///
/// Returns the files that were changed.
pub fn relocate_keg(keg: &Path, prefix: &Path, cellar: &Path) -> io::Result<Vec<PathBuf>> {
    let prefix = prefix.to_string_lossy();
    let cellar = cellar.to_string_lossy();

    // Collect paths first; WalkDir keeps directory handles open
    let files: Vec<PathBuf> = WalkDir::new(keg)
        .follow_links(false)
        .max_open(64)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();

    // Each file is independent
    let results: Vec<io::Result<Option<PathBuf>>> = files
        .par_iter()
        .map(|file| {
            relocate_file(file, &prefix, &cellar).map(|changed| changed.then(|| file.clone()))
        })
        .collect();

    let mut changed = Vec::new();
    for result in results {
        if let Some(path) = result? {
            changed.push(path);
        }
    }
    changed.sort();

    if !changed.is_empty() {
        tracing::debug!("Relocated {} files in {}", changed.len(), keg.display());
    }
    Ok(changed)
}

fn relocate_file(path: &Path, prefix: &str, cellar: &str) -> io::Result<bool> {
    let bytes = fs::read(path)?;
    if bytes.contains(&0) {
        return Ok(false);
    }
    let Ok(text) = String::from_utf8(bytes) else {
        return Ok(false);
    };

    let has_placeholder = PREFIX_PLACEHOLDERS
        .iter()
        .chain(CELLAR_PLACEHOLDERS)
        .any(|p| text.contains(p));
    if !has_placeholder {
        return Ok(false);
    }

    let mut relocated = text;
    for placeholder in CELLAR_PLACEHOLDERS {
        relocated = relocated.replace(placeholder, cellar);
    }
    for placeholder in PREFIX_PLACEHOLDERS {
        relocated = relocated.replace(placeholder, prefix);
    }

    // Keep the original permissions (scripts stay executable)
    let permissions = fs::metadata(path)?.permissions();
    fs::write(path, relocated)?;
    fs::set_permissions(path, permissions)?;
    Ok(true)
}
