//! Payload extraction into staging directories.
//!
//! Bottles and source archives are tarballs, usually gzip-compressed. A
//! bottle lays its contents out as `<name>/<version>/...`; when Homebrew
//! rebuilds a bottle without changing the version it adds a revision suffix
//! (`1.0.0_1`). Archives without that layout are treated as the keg itself.
//!
//! ```text
//! Input:  wget--1.24.5.arm64_sonoma.bottle.tar.gz
//! Unpack: var/keg/staging/<txid>/wget/
//!           wget/1.24.5/bin/wget
//! Keg root: var/keg/staging/<txid>/wget/wget/1.24.5
//! ```

use flate2::read::GzDecoder;
use std::fs;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use tar::Archive;
use walkdir::WalkDir;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Unpack `payload` into `dest` and return the keg root inside it
pub fn unpack_payload(payload: &[u8], dest: &Path, name: &str, version: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(dest)?;

    let reader: Box<dyn Read + '_> = if payload.starts_with(&GZIP_MAGIC) {
        Box::new(GzDecoder::new(Cursor::new(payload)))
    } else {
        Box::new(Cursor::new(payload))
    };
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.unpack(dest)?;

    Ok(find_keg_root(dest, name, version))
}

/// Locate `<name>/<version>` or `<name>/<version>_N` under `dest`, else `dest`
fn find_keg_root(dest: &Path, name: &str, version: &str) -> PathBuf {
    let formula_dir = dest.join(name);
    if formula_dir.join(version).is_dir() {
        return formula_dir.join(version);
    }

    let revision_prefix = format!("{}_", version);
    let with_revision = fs::read_dir(&formula_dir).ok().and_then(|entries| {
        entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .find(|dir| dir.starts_with(&revision_prefix))
    });

    match with_revision {
        Some(dir) => formula_dir.join(dir),
        None => dest.to_path_buf(),
    }
}

/// Every non-directory entry under `root`, relative to it and sorted
pub fn manifest(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(io::Error::other)?;
        if entry.file_type().is_dir() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(root) {
            files.push(rel.to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use tempfile::TempDir;

    fn tarball(entries: &[(&str, &str)], gzip: bool) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, contents) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder
                .append_data(&mut header, path, contents.as_bytes())
                .unwrap();
        }
        let tar = builder.into_inner().unwrap();
        if !gzip {
            return tar;
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        std::io::Write::write_all(&mut encoder, &tar).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_bottle_layout() {
        let dir = TempDir::new().unwrap();
        let payload = tarball(&[("wget/1.24.5/bin/wget", "bin")], true);

        let root = unpack_payload(&payload, dir.path(), "wget", "1.24.5").unwrap();
        assert_eq!(root, dir.path().join("wget/1.24.5"));
        assert_eq!(manifest(&root).unwrap(), vec![PathBuf::from("bin/wget")]);
    }

    #[test]
    fn test_bottle_revision() {
        let dir = TempDir::new().unwrap();
        let payload = tarball(&[("python/3.12.4_1/bin/python3", "py")], true);

        let root = unpack_payload(&payload, dir.path(), "python", "3.12.4").unwrap();
        assert_eq!(root, dir.path().join("python/3.12.4_1"));
    }

    #[test]
    fn test_flat_uncompressed_archive() {
        let dir = TempDir::new().unwrap();
        let payload = tarball(&[("bin/tool", "x"), ("share/doc/README", "y")], false);

        let root = unpack_payload(&payload, dir.path(), "tool", "1.0").unwrap();
        assert_eq!(root, dir.path());
        assert_eq!(manifest(&root).unwrap().len(), 2);
    }

    #[test]
    fn test_corrupt_payload_fails() {
        let dir = TempDir::new().unwrap();
        let mut payload = GZIP_MAGIC.to_vec();
        payload.extend_from_slice(b"not really gzip");
        assert!(unpack_payload(&payload, dir.path(), "x", "1").is_err());
    }
}
