//! Content-addressed artifact and metadata cache.
//!
//! Payloads live under `objects/<ab>/<fingerprint>` below the cache root and
//! are described by a durable `index.json`. Because the location is derived
//! from the fingerprint, a payload is never rewritten in place: a corrected
//! artifact has a different checksum and therefore a different entry.
//!
//! # Fingerprints
//!
//! - **Artifacts**: the SHA-256 the formula declares for the archive
//! - **Metadata**: [`Formula::metadata_fingerprint`](crate::formula::Formula::metadata_fingerprint)
//!
//! # Expiry
//!
//! Metadata entries expire once they are older than the configured TTL
//! (24 hours by default). Artifacts never expire by age; they leave the cache
//! through size pressure ([`ArtifactCache::evict_if_over_budget`], least
//! recently validated first) or an explicit checksum mismatch
//! ([`ArtifactCache::invalidate`]). Entries pinned by an in-flight install
//! transaction are never evicted.
//!
//! # Sharing
//!
//! Several processes may open the same root. Every index mutation runs under
//! an exclusive `flock` on `<root>/.lock` and starts by merging the index on
//! disk into memory, so entries stored by another handle are never lost.
//! Pins are per handle.

use crate::error::CacheError;
use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use walkdir::WalkDir;

const INDEX_FILE: &str = "index.json";
const INDEX_VERSION: u32 = 1;
const LOCK_FILE: &str = ".lock";
/// Temp files older than this belong to a writer that died
const STALE_TMP_AGE: Duration = Duration::from_secs(60 * 60);

/// Get the default cache directory (~/.cache/keg/ or equivalent)
pub fn cache_dir() -> PathBuf {
    if let Some(cache_home) = std::env::var_os("XDG_CACHE_HOME") {
        PathBuf::from(cache_home).join("keg")
    } else if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".cache/keg")
    } else {
        PathBuf::from(".cache/keg")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Artifact,
    Metadata,
}

/// Index record for one cached payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub kind: EntryKind,
    /// Formula name for metadata entries
    #[serde(default)]
    pub label: Option<String>,
    /// Payload path relative to the cache root
    pub location: PathBuf,
    pub created: DateTime<Utc>,
    pub last_validated: DateTime<Utc>,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub artifacts: usize,
    pub metadata: usize,
    pub pinned: usize,
    pub total_size: u64,
    pub budget: u64,
}

#[derive(Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    entries: Vec<CacheEntry>,
}

#[derive(Default)]
struct CacheState {
    entries: BTreeMap<String, CacheEntry>,
    pins: HashMap<String, usize>,
    dirty: bool,
}

impl CacheState {
    fn total_size(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }

    fn is_pinned(&self, fingerprint: &str) -> bool {
        self.pins.get(fingerprint).is_some_and(|n| *n > 0)
    }

    fn add_pin(&mut self, fingerprint: &str) {
        *self.pins.entry(fingerprint.to_string()).or_insert(0) += 1;
    }
}

/// Exclusive lock on the cache index; unlocks on drop
struct IndexLock {
    file: fs::File,
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Durable content-addressed store shared by the resolver and the installer
pub struct ArtifactCache {
    root: PathBuf,
    budget: u64,
    metadata_ttl: Duration,
    state: Mutex<CacheState>,
    tmp_counter: AtomicU64,
}

impl std::fmt::Debug for ArtifactCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactCache")
            .field("root", &self.root)
            .field("budget", &self.budget)
            .field("metadata_ttl", &self.metadata_ttl)
            .finish()
    }
}

fn validate_fingerprint(fingerprint: &str) -> Result<(), CacheError> {
    let valid = fingerprint.len() >= 2
        && fingerprint.chars().all(|c| c.is_ascii_alphanumeric());
    if valid {
        Ok(())
    } else {
        Err(CacheError::InvalidFingerprint(fingerprint.to_string()))
    }
}

fn sha256_file(path: &Path) -> std::io::Result<String> {
    use std::io::Read;

    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0; 8192];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Load the index on disk. The flag reports whether entries were dropped
/// because their payload is gone.
fn read_index(root: &Path) -> Result<(BTreeMap<String, CacheEntry>, bool), CacheError> {
    let mut entries = BTreeMap::new();
    let mut dropped = false;
    let index_path = root.join(INDEX_FILE);
    if !index_path.exists() {
        return Ok((entries, dropped));
    }

    let contents = fs::read_to_string(&index_path).map_err(|e| CacheError::io(&index_path, e))?;
    let index: IndexFile = serde_json::from_str(&contents)?;
    for entry in index.entries {
        if root.join(&entry.location).is_file() {
            entries.insert(entry.fingerprint.clone(), entry);
        } else {
            dropped = true;
        }
    }
    Ok((entries, dropped))
}

impl ArtifactCache {
    /// Open (or create) a cache rooted at `root`.
    ///
    /// Index entries whose payload file has disappeared are dropped, payload
    /// files with no index entry are deleted and abandoned temp files are
    /// cleared.
    pub fn open(root: &Path, budget: u64, metadata_ttl: Duration) -> Result<Self, CacheError> {
        fs::create_dir_all(root.join("objects")).map_err(|e| CacheError::io(root, e))?;
        fs::create_dir_all(root.join("tmp")).map_err(|e| CacheError::io(root, e))?;

        let cache = Self {
            root: root.to_path_buf(),
            budget,
            metadata_ttl,
            state: Mutex::new(CacheState::default()),
            tmp_counter: AtomicU64::new(0),
        };

        {
            let mut state = cache.state();
            let _lock = cache.lock_index()?;
            cache.sync_locked(&mut state)?;
            cache.sweep_locked(&state);
            cache.persist_locked(&mut state)?;
            tracing::debug!(
                "Opened cache at {} with {} entries",
                root.display(),
                state.entries.len()
            );
        }

        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        // A panic while holding the lock cannot leave the map half-updated
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Blocks until no other handle is mutating the index.
    ///
    /// Always taken after the state mutex.
    fn lock_index(&self) -> Result<IndexLock, CacheError> {
        let path = self.root.join(LOCK_FILE);
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| CacheError::io(&path, e))?;
        file.lock_exclusive().map_err(|e| CacheError::io(&path, e))?;
        Ok(IndexLock { file })
    }

    /// Replace the in-memory index with the one on disk, keeping the newer
    /// last-validated time of entries both sides know.
    fn sync_locked(&self, state: &mut CacheState) -> Result<(), CacheError> {
        let (mut merged, dropped) = read_index(&self.root)?;
        if dropped {
            state.dirty = true;
        }
        for entry in merged.values_mut() {
            if let Some(mine) = state.entries.get(&entry.fingerprint) {
                if mine.last_validated > entry.last_validated {
                    entry.last_validated = mine.last_validated;
                    state.dirty = true;
                }
            }
        }
        state.entries = merged;
        Ok(())
    }

    /// Delete payloads no entry describes and temp files nobody will rename
    fn sweep_locked(&self, state: &CacheState) {
        let objects = WalkDir::new(self.root.join("objects"))
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file());
        for entry in objects {
            let name = entry.file_name().to_string_lossy();
            if !state.entries.contains_key(&*name) {
                tracing::debug!("Removing unindexed payload {}", entry.path().display());
                let _ = fs::remove_file(entry.path());
            }
        }

        let Ok(tmp) = fs::read_dir(self.root.join("tmp")) else {
            return;
        };
        let now = SystemTime::now();
        for entry in tmp.filter_map(|e| e.ok()) {
            let stale = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age >= STALE_TMP_AGE);
            if stale {
                let _ = fs::remove_file(entry.path());
            }
        }
    }

    /// Run `f` against the merged index under both locks, then persist
    fn transaction<T>(
        &self,
        f: impl FnOnce(&mut CacheState) -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        let mut state = self.state();
        let _lock = self.lock_index()?;
        self.sync_locked(&mut state)?;
        let out = f(&mut state)?;
        self.persist_locked(&mut state)?;
        Ok(out)
    }

    fn location_for(fingerprint: &str) -> PathBuf {
        PathBuf::from("objects")
            .join(&fingerprint[..2])
            .join(fingerprint)
    }

    /// Absolute path of an entry's payload
    pub fn payload_path(&self, entry: &CacheEntry) -> PathBuf {
        self.root.join(&entry.location)
    }

    fn is_expired(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        if entry.kind != EntryKind::Metadata {
            return false;
        }
        let age = now.signed_duration_since(entry.created);
        age.to_std().map(|age| age >= self.metadata_ttl).unwrap_or(false)
    }

    /// Find an entry. A hit refreshes its last-validated time; an expired
    /// metadata entry or one whose payload vanished is dropped.
    pub fn lookup(&self, fingerprint: &str) -> Option<CacheEntry> {
        self.lookup_inner(fingerprint, false)
    }

    /// [`lookup`](Self::lookup) and pin the hit under the same lock, so
    /// nothing can evict it in between
    pub fn lookup_pinned(self: &Arc<Self>, fingerprint: &str) -> Option<(CacheEntry, CachePin)> {
        let entry = self.lookup_inner(fingerprint, true)?;
        Some((entry, self.guard(fingerprint)))
    }

    fn lookup_inner(&self, fingerprint: &str, pin: bool) -> Option<CacheEntry> {
        validate_fingerprint(fingerprint).ok()?;
        let now = Utc::now();
        let mut state = self.state();

        if !state.entries.contains_key(fingerprint) {
            if !self.root.join(Self::location_for(fingerprint)).is_file() {
                return None;
            }
            // Stored by another handle since the index was last read
            let _lock = self.lock_index().ok()?;
            self.sync_locked(&mut state).ok()?;
        }

        let entry = state.entries.get(fingerprint)?.clone();
        let stale = self.is_expired(&entry, now) || !self.payload_path(&entry).is_file();
        if stale {
            if !state.is_pinned(fingerprint) {
                let removed = self.lock_index().and_then(|_lock| {
                    self.sync_locked(&mut state)?;
                    if self.remove_locked(&mut state, fingerprint).is_some() {
                        self.persist_locked(&mut state)?;
                    }
                    Ok(())
                });
                if let Err(e) = removed {
                    tracing::warn!("Failed to drop stale cache entry {}: {}", fingerprint, e);
                }
            }
            return None;
        }

        let entry = state.entries.get_mut(fingerprint)?;
        entry.last_validated = now;
        let entry = entry.clone();
        state.dirty = true;
        if pin {
            state.add_pin(fingerprint);
        }
        Some(entry)
    }

    /// Store a payload under `fingerprint`.
    ///
    /// Idempotent: if the fingerprint is already cached the existing entry is
    /// returned and nothing is written. Runs eviction afterwards.
    pub fn store(
        &self,
        fingerprint: &str,
        kind: EntryKind,
        label: Option<&str>,
        payload: &[u8],
    ) -> Result<CacheEntry, CacheError> {
        self.store_inner(fingerprint, kind, label, payload, false)
    }

    /// [`store`](Self::store) and pin the entry before eviction runs
    pub fn store_pinned(
        self: &Arc<Self>,
        fingerprint: &str,
        kind: EntryKind,
        label: Option<&str>,
        payload: &[u8],
    ) -> Result<(CacheEntry, CachePin), CacheError> {
        let entry = self.store_inner(fingerprint, kind, label, payload, true)?;
        Ok((entry, self.guard(fingerprint)))
    }

    fn store_inner(
        &self,
        fingerprint: &str,
        kind: EntryKind,
        label: Option<&str>,
        payload: &[u8],
        pin: bool,
    ) -> Result<CacheEntry, CacheError> {
        validate_fingerprint(fingerprint)?;

        {
            let mut state = self.state();
            let existing = state
                .entries
                .get(fingerprint)
                .filter(|e| self.payload_path(e).is_file())
                .cloned();
            if let Some(existing) = existing {
                if pin {
                    state.add_pin(fingerprint);
                }
                return Ok(existing);
            }
        }

        // Write outside the locks; only the rename into place is serialized
        let tmp = self.root.join("tmp").join(format!(
            "{}.{}.{}",
            fingerprint,
            std::process::id(),
            self.tmp_counter.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&tmp, payload).map_err(|e| CacheError::io(&tmp, e))?;

        let result = self.transaction(|state| {
            let existing = state
                .entries
                .get(fingerprint)
                .filter(|e| self.payload_path(e).is_file())
                .cloned();
            if let Some(existing) = existing {
                tracing::debug!("Ignoring duplicate store of {}", fingerprint);
                if pin {
                    state.add_pin(fingerprint);
                }
                return Ok(existing);
            }

            let location = Self::location_for(fingerprint);
            let dest = self.root.join(&location);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
            }
            fs::rename(&tmp, &dest).map_err(|e| CacheError::io(&dest, e))?;

            let now = Utc::now();
            let entry = CacheEntry {
                fingerprint: fingerprint.to_string(),
                kind,
                label: label.map(str::to_string),
                location,
                created: now,
                last_validated: now,
                size: payload.len() as u64,
            };
            state.entries.insert(fingerprint.to_string(), entry.clone());
            state.dirty = true;
            if pin {
                state.add_pin(fingerprint);
            }

            let evicted = self.evict_locked(state, Some(fingerprint));
            if !evicted.is_empty() {
                tracing::debug!("Evicted {} cache entries", evicted.len());
            }
            Ok(entry)
        });

        // Already renamed on success
        let _ = fs::remove_file(&tmp);
        result
    }

    /// Read an entry's payload
    pub fn read(&self, entry: &CacheEntry) -> Result<Vec<u8>, CacheError> {
        let path = self.payload_path(entry);
        fs::read(&path).map_err(|e| CacheError::io(path, e))
    }

    /// Pin an entry for the life of the returned guard
    pub fn pin(self: &Arc<Self>, fingerprint: &str) -> Option<CachePin> {
        {
            let mut state = self.state();
            if !state.entries.contains_key(fingerprint) {
                return None;
            }
            state.add_pin(fingerprint);
        }
        Some(self.guard(fingerprint))
    }

    /// Guard for a pin already counted under the state lock
    fn guard(self: &Arc<Self>, fingerprint: &str) -> CachePin {
        CachePin {
            cache: Arc::clone(self),
            fingerprint: fingerprint.to_string(),
        }
    }

    fn unpin(&self, fingerprint: &str) {
        let mut state = self.state();
        if let Some(count) = state.pins.get_mut(fingerprint) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.pins.remove(fingerprint);
            }
        }
    }

    pub fn is_pinned(&self, fingerprint: &str) -> bool {
        self.state().is_pinned(fingerprint)
    }

    /// Drop an entry whose payload failed checksum verification.
    ///
    /// Returns whether an entry was removed.
    pub fn invalidate(&self, fingerprint: &str) -> Result<bool, CacheError> {
        self.transaction(|state| {
            let removed = self.remove_locked(state, fingerprint).is_some();
            if removed {
                tracing::warn!("Invalidated cache entry {}", fingerprint);
            }
            Ok(removed)
        })
    }

    /// Remove least-recently-validated entries until the cache fits its
    /// budget. Pinned entries are skipped.
    pub fn evict_if_over_budget(&self) -> Result<Vec<CacheEntry>, CacheError> {
        self.transaction(|state| Ok(self.evict_locked(state, None)))
    }

    /// Remove every expired metadata entry
    pub fn purge_expired(&self) -> Result<Vec<CacheEntry>, CacheError> {
        let now = Utc::now();
        self.transaction(|state| {
            let expired: Vec<String> = state
                .entries
                .values()
                .filter(|e| self.is_expired(e, now) && !state.is_pinned(&e.fingerprint))
                .map(|e| e.fingerprint.clone())
                .collect();
            Ok(expired
                .iter()
                .filter_map(|fp| self.remove_locked(state, fp))
                .collect())
        })
    }

    fn evict_locked(&self, state: &mut CacheState, keep: Option<&str>) -> Vec<CacheEntry> {
        let now = Utc::now();
        let mut evicted = Vec::new();

        let expired: Vec<String> = state
            .entries
            .values()
            .filter(|e| self.is_expired(e, now))
            .filter(|e| !state.is_pinned(&e.fingerprint) && Some(e.fingerprint.as_str()) != keep)
            .map(|e| e.fingerprint.clone())
            .collect();
        for fp in expired {
            evicted.extend(self.remove_locked(state, &fp));
        }

        if state.total_size() <= self.budget {
            return evicted;
        }

        let mut candidates: Vec<(DateTime<Utc>, String)> = state
            .entries
            .values()
            .filter(|e| !state.is_pinned(&e.fingerprint) && Some(e.fingerprint.as_str()) != keep)
            .map(|e| (e.last_validated, e.fingerprint.clone()))
            .collect();
        candidates.sort();

        for (_, fp) in candidates {
            if state.total_size() <= self.budget {
                break;
            }
            evicted.extend(self.remove_locked(state, &fp));
        }

        evicted
    }

    fn remove_locked(&self, state: &mut CacheState, fingerprint: &str) -> Option<CacheEntry> {
        let entry = state.entries.remove(fingerprint)?;
        state.dirty = true;
        let path = self.payload_path(&entry);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove cached payload {}: {}", path.display(), e);
            }
        }
        Some(entry)
    }

    /// Caller holds the index lock
    fn persist_locked(&self, state: &mut CacheState) -> Result<(), CacheError> {
        if !state.dirty {
            return Ok(());
        }
        let index = IndexFile {
            version: INDEX_VERSION,
            entries: state.entries.values().cloned().collect(),
        };
        let json = serde_json::to_vec_pretty(&index)?;
        let path = self.root.join(INDEX_FILE);
        let tmp = self.root.join(format!("{}.tmp", INDEX_FILE));
        fs::write(&tmp, json).map_err(|e| CacheError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| CacheError::io(&path, e))?;
        state.dirty = false;
        Ok(())
    }

    /// Write pending last-validated updates to the index
    pub fn flush(&self) -> Result<(), CacheError> {
        if !self.state().dirty {
            return Ok(());
        }
        self.transaction(|_| Ok(()))
    }

    /// Fresh metadata entries recorded for a formula name
    pub fn metadata_entries(&self, name: &str) -> Vec<CacheEntry> {
        let now = Utc::now();
        let state = self.state();
        state
            .entries
            .values()
            .filter(|e| e.kind == EntryKind::Metadata && e.label.as_deref() == Some(name))
            .filter(|e| !self.is_expired(e, now))
            .cloned()
            .collect()
    }

    pub fn entries(&self) -> Vec<CacheEntry> {
        self.state().entries.values().cloned().collect()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state();
        CacheStats {
            entries: state.entries.len(),
            artifacts: state
                .entries
                .values()
                .filter(|e| e.kind == EntryKind::Artifact)
                .count(),
            metadata: state
                .entries
                .values()
                .filter(|e| e.kind == EntryKind::Metadata)
                .count(),
            pinned: state.pins.len(),
            total_size: state.total_size(),
            budget: self.budget,
        }
    }

    /// Re-hash every artifact payload and drop the ones that no longer match
    /// their fingerprint. Returns the removed fingerprints.
    pub fn verify(&self) -> Result<Vec<String>, CacheError> {
        let artifacts: Vec<CacheEntry> = {
            let state = self.state();
            state
                .entries
                .values()
                .filter(|e| e.kind == EntryKind::Artifact && !state.is_pinned(&e.fingerprint))
                .cloned()
                .collect()
        };

        // Hashing is independent per file
        let corrupt: Vec<String> = artifacts
            .par_iter()
            .filter(|entry| match sha256_file(&self.payload_path(entry)) {
                Ok(actual) => !actual.eq_ignore_ascii_case(&entry.fingerprint),
                Err(_) => true,
            })
            .map(|entry| entry.fingerprint.clone())
            .collect();

        self.transaction(|state| {
            let mut removed = Vec::new();
            for fp in corrupt {
                if !state.is_pinned(&fp) && self.remove_locked(state, &fp).is_some() {
                    tracing::warn!("Removed corrupt cache entry {}", fp);
                    removed.push(fp);
                }
            }
            Ok(removed)
        })
    }

    /// Remove every unpinned entry. Returns how many were removed.
    pub fn clear(&self) -> Result<usize, CacheError> {
        self.transaction(|state| {
            let unpinned: Vec<String> = state
                .entries
                .keys()
                .filter(|fp| !state.is_pinned(fp))
                .cloned()
                .collect();
            Ok(unpinned
                .iter()
                .filter(|fp| self.remove_locked(state, fp).is_some())
                .count())
        })
    }
}

impl Drop for ArtifactCache {
    fn drop(&mut self) {
        // Flush last-validated updates so LRU order survives restarts
        let _ = self.flush();
    }
}

/// Keeps a cache entry from being evicted while an install transaction uses it
#[derive(Debug)]
pub struct CachePin {
    cache: Arc<ArtifactCache>,
    fingerprint: String,
}

impl CachePin {
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl Drop for CachePin {
    fn drop(&mut self) {
        self.cache.unpin(&self.fingerprint);
    }
}
