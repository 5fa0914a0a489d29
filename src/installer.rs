//! Transactional installer.
//!
//! Applies an [`InstallationPlan`] to the prefix in two phases:
//!
//! 1. **Stage** - every install/upgrade node (build-only ones included) is
//!    fetched through the artifact cache, unpacked into a private staging
//!    directory and relocated. Staging runs on a bounded pool of tokio tasks
//!    that report back over a channel. Any failure aborts the transaction
//!    before the prefix is touched.
//! 2. **Commit** - on a blocking thread, holding the receipt store lock, each
//!    retained node is moved into the Cellar in plan order, its receipt is
//!    written and its links are created. If anything fails the packages
//!    committed so far are undone in reverse order.
//!
//! ```text
//! stage workers --(mpsc)--> coordinator --> commit thread (lock held)
//!                                              |-- backup old keg
//!                                              |-- rename staged keg
//!                                              |-- write receipt
//!                                              `-- link
//! ```
//!
//! Links the new version no longer provides are removed only after every
//! package has committed. Upgrade backups are deleted after the lock is
//! released. The commit thread owns the staging directory, so a caller that
//! stops polling `apply` mid-commit does not interrupt it.

use crate::cache::{ArtifactCache, CachePin, EntryKind};
use crate::cancel::CancellationToken;
use crate::cellar::Layout;
use crate::download::{self, DownloadError, Downloader};
use crate::error::{CacheError, ReceiptError};
use crate::extract;
use crate::formula::{DependencyKind, Formula};
use crate::plan::{Action, InstallationPlan};
use crate::progress::{Phase, ProgressCallback, ProgressEvent};
use crate::receipt::{Receipt, ReceiptDependency, ReceiptStore};
use crate::relocate;
use crate::symlink::{self, LinkReport};
use crate::version::Version;
use chrono::Utc;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};

static TRANSACTION_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Error, Debug)]
pub enum InstallError {
    #[error("Failed to download {package}: {source}")]
    DownloadFailed {
        package: String,
        #[source]
        source: DownloadError,
    },

    #[error("Checksum mismatch for {package}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        package: String,
        expected: String,
        actual: String,
    },

    #[error("Failed to stage {package}: {source}")]
    StagingIo {
        package: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to commit {package}: {source} ({})", rollback_state(.rollback_complete))]
    CommitIo {
        package: String,
        rolled_back: Vec<String>,
        rollback_complete: bool,
        #[source]
        source: io::Error,
    },

    #[error("Failed to acquire install lock: {0}")]
    Lock(#[source] ReceiptError),

    #[error("Installation cancelled")]
    Cancelled,

    #[error("{0} is not installed")]
    NotInstalled(String),

    #[error("{package} is required by: {}", .dependents.join(", "))]
    RequiredBy {
        package: String,
        dependents: Vec<String>,
    },

    #[error(transparent)]
    Receipt(#[from] ReceiptError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

fn rollback_state(complete: &bool) -> &'static str {
    if *complete {
        "rolled back"
    } else {
        "rollback incomplete"
    }
}

impl InstallError {
    /// Package the failure is about, when there is one
    pub fn package(&self) -> Option<&str> {
        match self {
            InstallError::DownloadFailed { package, .. }
            | InstallError::ChecksumMismatch { package, .. }
            | InstallError::StagingIo { package, .. }
            | InstallError::CommitIo { package, .. }
            | InstallError::RequiredBy { package, .. } => Some(package),
            InstallError::NotInstalled(package) => Some(package),
            _ => None,
        }
    }

    /// Whether the prefix may have been left modified
    pub fn state_changed(&self) -> bool {
        match self {
            InstallError::CommitIo {
                rollback_complete, ..
            } => !rollback_complete,
            _ => false,
        }
    }
}

/// What an `apply` call did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub installed: Vec<String>,
    pub upgraded: Vec<String>,
    pub skipped: Vec<String>,
    /// Staged to satisfy build edges, never committed
    pub build_only: Vec<String>,
    /// Link paths left alone because another package owns them
    pub link_conflicts: Vec<PathBuf>,
}

impl ApplyReport {
    /// Packages committed to the prefix
    pub fn actions(&self) -> usize {
        self.installed.len() + self.upgraded.len()
    }
}

/// A package unpacked and relocated in the staging directory
#[derive(Debug)]
struct StagedPackage {
    keg_root: PathBuf,
    /// Files below the keg root
    files: Vec<PathBuf>,
    _pin: CachePin,
}

enum StageMessage {
    Event(ProgressEvent),
    Done(usize, Result<StagedPackage, InstallError>),
}

/// Everything the commit thread needs for one package
#[derive(Debug)]
struct CommitItem {
    name: String,
    version: Version,
    variants: BTreeSet<String>,
    upgrade: bool,
    requested: bool,
    dependencies: Vec<ReceiptDependency>,
    staged: PathBuf,
    files: Vec<PathBuf>,
}

/// Undo record for one package touched by the commit phase
#[derive(Debug)]
struct Committed {
    name: String,
    keg: PathBuf,
    old_receipt: Option<Receipt>,
    /// (original keg path, backup path)
    backup: Option<(PathBuf, PathBuf)>,
    keg_created: bool,
    new_links: Vec<PathBuf>,
    conflicts: Vec<PathBuf>,
}

impl Committed {
    fn touched(&self) -> bool {
        self.keg_created || self.backup.is_some()
    }
}

#[derive(Debug, Default)]
struct CommitOutcome {
    installed: Vec<String>,
    upgraded: Vec<String>,
    conflicts: Vec<PathBuf>,
    /// Old kegs to delete once the lock is released
    backups: Vec<PathBuf>,
}

/// Removes the transaction's staging directory however the transaction ends
struct StagingDir(PathBuf);

impl Drop for StagingDir {
    fn drop(&mut self) {
        if self.0.exists() {
            if let Err(e) = fs::remove_dir_all(&self.0) {
                tracing::warn!("Failed to remove staging directory {}: {}", self.0.display(), e);
            }
        }
    }
}

/// Stops staging workers if the coordinator goes away
struct AbortOnDrop(CancellationToken);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

pub struct Installer<D: Downloader> {
    layout: Layout,
    receipts: ReceiptStore,
    cache: Arc<ArtifactCache>,
    downloader: Arc<D>,
    platform: String,
    jobs: usize,
}

impl<D: Downloader> Installer<D> {
    pub fn new(
        layout: Layout,
        cache: Arc<ArtifactCache>,
        downloader: D,
    ) -> Result<Self, InstallError> {
        layout.ensure().map_err(|source| InstallError::StagingIo {
            package: String::new(),
            source,
        })?;
        let receipts = ReceiptStore::open(&layout.receipts)?;
        Ok(Self {
            layout,
            receipts,
            cache,
            downloader: Arc::new(downloader),
            platform: crate::platform::detect_bottle_tag(),
            jobs: 4,
        })
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn receipts(&self) -> &ReceiptStore {
        &self.receipts
    }

    pub fn cache(&self) -> &Arc<ArtifactCache> {
        &self.cache
    }

    pub async fn apply(
        &self,
        plan: &InstallationPlan,
        progress: &dyn ProgressCallback,
    ) -> Result<ApplyReport, InstallError> {
        self.apply_with_cancel(plan, progress, &CancellationToken::new())
            .await
    }

    pub async fn apply_with_cancel(
        &self,
        plan: &InstallationPlan,
        progress: &dyn ProgressCallback,
        cancel: &CancellationToken,
    ) -> Result<ApplyReport, InstallError> {
        let mut report = ApplyReport::default();
        for node in plan.nodes() {
            match node.action {
                Action::Skip => report.skipped.push(node.name.clone()),
                _ if !node.retained => report.build_only.push(node.name.clone()),
                _ => {}
            }
        }

        let commits = plan.changes().filter(|n| n.retained).count();
        if commits == 0 {
            tracing::debug!("Nothing to install");
            report.build_only.clear();
            return Ok(report);
        }
        if cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }

        let txid = format!(
            "{}-{}-{}",
            Utc::now().format("%Y%m%dT%H%M%S"),
            std::process::id(),
            TRANSACTION_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let staging = StagingDir(self.layout.staging.join(&txid));
        fs::create_dir_all(&staging.0).map_err(|source| InstallError::StagingIo {
            package: String::new(),
            source,
        })?;

        let mut staged = self.stage(plan, &staging.0, progress, cancel).await?;

        if cancel.is_cancelled() {
            tracing::info!("Cancelled before commit; nothing was changed");
            return Err(InstallError::Cancelled);
        }

        let mut items = Vec::new();
        for (i, node) in plan.nodes().iter().enumerate() {
            if !node.retained || !node.action.changes_state() {
                continue;
            }
            let Some(package) = staged[i].as_ref() else {
                continue;
            };
            let dependencies = node
                .dependencies
                .iter()
                .zip(&node.dependency_kinds)
                .map(|(&d, kind)| ReceiptDependency {
                    name: plan.nodes()[d].name.clone(),
                    build_only: *kind == DependencyKind::Build || !plan.nodes()[d].retained,
                })
                .collect();
            items.push(CommitItem {
                name: node.name.clone(),
                version: node.version.clone(),
                variants: node.variants.clone(),
                upgrade: matches!(node.action, Action::Upgrade { .. }),
                requested: node.requested,
                dependencies,
                staged: package.keg_root.clone(),
                files: package.files.clone(),
            });
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let layout = self.layout.clone();
        let receipts = self.receipts.clone();
        let commit_txid = txid.clone();
        // The commit thread owns the staging directory, so dropping this
        // future mid-commit cannot delete kegs that are still to be moved
        let handle = tokio::task::spawn_blocking(move || -> Result<CommitOutcome, InstallError> {
            let _staging = staging;
            let outcome = commit(&layout, &receipts, items, &commit_txid, &tx)?;
            for backup in &outcome.backups {
                if let Err(e) = fs::remove_dir_all(backup) {
                    tracing::warn!("Failed to remove backup {}: {}", backup.display(), e);
                }
            }
            Ok(outcome)
        });

        // The commit thread drops its sender when it finishes
        while let Some(event) = rx.recv().await {
            progress.on_event(&event);
        }
        let outcome = handle.await.map_err(|e| InstallError::CommitIo {
            package: String::new(),
            rolled_back: Vec::new(),
            rollback_complete: false,
            source: io::Error::other(e.to_string()),
        })??;

        // Pins are released once the payloads are committed
        staged.clear();

        report.installed = outcome.installed;
        report.upgraded = outcome.upgraded;
        report.link_conflicts = outcome.conflicts;
        tracing::info!(
            "Committed {} packages in transaction {}",
            report.actions(),
            txid
        );
        Ok(report)
    }

    /// Stage every install/upgrade node. Returns staged packages by plan
    /// index.
    async fn stage(
        &self,
        plan: &InstallationPlan,
        staging: &Path,
        progress: &dyn ProgressCallback,
        cancel: &CancellationToken,
    ) -> Result<Vec<Option<StagedPackage>>, InstallError> {
        let semaphore = Arc::new(Semaphore::new(self.jobs));
        let abort = CancellationToken::new();
        let _abort_on_drop = AbortOnDrop(abort.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut pending = 0;
        for (i, node) in plan.nodes().iter().enumerate() {
            if !node.action.changes_state() {
                continue;
            }
            let Some(formula) = node.formula.clone() else {
                return Err(InstallError::StagingIo {
                    package: node.name.clone(),
                    source: io::Error::other("no formula for planned package"),
                });
            };

            let job = StageJob {
                formula,
                platform: self.platform.clone(),
                dest: staging.join(&node.name),
                prefix: self.layout.prefix.clone(),
                cellar: self.layout.cellar.clone(),
                cache: Arc::clone(&self.cache),
                tx: tx.clone(),
                abort: abort.clone(),
            };
            let downloader = Arc::clone(&self.downloader);
            let semaphore = Arc::clone(&semaphore);
            let tx = tx.clone();

            tokio::spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => job.run(downloader.as_ref()).await,
                    Err(_) => Err(InstallError::Cancelled),
                };
                let _ = tx.send(StageMessage::Done(i, result));
            });
            pending += 1;
        }
        drop(tx);

        let mut staged: Vec<Option<StagedPackage>> =
            (0..plan.len()).map(|_| None).collect();
        let mut failure = None;

        // Drain until every worker has reported so nothing is still writing
        // into the staging directory when it is removed
        while let Some(message) = rx.recv().await {
            match message {
                StageMessage::Event(event) => progress.on_event(&event),
                StageMessage::Done(i, Ok(package)) => {
                    pending -= 1;
                    progress.on_event(&ProgressEvent::new(&plan.nodes()[i].name, Phase::Stage));
                    staged[i] = Some(package);
                }
                StageMessage::Done(_, Err(e)) => {
                    pending -= 1;
                    if failure.is_none() {
                        tracing::debug!("Staging failed, aborting transaction: {}", e);
                        abort.cancel();
                        failure = Some(e);
                    }
                }
            }
            if cancel.is_cancelled() {
                abort.cancel();
            }
        }
        debug_assert_eq!(pending, 0);

        match failure {
            Some(e) => Err(e),
            None => Ok(staged),
        }
    }

    /// Remove a package: links, keg and receipt.
    ///
    /// Refuses while other installed packages depend on it at runtime unless
    /// `force` is set.
    pub fn uninstall(&self, name: &str, force: bool) -> Result<Receipt, InstallError> {
        let _lock = self.receipts.lock().map_err(InstallError::Lock)?;
        let receipt = self
            .receipts
            .load(name)?
            .ok_or_else(|| InstallError::NotInstalled(name.to_string()))?;

        if !force {
            let dependents = self.receipts.dependents(name)?;
            if !dependents.is_empty() {
                return Err(InstallError::RequiredBy {
                    package: name.to_string(),
                    dependents,
                });
            }
        }

        let keg = self.layout.keg_path(name, receipt.version.as_str());
        let removal = || -> io::Result<()> {
            symlink::unlink_paths(&self.layout, &receipt.links, &keg)?;
            if keg.exists() {
                symlink::unlink_keg(&self.layout, &keg)?;
                fs::remove_dir_all(&keg)?;
            }
            remove_empty_rack(&self.layout, name);
            self.receipts.remove(name).map_err(io::Error::other)
        };
        removal().map_err(|source| InstallError::CommitIo {
            package: name.to_string(),
            rolled_back: Vec::new(),
            rollback_complete: false,
            source,
        })?;

        tracing::info!("Uninstalled {} {}", name, receipt.version);
        Ok(receipt)
    }

    /// Recreate an installed package's links
    pub fn relink(&self, name: &str) -> Result<LinkReport, InstallError> {
        let _lock = self.receipts.lock().map_err(InstallError::Lock)?;
        let mut receipt = self
            .receipts
            .load(name)?
            .ok_or_else(|| InstallError::NotInstalled(name.to_string()))?;

        let keg = self.layout.keg_path(name, receipt.version.as_str());
        let report = symlink::link_keg(&self.layout, name, &keg).map_err(|source| {
            InstallError::StagingIo {
                package: name.to_string(),
                source,
            }
        })?;

        if report.linked != receipt.links {
            receipt.links = report.linked.clone();
            self.receipts.write(&receipt)?;
        }
        Ok(report)
    }
}

/// Inputs of one staging worker
struct StageJob {
    formula: Arc<Formula>,
    platform: String,
    dest: PathBuf,
    prefix: PathBuf,
    cellar: PathBuf,
    cache: Arc<ArtifactCache>,
    tx: mpsc::UnboundedSender<StageMessage>,
    abort: CancellationToken,
}

impl StageJob {
    fn package(&self) -> String {
        self.formula.name.clone()
    }

    fn staging_err(&self, source: io::Error) -> InstallError {
        InstallError::StagingIo {
            package: self.package(),
            source,
        }
    }

    async fn run<D: Downloader>(self, downloader: &D) -> Result<StagedPackage, InstallError> {
        if self.abort.is_cancelled() {
            return Err(InstallError::Cancelled);
        }
        let artifact = self.formula.artifact_for(&self.platform).clone();
        let fingerprint = artifact.sha256.to_ascii_lowercase();

        let cache = Arc::clone(&self.cache);
        let fp = fingerprint.clone();
        let cached = tokio::task::spawn_blocking(move || cached_payload(&cache, &fp))
            .await
            .map_err(|e| self.staging_err(io::Error::other(e.to_string())))??;

        let (payload, pin) = match cached {
            Some((payload, pin)) => (payload, Some(pin)),
            None => {
                if self.abort.is_cancelled() {
                    return Err(InstallError::Cancelled);
                }
                let payload = downloader
                    .fetch(&artifact.url, &fingerprint)
                    .await
                    .map_err(|e| match e {
                        DownloadError::ChecksumMismatch { expected, actual } => {
                            InstallError::ChecksumMismatch {
                                package: self.package(),
                                expected,
                                actual,
                            }
                        }
                        source => InstallError::DownloadFailed {
                            package: self.package(),
                            source,
                        },
                    })?;
                // Never trust a collaborator to have verified
                download::verify_checksum(&payload, &fingerprint).map_err(|e| match e {
                    DownloadError::ChecksumMismatch { expected, actual } => {
                        InstallError::ChecksumMismatch {
                            package: self.package(),
                            expected,
                            actual,
                        }
                    }
                    source => InstallError::DownloadFailed {
                        package: self.package(),
                        source,
                    },
                })?;
                let _ = self.tx.send(StageMessage::Event(
                    ProgressEvent::new(self.package(), Phase::Fetch).with_bytes(payload.len() as u64),
                ));
                (payload, None)
            }
        };

        if self.abort.is_cancelled() {
            return Err(InstallError::Cancelled);
        }

        let name = self.formula.name.clone();
        let version = self.formula.version.as_str().to_string();
        let package = self.package();
        tokio::task::spawn_blocking(move || -> Result<StagedPackage, InstallError> {
            let pin = match pin {
                Some(pin) => pin,
                None => {
                    let (_, pin) = self.cache.store_pinned(
                        &fingerprint,
                        EntryKind::Artifact,
                        None,
                        &payload,
                    )?;
                    pin
                }
            };

            let keg_root = extract::unpack_payload(&payload, &self.dest, &name, &version)
                .map_err(|e| self.staging_err(e))?;
            relocate::relocate_keg(&keg_root, &self.prefix, &self.cellar)
                .map_err(|e| self.staging_err(e))?;
            let files = extract::manifest(&keg_root).map_err(|e| self.staging_err(e))?;
            tracing::debug!("Staged {} {} at {}", name, version, keg_root.display());

            Ok(StagedPackage {
                keg_root,
                files,
                _pin: pin,
            })
        })
        .await
        .map_err(|e| InstallError::StagingIo {
            package,
            source: io::Error::other(e.to_string()),
        })?
    }
}

/// Read and pin a cached artifact, dropping it if it no longer matches its
/// checksum
fn cached_payload(
    cache: &Arc<ArtifactCache>,
    fingerprint: &str,
) -> Result<Option<(Vec<u8>, CachePin)>, InstallError> {
    let Some((entry, pin)) = cache.lookup_pinned(fingerprint) else {
        return Ok(None);
    };
    let payload = match cache.read(&entry) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!("Unreadable cache entry {}: {}", fingerprint, e);
            drop(pin);
            cache.invalidate(fingerprint)?;
            return Ok(None);
        }
    };
    if download::verify_checksum(&payload, fingerprint).is_err() {
        tracing::warn!("Cached artifact {} is corrupt; refetching", fingerprint);
        drop(pin);
        cache.invalidate(fingerprint)?;
        return Ok(None);
    }
    Ok(Some((payload, pin)))
}

fn remove_empty_rack(layout: &Layout, name: &str) {
    let rack = layout.rack_path(name);
    let is_empty = fs::read_dir(&rack)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false);
    if is_empty {
        let _ = fs::remove_dir(&rack);
    }
}

/// Commit phase. Runs on a blocking thread and never observes cancellation.
fn commit(
    layout: &Layout,
    receipts: &ReceiptStore,
    items: Vec<CommitItem>,
    txid: &str,
    events: &mpsc::UnboundedSender<ProgressEvent>,
) -> Result<CommitOutcome, InstallError> {
    let _lock = receipts.lock().map_err(InstallError::Lock)?;
    tracing::info!("Committing {} packages", items.len());

    let mut journal: Vec<Committed> = Vec::new();
    let mut outcome = CommitOutcome::default();

    for item in &items {
        if let Err(source) = commit_one(layout, receipts, item, txid, events, &mut journal) {
            tracing::info!("Commit of {} failed, rolling back: {}", item.name, source);
            let (rolled_back, rollback_complete) = rollback(layout, receipts, journal, events);
            return Err(InstallError::CommitIo {
                package: item.name.clone(),
                rolled_back,
                rollback_complete,
                source,
            });
        }
        if item.upgrade {
            outcome.upgraded.push(item.name.clone());
        } else {
            outcome.installed.push(item.name.clone());
        }
    }

    // Everything is committed; the remaining steps only clean up
    for entry in &journal {
        outcome.conflicts.extend(entry.conflicts.iter().cloned());
        let Some(old) = &entry.old_receipt else {
            continue;
        };
        let kept: HashSet<&PathBuf> = entry.new_links.iter().collect();
        let stale: Vec<PathBuf> = old
            .links
            .iter()
            .filter(|l| !kept.contains(l))
            .cloned()
            .collect();
        let old_keg = layout.keg_path(&old.name, old.version.as_str());
        if let Err(e) = symlink::unlink_paths(layout, &stale, &old_keg) {
            tracing::warn!("Failed to remove stale links of {}: {}", entry.name, e);
        }
    }
    outcome.backups = journal
        .into_iter()
        .filter_map(|entry| entry.backup.map(|(_, backup)| backup))
        .collect();

    Ok(outcome)
}

fn commit_one(
    layout: &Layout,
    receipts: &ReceiptStore,
    item: &CommitItem,
    txid: &str,
    events: &mpsc::UnboundedSender<ProgressEvent>,
    journal: &mut Vec<Committed>,
) -> io::Result<()> {
    let keg = layout.keg_path(&item.name, item.version.as_str());
    let old_receipt = receipts.load(&item.name).map_err(io::Error::other)?;

    journal.push(Committed {
        name: item.name.clone(),
        keg: keg.clone(),
        old_receipt: old_receipt.clone(),
        backup: None,
        keg_created: false,
        new_links: Vec::new(),
        conflicts: Vec::new(),
    });
    let Some(entry) = journal.last_mut() else {
        return Err(io::Error::other("empty journal"));
    };

    fs::create_dir_all(layout.rack_path(&item.name))?;

    if let Some(old) = &old_receipt {
        let old_keg = layout.keg_path(&old.name, old.version.as_str());
        if old_keg.exists() {
            let backup = layout
                .rack_path(&item.name)
                .join(format!(".backup-{}-{}", old.version, txid));
            fs::rename(&old_keg, &backup)?;
            entry.backup = Some((old_keg, backup));
        }
    }

    // A keg without a receipt is debris from an interrupted transaction
    if keg.exists() {
        fs::remove_dir_all(&keg)?;
    }
    fs::rename(&item.staged, &keg)?;
    entry.keg_created = true;

    let files = item
        .files
        .iter()
        .map(|f| layout.relative(&keg.join(f)).to_path_buf())
        .collect();
    let mut receipt = Receipt {
        name: item.name.clone(),
        version: item.version.clone(),
        variants: item.variants.clone(),
        files,
        links: Vec::new(),
        dependencies: item.dependencies.clone(),
        installed_at: Utc::now(),
        installed_on_request: item.requested
            || old_receipt.as_ref().is_some_and(|r| r.installed_on_request),
    };
    receipts.write(&receipt).map_err(io::Error::other)?;
    let _ = events.send(ProgressEvent::new(&item.name, Phase::Commit));

    let report = symlink::link_keg(layout, &item.name, &keg)?;
    entry.new_links = report.linked.clone();
    entry.conflicts = report.conflicts;
    receipt.links = report.linked;
    receipts.write(&receipt).map_err(io::Error::other)?;
    let _ = events.send(ProgressEvent::new(&item.name, Phase::Link));

    tracing::info!("Committed {} {}", item.name, item.version);
    Ok(())
}

/// Undo journal entries in reverse order. Returns the packages undone and
/// whether every step succeeded.
fn rollback(
    layout: &Layout,
    receipts: &ReceiptStore,
    journal: Vec<Committed>,
    events: &mpsc::UnboundedSender<ProgressEvent>,
) -> (Vec<String>, bool) {
    let mut rolled_back = Vec::new();
    let mut complete = true;

    for entry in journal.into_iter().rev() {
        let _ = events.send(ProgressEvent::new(&entry.name, Phase::Rollback));

        let undo = || -> io::Result<()> {
            if !entry.new_links.is_empty() {
                symlink::unlink_paths(layout, &entry.new_links, &entry.keg)?;
            }
            if entry.keg_created && entry.keg.exists() {
                fs::remove_dir_all(&entry.keg)?;
            }
            match &entry.old_receipt {
                Some(old) => receipts.write(old).map_err(io::Error::other)?,
                None => receipts.remove(&entry.name).map_err(io::Error::other)?,
            }
            if let Some((old_keg, backup)) = &entry.backup {
                fs::rename(backup, old_keg)?;
                symlink::link_keg(layout, &entry.name, old_keg)?;
            }
            if entry.old_receipt.is_none() {
                remove_empty_rack(layout, &entry.name);
            }
            Ok(())
        };

        if let Err(e) = undo() {
            tracing::warn!("Rollback of {} incomplete: {}", entry.name, e);
            complete = false;
        }
        if entry.touched() {
            tracing::info!("Rolled back {}", entry.name);
            rolled_back.push(entry.name);
        }
    }

    (rolled_back, complete)
}
