//! High-level PackageManager API - one handle over the resolver, cache and
//! installer.
//!
//! The lower-level modules take their collaborators explicitly; this module
//! wires them together from a [`Config`] the way the `keg` binary uses them.
//! Keep one instance alive for a session: it owns the artifact cache handle
//! and the memoized formula store.
//!
//! # Quick Start
//!
//! ```no_run
//! use kegbrew::{Config, NoProgress, PackageManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pm = PackageManager::new(Config::load()?)?;
//!
//!     let result = pm.install(&["wget".parse()?], &NoProgress).await?;
//!     println!("Installed {} packages", result.report.actions());
//!
//!     for receipt in pm.list()? {
//!         println!("{} {}", receipt.name, receipt.version);
//!     }
//!     Ok(())
//! }
//! ```

use crate::cache::ArtifactCache;
use crate::cancel::CancellationToken;
use crate::cellar::Layout;
use crate::config::Config;
use crate::download::{Downloader, HttpDownloader};
use crate::error::Result;
use crate::formula::{CachedFormulaStore, FormulaStore, JsonFormulaStore};
use crate::installer::{ApplyReport, InstallError, Installer};
use crate::plan::InstallationPlan;
use crate::progress::ProgressCallback;
use crate::receipt::Receipt;
use crate::resolver::{ResolveOptions, Resolver};
use crate::symlink::LinkReport;
use crate::version::{PackageSpec, Version, VersionConstraint};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Result of an install operation
#[derive(Debug, Clone)]
pub struct InstallResult {
    pub plan: InstallationPlan,
    pub report: ApplyReport,
    /// Time taken (milliseconds)
    pub time_ms: u64,
}

/// An installed package with a newer formula version available
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutdatedPackage {
    pub name: String,
    pub installed: Version,
    pub latest: Version,
}

pub struct PackageManager<D: Downloader = HttpDownloader> {
    config: Config,
    store: Arc<dyn FormulaStore>,
    installer: Installer<D>,
}

impl PackageManager<HttpDownloader> {
    /// Open the cache, load formulae and prepare the prefix described by
    /// `config`.
    pub fn new(config: Config) -> Result<Self> {
        let cache = Arc::new(ArtifactCache::open(
            &config.cache_dir,
            config.cache_budget_bytes,
            config.metadata_ttl(),
        )?);
        let formulae = JsonFormulaStore::load(&config.formula_dir())?;
        let store: Arc<dyn FormulaStore> =
            Arc::new(CachedFormulaStore::new(formulae, Some(Arc::clone(&cache))));
        let downloader = HttpDownloader::new(&config.cache_dir, config.download_retries)?;

        Self::with_parts(config, store, cache, downloader)
    }
}

impl<D: Downloader> PackageManager<D> {
    /// Assemble from explicit collaborators
    pub fn with_parts(
        config: Config,
        store: Arc<dyn FormulaStore>,
        cache: Arc<ArtifactCache>,
        downloader: D,
    ) -> Result<Self> {
        let installer = Installer::new(Layout::new(&config.prefix), cache, downloader)?
            .with_jobs(config.jobs)
            .with_platform(config.platform.clone());

        Ok(Self {
            config,
            store,
            installer,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn layout(&self) -> &Layout {
        self.installer.layout()
    }

    pub fn cache(&self) -> &Arc<ArtifactCache> {
        self.installer.cache()
    }

    pub fn store(&self) -> &dyn FormulaStore {
        self.store.as_ref()
    }

    pub fn resolve_options(&self) -> ResolveOptions {
        ResolveOptions {
            soft_edge_policy: self.config.soft_edge_policy,
            include_build_dependencies: true,
            max_backtracks: self.config.max_backtracks,
        }
    }

    /// Resolve `specs` against the formula store and the installed receipts
    pub fn plan(&self, specs: &[PackageSpec]) -> Result<InstallationPlan> {
        self.plan_with_cancel(specs, &CancellationToken::new())
    }

    pub fn plan_with_cancel(
        &self,
        specs: &[PackageSpec],
        cancel: &CancellationToken,
    ) -> Result<InstallationPlan> {
        let installed = self.installer.receipts().all()?;
        let resolver = Resolver::new(self.store.as_ref(), self.resolve_options());
        Ok(resolver.resolve_with_cancel(specs, &installed, cancel)?)
    }

    /// Resolve and apply in one step
    pub async fn install(
        &self,
        specs: &[PackageSpec],
        progress: &dyn ProgressCallback,
    ) -> Result<InstallResult> {
        self.install_with_cancel(specs, progress, &CancellationToken::new())
            .await
    }

    pub async fn install_with_cancel(
        &self,
        specs: &[PackageSpec],
        progress: &dyn ProgressCallback,
        cancel: &CancellationToken,
    ) -> Result<InstallResult> {
        let start = Instant::now();
        let plan = self.plan_with_cancel(specs, cancel)?;
        let report = self.apply(&plan, progress, cancel).await?;

        Ok(InstallResult {
            plan,
            report,
            time_ms: start.elapsed().as_millis() as u64,
        })
    }

    pub async fn apply(
        &self,
        plan: &InstallationPlan,
        progress: &dyn ProgressCallback,
        cancel: &CancellationToken,
    ) -> Result<ApplyReport> {
        Ok(self
            .installer
            .apply_with_cancel(plan, progress, cancel)
            .await?)
    }

    /// Uninstall `names`, dependents before the packages they need
    pub fn uninstall(&self, names: &[String], force: bool) -> Result<Vec<Receipt>> {
        let order = self.removal_order(names)?;
        let mut removed = Vec::with_capacity(order.len());
        for name in &order {
            removed.push(self.installer.uninstall(name, force)?);
        }
        Ok(removed)
    }

    /// Order a batch so that no package is removed while another member of
    /// the batch still depends on it. Members of a dependency cycle keep
    /// their argument order.
    pub fn removal_order(&self, names: &[String]) -> Result<Vec<String>> {
        let mut pending: Vec<String> = Vec::with_capacity(names.len());
        for name in names {
            if !pending.contains(name) {
                pending.push(name.clone());
            }
        }

        let receipts = self.installer.receipts();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for name in &pending {
            dependents.insert(name.clone(), receipts.dependents(name)?);
        }

        let mut order = Vec::with_capacity(pending.len());
        while !pending.is_empty() {
            let next = pending
                .iter()
                .position(|name| {
                    dependents
                        .get(name)
                        .is_none_or(|deps| deps.iter().all(|d| !pending.contains(d)))
                })
                .unwrap_or(0);
            order.push(pending.remove(next));
        }
        Ok(order)
    }

    /// Installed packages whose newest known formula is newer than the
    /// receipt, limited to `names` unless empty
    pub fn outdated(&self, names: &[String]) -> Result<Vec<OutdatedPackage>> {
        let receipts = self.list()?;
        for name in names {
            if !receipts.iter().any(|r| &r.name == name) {
                return Err(InstallError::NotInstalled(name.clone()).into());
            }
        }

        let mut outdated = Vec::new();
        for receipt in receipts {
            if !names.is_empty() && !names.contains(&receipt.name) {
                continue;
            }
            let latest = self
                .store
                .lookup_formula(&receipt.name)
                .into_iter()
                .map(|f| f.version)
                .max();
            match latest {
                Some(latest) if latest > receipt.version => outdated.push(OutdatedPackage {
                    name: receipt.name,
                    installed: receipt.version,
                    latest,
                }),
                Some(_) => {}
                None => tracing::debug!("No formula for installed {}", receipt.name),
            }
        }
        Ok(outdated)
    }

    /// Plan upgrading `names` (every outdated package when empty) to their
    /// newest versions, keeping each receipt's variants and request flag
    pub fn plan_upgrade(
        &self,
        names: &[String],
        cancel: &CancellationToken,
    ) -> Result<InstallationPlan> {
        let outdated = self.outdated(names)?;
        if outdated.is_empty() {
            return Ok(InstallationPlan::default());
        }

        let receipts = self.list()?;
        let mut specs = Vec::with_capacity(outdated.len());
        let mut dependencies_only = Vec::new();
        for package in &outdated {
            let mut spec =
                PackageSpec::new(package.name.clone()).with_constraint(VersionConstraint::Latest);
            if let Some(receipt) = receipts.iter().find(|r| r.name == package.name) {
                spec.variants = receipt.variants.clone();
                if !receipt.installed_on_request {
                    dependencies_only.push(package.name.as_str());
                }
            }
            specs.push(spec);
        }

        let mut plan = self.plan_with_cancel(&specs, cancel)?;
        plan.unmark_requested(&dependencies_only);
        Ok(plan)
    }

    /// Upgrade `names`, or every outdated package when empty
    pub async fn upgrade(
        &self,
        names: &[String],
        progress: &dyn ProgressCallback,
    ) -> Result<InstallResult> {
        let start = Instant::now();
        let cancel = CancellationToken::new();
        let plan = self.plan_upgrade(names, &cancel)?;
        let report = self.apply(&plan, progress, &cancel).await?;

        Ok(InstallResult {
            plan,
            report,
            time_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Installed packages, sorted by name
    pub fn list(&self) -> Result<Vec<Receipt>> {
        Ok(self.installer.receipts().all()?)
    }

    pub fn link(&self, name: &str) -> Result<LinkReport> {
        Ok(self.installer.relink(name)?)
    }
}
