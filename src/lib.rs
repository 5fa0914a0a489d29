//! Library interface for kegbrew (keg), a bottle-based package manager
//!
//! The engine is split into a resolver that turns package requests into an
//! [`InstallationPlan`], a content-addressed [`ArtifactCache`] and a
//! transactional [`Installer`] that applies plans to a prefix.
//! [`PackageManager`] wires them together from a [`Config`].

pub mod cache;
pub mod cancel;
pub mod cellar;
pub mod config;
pub mod download;
pub mod error;
pub mod extract;
pub mod formula;
pub mod installer;
pub mod package_manager;
pub mod plan;
pub mod platform;
pub mod progress;
pub mod receipt;
pub mod relocate;
pub mod resolver;
pub mod symlink;
pub mod version;

// Re-export commonly used types
pub use cache::{ArtifactCache, CacheEntry, CachePin, CacheStats, EntryKind};
pub use cancel::CancellationToken;
pub use cellar::Layout;
pub use config::{Config, SoftEdgePolicy};
pub use download::{Downloader, HttpDownloader};
pub use error::{KegError, Result};
pub use formula::{
    CachedFormulaStore, Dependency, DependencyKind, Formula, FormulaStore, JsonFormulaStore,
    MemoryFormulaStore,
};
pub use installer::{ApplyReport, InstallError, Installer};
pub use package_manager::{InstallResult, OutdatedPackage, PackageManager};
pub use plan::{Action, DroppedEdge, InstallationPlan, ResolvedNode, plan_summary};
pub use progress::{NoProgress, Phase, ProgressCallback, ProgressEvent};
pub use receipt::{Receipt, ReceiptStore};
pub use resolver::{ResolveError, ResolveOptions, Resolver};
pub use symlink::{LinkReport, normalize_path};
pub use version::{PackageSpec, Version, VersionConstraint};
