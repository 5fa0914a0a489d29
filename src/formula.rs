//! Formula records and the stores that serve them.
//!
//! Formulae are produced by an external translator (the formula DSL parser)
//! and consumed read-only by the resolver. A store maps a package name to
//! every version it knows about.
//!
//! # Stores
//!
//! - [`MemoryFormulaStore`]: a plain map, used by tests and as the backing
//!   store of the others
//! - [`JsonFormulaStore`]: a directory of `*.json` files, each holding one
//!   formula or an array of formulae
//! - [`CachedFormulaStore`]: memoizes lookups for the life of the process and
//!   mirrors every formula it sees into the [`ArtifactCache`] as a metadata
//!   entry, so a name that vanished upstream still resolves until the entry's
//!   TTL runs out
//!
//! # JSON shape
//!
//! ```json
//! {
//!   "name": "wget",
//!   "version": "1.24.5",
//!   "dependencies": [
//!     { "name": "pkg-config", "kind": "build" },
//!     { "name": "openssl@3", "constraint": ">=3.0" }
//!   ],
//!   "source": { "url": "https://ftp.gnu.org/gnu/wget/wget-1.24.5.tar.gz", "sha256": "..." },
//!   "bottles": { "arm64_sonoma": { "url": "...", "sha256": "..." } }
//! }
//! ```

use crate::cache::{ArtifactCache, EntryKind};
use crate::error::FormulaError;
use crate::version::{PackageSpec, Version};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// How a dependency edge is used
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    /// Needed only while building; not retained after install
    Build,
    #[default]
    Runtime,
    /// Followed only when the requester asks for `with-<dep>`
    Optional,
    /// Followed unless the requester asks for `without-<dep>`
    Recommended,
}

impl DependencyKind {
    /// Soft edges may be dropped when they make resolution unsatisfiable
    pub fn is_soft(self) -> bool {
        matches!(self, DependencyKind::Optional | DependencyKind::Recommended)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DependencyKind::Build => "build",
            DependencyKind::Runtime => "runtime",
            DependencyKind::Optional => "optional",
            DependencyKind::Recommended => "recommended",
        }
    }
}

/// A declared dependency: a spec plus the edge kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    #[serde(flatten)]
    pub spec: PackageSpec,
    #[serde(default)]
    pub kind: DependencyKind,
}

impl Dependency {
    pub fn new(spec: PackageSpec, kind: DependencyKind) -> Self {
        Self { spec, kind }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }
}

/// Download location plus expected SHA-256
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub url: String,
    pub sha256: String,
}

/// A named build option
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// One version of a package as described by its formula
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Formula {
    pub name: String,
    pub version: Version,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    pub source: ArtifactRef,
    /// Prebuilt archives keyed by platform tag (`arm64_sonoma`, `x86_64_linux`, `all`)
    #[serde(default)]
    pub bottles: BTreeMap<String, ArtifactRef>,
    #[serde(default)]
    pub variants: Vec<VariantDef>,
    /// Packages that cannot be installed alongside this one
    #[serde(default)]
    pub conflicts: Vec<String>,
}

impl Formula {
    /// Pick the payload to install on `platform`: the platform bottle, then
    /// the universal `all` bottle, then the source archive.
    pub fn artifact_for(&self, platform: &str) -> &ArtifactRef {
        self.bottles
            .get(platform)
            .or_else(|| self.bottles.get("all"))
            .unwrap_or(&self.source)
    }

    /// Whether this version accepts the variant flag.
    ///
    /// Declared variants are accepted, as are `with-X` / `without-X` toggles
    /// for optional and recommended dependencies.
    pub fn supports_variant(&self, flag: &str) -> bool {
        if self.variants.iter().any(|v| v.name == flag) {
            return true;
        }
        let toggled = flag
            .strip_prefix("with-")
            .or_else(|| flag.strip_prefix("without-"));
        toggled.is_some_and(|dep| {
            self.dependencies
                .iter()
                .any(|d| d.kind.is_soft() && d.name() == dep)
        })
    }

    /// Whether a dependency edge is active for the given variant flags
    pub fn follows(&self, dep: &Dependency, variants: &BTreeSet<String>) -> bool {
        match dep.kind {
            DependencyKind::Build | DependencyKind::Runtime => true,
            DependencyKind::Optional => variants.contains(&format!("with-{}", dep.name())),
            DependencyKind::Recommended => !variants.contains(&format!("without-{}", dep.name())),
        }
    }

    /// Cache key for this formula's metadata: hash of name, version and
    /// source checksum
    pub fn metadata_fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update([0]);
        hasher.update(self.version.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(self.source.sha256.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Read-only access to formula records
pub trait FormulaStore: Send + Sync {
    /// All known versions of `name`, in any order. Empty when unknown.
    fn lookup_formula(&self, name: &str) -> Vec<Formula>;

    /// Every package name the store knows
    fn all_names(&self) -> Vec<String>;
}

impl<S: FormulaStore + ?Sized> FormulaStore for Arc<S> {
    fn lookup_formula(&self, name: &str) -> Vec<Formula> {
        (**self).lookup_formula(name)
    }

    fn all_names(&self) -> Vec<String> {
        (**self).all_names()
    }
}

/// In-memory formula store
#[derive(Debug, Default, Clone)]
pub struct MemoryFormulaStore {
    formulae: BTreeMap<String, Vec<Formula>>,
}

impl MemoryFormulaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a formula version. A later insert of the same name and version
    /// replaces the earlier one.
    pub fn insert(&mut self, formula: Formula) {
        let versions = self.formulae.entry(formula.name.clone()).or_default();
        versions.retain(|f| f.version != formula.version);
        versions.push(formula);
    }

    pub fn len(&self) -> usize {
        self.formulae.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.formulae.is_empty()
    }
}

impl FromIterator<Formula> for MemoryFormulaStore {
    fn from_iter<I: IntoIterator<Item = Formula>>(iter: I) -> Self {
        let mut store = Self::new();
        for formula in iter {
            store.insert(formula);
        }
        store
    }
}

impl FormulaStore for MemoryFormulaStore {
    fn lookup_formula(&self, name: &str) -> Vec<Formula> {
        self.formulae.get(name).cloned().unwrap_or_default()
    }

    fn all_names(&self) -> Vec<String> {
        self.formulae.keys().cloned().collect()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FormulaFile {
    Many(Vec<Formula>),
    One(Box<Formula>),
}

/// Formula store loaded from a directory of translator output
#[derive(Debug, Clone)]
pub struct JsonFormulaStore {
    inner: MemoryFormulaStore,
}

impl JsonFormulaStore {
    /// Load every `*.json` file in `dir`. A missing directory yields an empty store.
    pub fn load(dir: &Path) -> Result<Self, FormulaError> {
        let mut inner = MemoryFormulaStore::new();

        if !dir.exists() {
            return Ok(Self { inner });
        }

        let entries = fs::read_dir(dir).map_err(|source| FormulaError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut paths: Vec<_> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect();
        paths.sort();

        for path in paths {
            let contents = fs::read_to_string(&path).map_err(|source| FormulaError::Io {
                path: path.clone(),
                source,
            })?;
            let parsed: FormulaFile =
                serde_json::from_str(&contents).map_err(|source| FormulaError::Parse {
                    path: path.clone(),
                    source,
                })?;
            match parsed {
                FormulaFile::Many(list) => list.into_iter().for_each(|f| inner.insert(f)),
                FormulaFile::One(formula) => inner.insert(*formula),
            }
        }

        tracing::debug!("Loaded {} formulae from {}", inner.len(), dir.display());
        Ok(Self { inner })
    }
}

impl FormulaStore for JsonFormulaStore {
    fn lookup_formula(&self, name: &str) -> Vec<Formula> {
        self.inner.lookup_formula(name)
    }

    fn all_names(&self) -> Vec<String> {
        self.inner.all_names()
    }
}

/// Formula store wrapper with in-memory memoization and a durable metadata
/// fallback in the artifact cache
pub struct CachedFormulaStore<S> {
    inner: S,
    memo: moka::sync::Cache<String, Arc<Vec<Formula>>>,
    cache: Option<Arc<ArtifactCache>>,
}

impl<S: FormulaStore> CachedFormulaStore<S> {
    pub fn new(inner: S, cache: Option<Arc<ArtifactCache>>) -> Self {
        Self {
            inner,
            // Lasts for the process; formulae are immutable within a session
            memo: moka::sync::Cache::new(1000),
            cache,
        }
    }

    fn mirror(&self, cache: &ArtifactCache, formulae: &[Formula]) {
        for formula in formulae {
            let fingerprint = formula.metadata_fingerprint();
            if cache.lookup(&fingerprint).is_some() {
                continue;
            }
            let payload = match serde_json::to_vec(formula) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!("Failed to serialize formula {}: {}", formula.name, e);
                    continue;
                }
            };
            if let Err(e) = cache.store(&fingerprint, EntryKind::Metadata, Some(&formula.name), &payload) {
                // Metadata mirroring is an optimization; resolution does not depend on it
                tracing::warn!("Failed to cache metadata for {}: {}", formula.name, e);
            }
        }
    }

    fn from_cache(&self, cache: &ArtifactCache, name: &str) -> Vec<Formula> {
        cache
            .metadata_entries(name)
            .into_iter()
            .filter_map(|entry| cache.read(&entry).ok())
            .filter_map(|bytes| serde_json::from_slice::<Formula>(&bytes).ok())
            .filter(|formula| formula.name == name)
            .collect()
    }
}

impl<S: FormulaStore> FormulaStore for CachedFormulaStore<S> {
    fn lookup_formula(&self, name: &str) -> Vec<Formula> {
        if let Some(hit) = self.memo.get(name) {
            return hit.as_ref().clone();
        }

        let mut formulae = self.inner.lookup_formula(name);

        if let Some(cache) = &self.cache {
            if formulae.is_empty() {
                formulae = self.from_cache(cache, name);
                if !formulae.is_empty() {
                    tracing::debug!("Serving {} from cached metadata", name);
                }
            } else {
                self.mirror(cache, &formulae);
            }
        }

        self.memo.insert(name.to_string(), Arc::new(formulae.clone()));
        formulae
    }

    fn all_names(&self) -> Vec<String> {
        self.inner.all_names()
    }
}
