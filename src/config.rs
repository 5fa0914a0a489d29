//! Engine configuration.
//!
//! Values are layered, later sources winning:
//!
//! 1. built-in defaults
//! 2. a JSON file: `$KEG_CONFIG`, else `<prefix>/etc/keg/config.json`
//! 3. environment: `KEG_PREFIX`, `KEG_CACHE`, `KEG_JOBS`, `KEG_FORMULA_DIR`,
//!    `KEG_SOFT_EDGES`
//! 4. command-line flags (applied by the `keg` binary)
//!
//! Every field is optional in the file:
//!
//! ```json
//! {
//!   "cache_budget_bytes": 1073741824,
//!   "soft_edge_policy": "strict",
//!   "jobs": 4
//! }
//! ```

use crate::cache;
use crate::cellar;
use crate::error::ConfigError;
use crate::platform;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_CACHE_BUDGET: u64 = 2 * 1024 * 1024 * 1024;
const DEFAULT_METADATA_TTL_SECS: u64 = 24 * 60 * 60;
const MAX_DEFAULT_JOBS: usize = 8;

/// What the resolver does with optional/recommended edges that make a
/// request unsatisfiable
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SoftEdgePolicy {
    /// Drop the edge silently
    Drop,
    /// Drop the edge, log a warning and record it in the plan
    #[default]
    Warn,
    /// Never drop; report a conflict
    Strict,
}

impl FromStr for SoftEdgePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drop" => Ok(SoftEdgePolicy::Drop),
            "warn" => Ok(SoftEdgePolicy::Warn),
            "strict" => Ok(SoftEdgePolicy::Strict),
            _ => Err(ConfigError::InvalidValue {
                key: "soft_edge_policy".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for SoftEdgePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SoftEdgePolicy::Drop => "drop",
            SoftEdgePolicy::Warn => "warn",
            SoftEdgePolicy::Strict => "strict",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub prefix: PathBuf,
    pub cache_dir: PathBuf,
    pub cache_budget_bytes: u64,
    pub metadata_ttl_secs: u64,
    /// Concurrent staging workers
    pub jobs: usize,
    pub download_retries: u32,
    pub soft_edge_policy: SoftEdgePolicy,
    pub max_backtracks: usize,
    /// Bottle tag used to pick artifacts
    pub platform: String,
    /// Directory of translated formula JSON files
    pub formula_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let jobs = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .min(MAX_DEFAULT_JOBS);

        Self {
            prefix: cellar::detect_prefix(),
            cache_dir: cache::cache_dir(),
            cache_budget_bytes: DEFAULT_CACHE_BUDGET,
            metadata_ttl_secs: DEFAULT_METADATA_TTL_SECS,
            jobs,
            download_retries: 3,
            soft_edge_policy: SoftEdgePolicy::default(),
            max_backtracks: 64,
            platform: platform::detect_bottle_tag(),
            formula_dir: None,
        }
    }
}

impl Config {
    /// Load from the process environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Load with an explicit environment lookup
    pub fn load_with(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let prefix = env("KEG_PREFIX")
            .map(PathBuf::from)
            .unwrap_or_else(|| defaults.prefix.clone());

        let file = env("KEG_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::default_path(&prefix));

        let mut config = if file.is_file() {
            tracing::debug!("Loading config from {}", file.display());
            Self::from_file(&file)?
        } else {
            defaults
        };
        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    /// `<prefix>/etc/keg/config.json`
    pub fn default_path(prefix: &Path) -> PathBuf {
        prefix.join("etc/keg/config.json")
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(prefix) = env("KEG_PREFIX") {
            self.prefix = PathBuf::from(prefix);
        }
        if let Some(cache) = env("KEG_CACHE") {
            self.cache_dir = PathBuf::from(cache);
        }
        if let Some(jobs) = env("KEG_JOBS") {
            self.jobs = jobs.parse().map_err(|_| ConfigError::InvalidValue {
                key: "KEG_JOBS".to_string(),
                value: jobs.clone(),
            })?;
        }
        if let Some(dir) = env("KEG_FORMULA_DIR") {
            self.formula_dir = Some(PathBuf::from(dir));
        }
        if let Some(policy) = env("KEG_SOFT_EDGES") {
            self.soft_edge_policy = policy.parse()?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.jobs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "jobs".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    pub fn metadata_ttl(&self) -> Duration {
        Duration::from_secs(self.metadata_ttl_secs)
    }

    /// Formula directory, defaulting to `<prefix>/share/keg/formula`
    pub fn formula_dir(&self) -> PathBuf {
        self.formula_dir
            .clone()
            .unwrap_or_else(|| self.prefix.join("share/keg/formula"))
    }
}
