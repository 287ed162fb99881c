//! Agent, storage and network configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

use crate::{Result, SwCacheError};

/// Bucket name of the current deploy.
pub const DEFAULT_CACHE_NAME: &str = "money-app-v99";

/// Location the agent script is served from; relative assets resolve against it.
pub const DEFAULT_SCOPE: &str = "http://localhost:8501/";

/// Assets pre-cached on install.
pub const DEFAULT_ASSETS: &[&str] = &[
    "./",
    "./index.html",
    "./investimentos.html",
    "./logo.png",
    "./icon-512.png",
    "https://cdn.jsdelivr.net/npm/chart.js",
    "https://cdnjs.cloudflare.com/ajax/libs/font-awesome/6.0.0/css/all.min.css",
];

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Offline cache agent settings
    pub agent: AgentConfig,

    /// Cache storage settings
    pub storage: StorageConfig,

    /// Network settings
    pub network: NetworkConfig,
}

/// Offline cache agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Version identifier naming the current bucket. Bump on every deploy.
    pub cache_name: String,

    /// Scope URL of the agent
    pub scope: String,

    /// Asset list, relative to `scope` or absolute
    pub assets: Vec<String>,
}

/// Which cache backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local, lost on exit
    Memory,
    /// SQLite database on disk
    #[default]
    Sqlite,
}

/// Cache storage settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend kind
    pub backend: StorageBackend,

    /// Database path, defaults to the platform cache directory
    pub path: Option<PathBuf>,
}

/// Network settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// User agent string
    pub user_agent: String,

    /// Client timeout in seconds
    pub timeout_secs: u64,

    /// Maximum redirects followed per request
    pub max_redirects: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cache_name: DEFAULT_CACHE_NAME.to_string(),
            scope: DEFAULT_SCOPE.to_string(),
            assets: DEFAULT_ASSETS.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("swcache/{}", env!("CARGO_PKG_VERSION")),
            timeout_secs: 30,
            max_redirects: 10,
        }
    }
}

impl AgentConfig {
    /// Parse the scope URL.
    pub fn scope_url(&self) -> Result<Url> {
        Url::parse(&self.scope)
            .map_err(|e| SwCacheError::config_with_source(format!("invalid scope {:?}", self.scope), e))
    }

    /// Resolve a possibly relative URL against the scope.
    pub fn resolve(&self, url: &str) -> Result<Url> {
        Ok(self.scope_url()?.join(url)?)
    }

    /// Resolve every asset against the scope, keeping list order.
    pub fn asset_urls(&self) -> Result<Vec<Url>> {
        let scope = self.scope_url()?;
        self.assets
            .iter()
            .map(|asset| {
                scope.join(asset).map_err(|e| {
                    SwCacheError::config_with_source(format!("invalid asset {:?}", asset), e)
                })
            })
            .collect()
    }

    /// Check the agent settings are usable.
    pub fn validate(&self) -> Result<()> {
        if self.cache_name.trim().is_empty() {
            return Err(SwCacheError::config("cache_name must not be empty"));
        }
        self.asset_urls().map(|_| ())
    }
}

impl StorageConfig {
    /// Database path, falling back to `<cache dir>/swcache/caches.sqlite3`.
    pub fn database_path(&self) -> PathBuf {
        match &self.path {
            Some(path) => path.clone(),
            None => dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("swcache")
                .join("caches.sqlite3"),
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&raw).map_err(|e| {
            SwCacheError::config_with_source(format!("parsing {}", path.display()), e)
        })?;
        config.agent.validate()?;
        Ok(config)
    }

    /// Load from `path` when given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Serialize as pretty JSON.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SwCacheError::config_with_source("serializing config", e))
    }
}
