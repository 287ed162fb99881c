//! Command-line host for the swcache offline cache agent.
//!
//! Runs the agent against a persistent cache store and the real network.
//!
//! ## Usage
//!
//! ```bash
//! # Install and activate the agent, pre-caching the asset list
//! swcache register
//!
//! # Load a page the way a browser tab would
//! swcache fetch http://localhost:8501/index.html --navigate --output index.html
//!
//! # Inspect the store
//! swcache buckets --json
//! swcache entries money-app-v99
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use swcache_agent::{OfflineCacheAgent, RegistrationOptions, ServiceWorkerContainer};
use swcache_common::{init_logging, AppConfig, LogConfig, LogFormat, Result, StorageBackend, StorageConfig, SwCacheError};
use swcache_net::{LoaderConfig, Request, ResourceLoader};
use swcache_store::{CacheStorage, SqliteBackend};
use tracing::info;

/// Script URL the agent is registered under, relative to the scope.
const SCRIPT_PATH: &str = "sw.js";

#[derive(Parser)]
#[command(name = "swcache")]
#[command(about = "Offline cache agent host")]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install and activate the agent
    Register,

    /// Fetch a URL through the agent
    Fetch {
        /// URL to fetch
        url: String,
        /// Treat the request as a page navigation
        #[arg(long)]
        navigate: bool,
        /// Write the body here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List cache buckets
    Buckets {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the keys of one bucket
    Entries {
        /// Bucket name
        bucket: String,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Debug, Serialize)]
struct BucketSummary {
    name: String,
    entries: usize,
    current: bool,
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let log_config = LogConfig::from_verbosity(cli.verbose);
    let log_config = if cli.json_logs {
        log_config.with_format(LogFormat::Json)
    } else {
        log_config
    };
    init_logging(log_config)?;

    let config = AppConfig::load_or_default(cli.config.as_deref())?;
    run(cli.command, &config).await?;
    Ok(())
}

async fn run(command: Commands, config: &AppConfig) -> Result<()> {
    match command {
        Commands::Register => {
            let container = start(config).await?;
            let caches = container.caches();
            let bucket = caches
                .open(&config.agent.cache_name)
                .await
                .map_err(|e| SwCacheError::storage_with_source("opening current bucket", e))?;
            let entries = bucket
                .len()
                .await
                .map_err(|e| SwCacheError::storage_with_source("reading current bucket", e))?;
            println!("Activated {} ({} entries)", config.agent.cache_name, entries);
        }

        Commands::Fetch { url, navigate, output } => {
            let container = start(config).await?;
            let url = config.agent.resolve(&url)?;

            let response = if navigate {
                let (_client, response) = container
                    .navigate(url.as_str())
                    .await
                    .map_err(|e| SwCacheError::network_with_source(format!("loading {}", url), e))?;
                response
            } else {
                let client = container
                    .open_client(&config.agent.scope)
                    .await
                    .map_err(|e| SwCacheError::lifecycle_with_source("opening client", e))?;
                container
                    .dispatch_fetch(Some(&client), Request::get(url.clone()))
                    .await
                    .map_err(|e| SwCacheError::network_with_source(format!("fetching {}", url), e))?
            };

            eprintln!("{} {}", response.status, url);
            let body = response
                .bytes()
                .await
                .map_err(|e| SwCacheError::network_with_source("reading body", e))?;
            write_body(output.as_deref(), &body)?;
        }

        Commands::Buckets { json } => {
            let caches = open_storage(&config.storage)?;
            let names = caches
                .keys()
                .await
                .map_err(|e| SwCacheError::storage_with_source("listing buckets", e))?;

            let mut summaries = Vec::with_capacity(names.len());
            for name in names {
                let bucket = caches
                    .open(&name)
                    .await
                    .map_err(|e| SwCacheError::storage_with_source(format!("opening {}", name), e))?;
                let entries = bucket
                    .len()
                    .await
                    .map_err(|e| SwCacheError::storage_with_source(format!("reading {}", name), e))?;
                summaries.push(BucketSummary {
                    current: name == config.agent.cache_name,
                    name,
                    entries,
                });
            }

            if json {
                let json = serde_json::to_string_pretty(&summaries)
                    .map_err(|e| SwCacheError::internal(e.to_string()))?;
                println!("{}", json);
            } else {
                for summary in &summaries {
                    let marker = if summary.current { "*" } else { " " };
                    println!("{} {:<24} {:>6} entries", marker, summary.name, summary.entries);
                }
            }
        }

        Commands::Entries { bucket } => {
            let caches = open_storage(&config.storage)?;
            let exists = caches
                .has(&bucket)
                .await
                .map_err(|e| SwCacheError::storage_with_source("looking up bucket", e))?;
            if !exists {
                return Err(SwCacheError::NotFound(format!("bucket {}", bucket)));
            }
            let keys = caches
                .open(&bucket)
                .await
                .map_err(|e| SwCacheError::storage_with_source(format!("opening {}", bucket), e))?
                .keys()
                .await
                .map_err(|e| SwCacheError::storage_with_source(format!("reading {}", bucket), e))?;
            for key in keys {
                println!("{}", key);
            }
        }

        Commands::Config => {
            println!("{}", config.to_json_pretty()?);
        }
    }

    Ok(())
}

/// Build the host and run the agent's install and activate.
async fn start(config: &AppConfig) -> Result<ServiceWorkerContainer> {
    let caches = open_storage(&config.storage)?;
    let loader = ResourceLoader::new(loader_config(config))
        .map_err(|e| SwCacheError::network_with_source("creating resource loader", e))?;
    let agent = OfflineCacheAgent::new(&config.agent)
        .map_err(|e| SwCacheError::config_with_source("building agent", e))?;

    let (container, _events) = ServiceWorkerContainer::new(caches, Arc::new(loader));
    let script = config.agent.resolve(SCRIPT_PATH)?;
    let options = RegistrationOptions {
        scope: Some(config.agent.scope.clone()),
    };
    container
        .register(script.as_str(), Arc::new(agent), options)
        .await
        .map_err(|e| SwCacheError::lifecycle_with_source("registering agent", e))?;

    info!(scope = %config.agent.scope, cache = %config.agent.cache_name, "Agent ready");
    Ok(container)
}

fn open_storage(config: &StorageConfig) -> Result<CacheStorage> {
    match config.backend {
        StorageBackend::Memory => Ok(CacheStorage::in_memory()),
        StorageBackend::Sqlite => {
            let path = config.database_path();
            let backend = SqliteBackend::open(&path).map_err(|e| {
                SwCacheError::storage_with_source(format!("opening {}", path.display()), e)
            })?;
            Ok(CacheStorage::new(Arc::new(backend)))
        }
    }
}

fn loader_config(config: &AppConfig) -> LoaderConfig {
    LoaderConfig {
        user_agent: config.network.user_agent.clone(),
        default_timeout: Duration::from_secs(config.network.timeout_secs),
        max_redirects: config.network.max_redirects,
        ..LoaderConfig::default()
    }
}

fn write_body(output: Option<&Path>, body: &[u8]) -> Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, body)?;
            eprintln!("Wrote {} bytes to {}", body.len(), path.display());
        }
        None => std::io::stdout().write_all(body)?,
    }
    Ok(())
}
