use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::models::Source;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub connectors: ConnectorsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Upper bound for any single connector call, retries included.
    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,
    /// Winner when neither side carries a timestamp.
    #[serde(default)]
    pub untimestamped_winner: Source,
    /// Actor recorded in audit entries.
    #[serde(default = "default_identity")]
    pub identity: String,
    /// Upsert records tagged with `entity_type` into the entity store.
    #[serde(default = "default_true")]
    pub index_entities: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            io_timeout_secs: default_io_timeout_secs(),
            untimestamped_winner: Source::Remote,
            identity: default_identity(),
            index_entities: true,
        }
    }
}

fn default_io_timeout_secs() -> u64 {
    300
}
fn default_identity() -> String {
    "system".to_string()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollerConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

fn default_interval_secs() -> u64 {
    crate::poller::DEFAULT_INTERVAL.as_secs()
}

#[derive(Debug, Deserialize, Clone)]
pub struct GraphConfig {
    /// Entity type that must be linked to at least one required target.
    #[serde(default = "default_linkable_type")]
    pub linkable_type: String,
    #[serde(default = "default_required_target_types")]
    pub required_target_types: Vec<String>,
    #[serde(default = "default_graph_depth")]
    pub default_depth: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            linkable_type: default_linkable_type(),
            required_target_types: default_required_target_types(),
            default_depth: default_graph_depth(),
        }
    }
}

fn default_linkable_type() -> String {
    "task".to_string()
}
fn default_required_target_types() -> Vec<String> {
    vec!["client".to_string(), "event".to_string()]
}
fn default_graph_depth() -> usize {
    2
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConnectorsConfig {
    pub remote: Option<RemoteConnectorConfig>,
    pub local: Option<LocalConnectorConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RemoteConnectorConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Name of the environment variable holding the API token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Table name → remote database id.
    #[serde(default)]
    pub tables: BTreeMap<String, String>,
}

fn default_base_url() -> String {
    "https://api.notion.com/v1".to_string()
}
fn default_api_version() -> String {
    "2022-06-28".to_string()
}
fn default_token_env() -> String {
    "NOTION_TOKEN".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    5
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_page_size() -> u32 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct LocalConnectorConfig {
    /// Directory holding one `<table>.json` file per table.
    pub state_dir: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_local_backoff_ms")]
    pub backoff_base_ms: u64,
}

impl LocalConnectorConfig {
    /// Defaults for everything but the state directory.
    pub fn at(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_local_backoff_ms(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["*.json".to_string()]
}
fn default_local_backoff_ms() -> u64 {
    100
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.sync.io_timeout_secs == 0 {
        anyhow::bail!("sync.io_timeout_secs must be > 0");
    }

    if config.poller.interval_secs == 0 {
        anyhow::bail!("poller.interval_secs must be > 0");
    }

    if config.graph.linkable_type.trim().is_empty() {
        anyhow::bail!("graph.linkable_type must not be empty");
    }

    if let Some(remote) = &config.connectors.remote {
        if remote.tables.is_empty() {
            anyhow::bail!("connectors.remote.tables must map at least one table");
        }
        if remote.timeout_secs == 0 {
            anyhow::bail!("connectors.remote.timeout_secs must be > 0");
        }
        if !(1..=100).contains(&remote.page_size) {
            anyhow::bail!("connectors.remote.page_size must be in [1, 100]");
        }
    }

    Ok(())
}
