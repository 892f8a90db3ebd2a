//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Seed API keys come from the GEMINI_API_KEYS env var or `seed_keys_file`,
//! never from the TOML itself, so the config file can be committed safely.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use axum::http::HeaderName;
use classifier::Directive;
use common::Secret;
use key_pool::{PoolSettings, Rotation};
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub store: StoreConfig,
    /// Admin API listener; disabled when the section is absent.
    #[serde(default)]
    pub admin: Option<AdminConfig>,
}

/// Inbound listener and upstream forwarding settings
#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_credential_header")]
    pub credential_header: String,
    #[serde(default = "default_credential_query_param")]
    pub credential_query_param: String,
    /// Inbound headers added by edge infrastructure, never forwarded.
    #[serde(default = "default_strip_headers")]
    pub strip_headers: Vec<String>,
    #[serde(default)]
    pub overloaded_directive: OverloadedDirective,
}

/// How a 503 "model is overloaded" response is handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverloadedDirective {
    /// Same key again after `retry_backoff_ms`.
    #[default]
    Retry,
    /// Next key from the pool.
    Rotate,
}

impl OverloadedDirective {
    pub fn directive(self) -> Directive {
        match self {
            OverloadedDirective::Retry => Directive::Retry,
            OverloadedDirective::Rotate => Directive::RotateAndRetry,
        }
    }
}

/// Key rotation settings and seed keys
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub rotation: Rotation,
    #[serde(default = "default_conflict_backoff_ms")]
    pub conflict_backoff_ms: u64,
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,
    /// File with one API key per line (alternative to GEMINI_API_KEYS)
    #[serde(default)]
    pub seed_keys_file: Option<PathBuf>,
    #[serde(skip)]
    pub seed_keys: Vec<Secret<String>>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            rotation: Rotation::default(),
            conflict_backoff_ms: default_conflict_backoff_ms(),
            max_conflict_retries: default_max_conflict_retries(),
            seed_keys_file: None,
            seed_keys: Vec::new(),
        }
    }
}

impl PoolConfig {
    pub fn settings(&self) -> PoolSettings {
        PoolSettings {
            rotation: self.rotation,
            conflict_backoff: Duration::from_millis(self.conflict_backoff_ms),
            max_conflict_retries: self.max_conflict_retries,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    File,
}

/// Key store backend selection
#[derive(Debug, Default, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// JSON file for the `file` backend
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Admin API listener
#[derive(Debug, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_addr")]
    pub listen_addr: SocketAddr,
}

fn default_upstream_url() -> String {
    "https://generativelanguage.googleapis.com".into()
}

fn default_timeout() -> u64 {
    300
}

fn default_max_connections() -> usize {
    1000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_credential_header() -> String {
    "x-goog-api-key".into()
}

fn default_credential_query_param() -> String {
    "key".into()
}

fn default_strip_headers() -> Vec<String> {
    [
        "cf-connecting-ip",
        "cf-ipcountry",
        "cf-ray",
        "cf-visitor",
        "cdn-loop",
        "x-forwarded-for",
        "x-forwarded-proto",
        "x-real-ip",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_conflict_backoff_ms() -> u64 {
    100
}

fn default_max_conflict_retries() -> u32 {
    32
}

fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Seed key resolution order:
    /// 1. GEMINI_API_KEYS env var (comma-separated)
    /// 2. seed_keys_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if let Ok(keys) = std::env::var("GEMINI_API_KEYS") {
            config.pool.seed_keys = parse_keys(keys.split(','));
        } else if let Some(ref key_file) = config.pool.seed_keys_file {
            let contents = std::fs::read_to_string(key_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read seed_keys_file {}: {e}",
                    key_file.display()
                ))
            })?;
            config.pool.seed_keys = parse_keys(contents.lines());
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let gateway = &self.gateway;
        if !gateway.upstream_url.starts_with("http://")
            && !gateway.upstream_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "upstream_url must start with http:// or https://, got: {}",
                gateway.upstream_url
            )));
        }
        if gateway.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }
        if gateway.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if gateway.max_attempts == 0 {
            return Err(common::Error::Config(
                "max_attempts must be at least 1".into(),
            ));
        }
        if HeaderName::from_str(&gateway.credential_header).is_err() {
            return Err(common::Error::Config(format!(
                "credential_header is not a valid header name: {}",
                gateway.credential_header
            )));
        }
        if gateway.credential_query_param.is_empty() {
            return Err(common::Error::Config(
                "credential_query_param must not be empty".into(),
            ));
        }
        if self.pool.conflict_backoff_ms == 0 {
            return Err(common::Error::Config(
                "conflict_backoff_ms must be greater than 0".into(),
            ));
        }
        if self.pool.max_conflict_retries == 0 {
            return Err(common::Error::Config(
                "max_conflict_retries must be greater than 0".into(),
            ));
        }
        if self.store.backend == StoreBackend::File && self.store.path.is_none() {
            return Err(common::Error::Config(
                "store.path is required for the file backend".into(),
            ));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("gemini-gateway.toml")
    }
}

/// Trimmed, non-empty keys; `#` lines are comments.
fn parse_keys<'a>(lines: impl Iterator<Item = &'a str>) -> Vec<Secret<String>> {
    lines
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|key| Secret::new(key.to_owned()))
        .collect()
}
