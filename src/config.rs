use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AppError, Result};

/// OPDS catalog bridge for Audiobookshelf.
#[derive(Parser, Debug, Clone)]
#[command(name = "abs-opds")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file.
    #[arg(short, long, env = "ABS_OPDS_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Settings overridden from the command line or environment.
    #[command(flatten)]
    pub overrides: Overrides,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Settings that can be overridden from the command line or environment.
#[derive(Args, Debug, Clone, Default)]
pub struct Overrides {
    /// Audiobookshelf base URL.
    #[arg(long = "upstream", env = "AUDIOBOOKSHELF_URL", global = true)]
    pub upstream_url: Option<String>,

    /// Default Audiobookshelf API key (used when auth is disabled).
    #[arg(long, env = "AUDIOBOOKSHELF_API_KEY", hide_env_values = true, global = true)]
    pub api_key: Option<String>,

    /// Require credentials on every request.
    #[arg(
        long,
        env = "AUTH_ENABLED",
        global = true,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub auth_enabled: Option<bool>,

    /// Session lifetime in seconds.
    #[arg(long, env = "AUTH_CACHE_EXPIRY", global = true)]
    pub session_ttl: Option<u64>,

    /// Static user map, `name:key,name:key`.
    #[arg(long, env = "USERS", hide_env_values = true, global = true)]
    pub users: Option<String>,

    /// Entries per feed page (0 = unbounded).
    #[arg(long, env = "ITEMS_PER_PAGE", global = true)]
    pub items_per_page: Option<usize>,
}

/// CLI subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the server (default if no command given).
    Serve {
        /// Address to bind the server to.
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },

    /// Cache maintenance commands.
    Cache {
        /// Cache subcommand action.
        #[command(subcommand)]
        action: CacheCommand,
    },

    /// Validate configuration and print the effective settings.
    Check,

    /// Create default config.
    Init {
        /// Force overwrite existing config.
        #[arg(short, long)]
        force: bool,
    },
}

/// Cache maintenance subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum CacheCommand {
    /// Delete all persisted cache snapshots.
    Clear,

    /// Show persisted entry counts per namespace.
    Stats,
}

/// Main configuration from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Audiobookshelf connection.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Authentication configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Feed configuration.
    #[serde(default)]
    pub opds: OpdsConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Catalog title, also used as the authentication realm.
    #[serde(default = "default_title")]
    pub title: String,

    /// Absolute URL prefix for generated links (empty = relative links).
    #[serde(default)]
    pub public_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            title: default_title(),
            public_url: String::new(),
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::new(
        std::net::IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0)),
        8000,
    )
}

fn default_title() -> String {
    "OPDS-ABS".to_string()
}

/// Audiobookshelf connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the Audiobookshelf server.
    #[serde(default = "default_upstream_url")]
    pub url: String,

    /// Default API key, used for requests when auth is disabled.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retries after a network failure or 5xx response.
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Base backoff between retries, doubled on each attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            api_key: None,
            timeout_secs: default_timeout_secs(),
            retries: default_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_upstream_url() -> String {
    "http://localhost:13378".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    200
}

impl UpstreamConfig {
    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }

    /// Request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Backoff before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(1u64 << attempt.min(10)))
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Require credentials on every request.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Treat Basic secrets as Audiobookshelf API keys.
    #[serde(default)]
    pub api_key_auth: bool,

    /// Cache verified sessions.
    #[serde(default = "default_true")]
    pub token_cache: bool,

    /// Session lifetime in seconds.
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,

    /// Mirror sessions to the disk snapshot as well.
    #[serde(default)]
    pub persist_sessions: bool,

    /// Static username to API key map, verified locally.
    #[serde(default)]
    pub users: BTreeMap<String, String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key_auth: false,
            token_cache: true,
            session_ttl_secs: default_session_ttl(),
            persist_sessions: false,
            users: BTreeMap::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_session_ttl() -> u64 {
    86400
}

impl AuthConfig {
    /// Session lifetime.
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache upstream catalog responses.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Mirror the catalog cache to disk.
    #[serde(default)]
    pub persist: bool,

    /// Directory holding the cache snapshots.
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,

    /// TTL for library listings (items, series, authors, collections).
    #[serde(default = "default_catalog_ttl")]
    pub catalog_ttl_secs: u64,

    /// TTL for search results.
    #[serde(default = "default_search_ttl")]
    pub search_ttl_secs: u64,

    /// TTL for item detail.
    #[serde(default = "default_item_ttl")]
    pub item_ttl_secs: u64,

    /// Interval of the background expiry sweep (0 to disable).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            persist: false,
            dir: default_cache_dir(),
            catalog_ttl_secs: default_catalog_ttl(),
            search_ttl_secs: default_search_ttl(),
            item_ttl_secs: default_item_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("data/cache")
}

fn default_catalog_ttl() -> u64 {
    1800
}

fn default_search_ttl() -> u64 {
    600
}

fn default_item_ttl() -> u64 {
    3600
}

fn default_sweep_interval() -> u64 {
    300
}

/// Feed configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpdsConfig {
    /// Entries per page (0 = everything on one page).
    #[serde(default = "default_items_per_page")]
    pub items_per_page: usize,

    /// Largest `per_page` a client may request.
    #[serde(default = "default_max_per_page")]
    pub max_per_page: usize,

    /// List audio-only items with a link to their first audio file.
    #[serde(default)]
    pub include_audio: bool,
}

impl Default for OpdsConfig {
    fn default() -> Self {
        Self {
            items_per_page: default_items_per_page(),
            max_per_page: default_max_per_page(),
            include_audio: false,
        }
    }
}

fn default_items_per_page() -> usize {
    25
}

fn default_max_per_page() -> usize {
    500
}

/// Parse a `name:key,name:key` user list.
pub fn parse_users(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut users = BTreeMap::new();

    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, key) = pair
            .split_once(':')
            .ok_or_else(|| AppError::Config(format!("Invalid user entry (expected name:key): {}", pair)))?;

        if name.is_empty() || key.is_empty() {
            return Err(AppError::Config(format!(
                "Invalid user entry (empty name or key): {}",
                pair
            )));
        }

        users.insert(name.to_string(), key.to_string());
    }

    Ok(users)
}

impl Config {
    /// Load configuration from file.
    pub fn load(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| AppError::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Find config file in default locations.
    pub fn find_config_file() -> Option<PathBuf> {
        let candidates = [
            PathBuf::from("config.toml"),
            PathBuf::from("abs-opds.toml"),
            dirs::config_dir()
                .map(|p| p.join("abs-opds").join("config.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/abs-opds/config.toml"),
        ];

        candidates.into_iter().find(|p| p.exists())
    }

    /// Apply command-line and environment overrides.
    pub fn apply_overrides(&mut self, overrides: &Overrides) -> Result<()> {
        if let Some(url) = &overrides.upstream_url {
            self.upstream.url = url.clone();
        }
        if let Some(key) = &overrides.api_key {
            self.upstream.api_key = Some(key.clone());
        }
        if let Some(enabled) = overrides.auth_enabled {
            self.auth.enabled = enabled;
        }
        if let Some(ttl) = overrides.session_ttl {
            self.auth.session_ttl_secs = ttl;
        }
        if let Some(users) = &overrides.users {
            self.auth.users = parse_users(users)?;
        }
        if let Some(per_page) = overrides.items_per_page {
            self.opds.items_per_page = per_page;
        }
        Ok(())
    }

    /// Check settings that cannot be expressed by the types alone.
    pub fn validate(&self) -> Result<()> {
        let url = self.upstream.url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(AppError::Config(format!(
                "upstream.url must be an http(s) URL, got '{}'",
                self.upstream.url
            )));
        }

        // A static user map and upstream-verified API keys would both claim
        // Basic secrets; a deployment picks one.
        if !self.auth.users.is_empty() && self.auth.api_key_auth {
            return Err(AppError::Config(
                "auth.users and auth.api_key_auth are mutually exclusive".to_string(),
            ));
        }

        if !self.auth.enabled && self.upstream.api_key.as_deref().unwrap_or_default().is_empty() {
            return Err(AppError::Config(
                "upstream.api_key is required when auth is disabled".to_string(),
            ));
        }

        if self.opds.max_per_page == 0 {
            return Err(AppError::Config(
                "opds.max_per_page must be greater than 0".to_string(),
            ));
        }

        if self.opds.items_per_page > self.opds.max_per_page {
            return Err(AppError::Config(format!(
                "opds.items_per_page ({}) exceeds opds.max_per_page ({})",
                self.opds.items_per_page, self.opds.max_per_page
            )));
        }

        Ok(())
    }

    /// Generate default config file content.
    pub fn generate_default() -> String {
        r#"# abs-opds configuration

[server]
bind = "0.0.0.0:8000"
title = "OPDS-ABS"
# Absolute prefix for links, e.g. "https://opds.example.com"
# public_url = ""

[upstream]
url = "http://localhost:13378"
# Used for every request when auth is disabled
# api_key = ""
timeout_secs = 10
retries = 2
retry_backoff_ms = 200

[auth]
enabled = true
# Treat the Basic password as an Audiobookshelf API key
api_key_auth = false
token_cache = true
session_ttl_secs = 86400
persist_sessions = false

# Static users verified locally (exclusive with api_key_auth)
# [auth.users]
# alice = "api-key-of-alice"

[cache]
enabled = true
persist = false
# dir = "/var/lib/abs-opds/cache"
catalog_ttl_secs = 1800
search_ttl_secs = 600
item_ttl_secs = 3600
sweep_interval_secs = 300

[opds]
# 0 puts everything on one page
items_per_page = 25
max_per_page = 500
include_audio = false
"#
        .to_string()
    }
}
