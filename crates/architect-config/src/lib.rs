//! Layered configuration for the architect control plane.
//!
//! This crate loads configuration from a `.architect.toml` file with
//! environment-variable overrides (`ARCHITECT_<SECTION>_<FIELD>`), matching
//! the layering order documented in `SPEC_FULL.md` §4.9: file < env < CLI.
//! CLI flag overlay happens in `architect-cli`, which calls [`Config::merge`]
//! with a file-backed config built from flag values.
//!
//! # Example
//!
//! ```
//! use architect_config::{Config, load_config};
//! use std::path::Path;
//!
//! let config = load_config(Path::new(".")).expect("load config");
//! assert!(config.queue.max_retries >= 0);
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default configuration file name.
pub const CONFIG_FILE: &str = ".architect.toml";

/// Get the config file path for a directory.
pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE)
}

/// Complete architect configuration, aggregated from per-component sections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub responder: ResponderConfig,
    #[serde(default)]
    pub webhook: WebhookSectionConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge this config with another (`other` takes precedence field by
    /// field against this instance's defaults).
    pub fn merge(&self, other: &Config) -> Config {
        Config {
            storage: StorageConfig {
                db_path: other.storage.db_path.clone().or_else(|| self.storage.db_path.clone()),
                busy_timeout_ms: pick_non_default(
                    other.storage.busy_timeout_ms,
                    self.storage.busy_timeout_ms,
                    default_busy_timeout_ms(),
                ),
            },
            queue: QueueConfig {
                max_retries: pick_non_default(
                    other.queue.max_retries,
                    self.queue.max_retries,
                    default_max_retries(),
                ),
                default_timeout_seconds: pick_non_default(
                    other.queue.default_timeout_seconds,
                    self.queue.default_timeout_seconds,
                    default_timeout_seconds(),
                ),
                claim_batch_size: pick_non_default(
                    other.queue.claim_batch_size,
                    self.queue.claim_batch_size,
                    default_claim_batch_size(),
                ),
            },
            dispatcher: DispatcherConfig {
                poll_interval_ms: pick_non_default(
                    other.dispatcher.poll_interval_ms,
                    self.dispatcher.poll_interval_ms,
                    default_poll_interval_ms(),
                ),
                heartbeat_interval_secs: pick_non_default(
                    other.dispatcher.heartbeat_interval_secs,
                    self.dispatcher.heartbeat_interval_secs,
                    default_heartbeat_interval_secs(),
                ),
                drain_grace_seconds: pick_non_default(
                    other.dispatcher.drain_grace_seconds,
                    self.dispatcher.drain_grace_seconds,
                    default_drain_grace_seconds(),
                ),
            },
            responder: ResponderConfig {
                fallback_prompts: if other.responder.fallback_prompts.is_empty() {
                    self.responder.fallback_prompts.clone()
                } else {
                    other.responder.fallback_prompts.clone()
                },
                confidence_floor: pick_non_default_f64(
                    other.responder.confidence_floor,
                    self.responder.confidence_floor,
                    default_confidence_floor(),
                ),
            },
            webhook: WebhookSectionConfig {
                timeout_seconds: pick_non_default(
                    other.webhook.timeout_seconds,
                    self.webhook.timeout_seconds,
                    default_webhook_timeout(),
                ),
                default_retry_count: pick_non_default(
                    other.webhook.default_retry_count,
                    self.webhook.default_retry_count,
                    default_webhook_retries(),
                ),
            },
            http: HttpConfig {
                bind_addr: if other.http.bind_addr != default_bind_addr() {
                    other.http.bind_addr.clone()
                } else {
                    self.http.bind_addr.clone()
                },
                csrf_token_lifetime_secs: pick_non_default(
                    other.http.csrf_token_lifetime_secs,
                    self.http.csrf_token_lifetime_secs,
                    default_csrf_lifetime(),
                ),
            },
        }
    }

    /// Apply `ARCHITECT_*` environment overrides on top of a file-loaded
    /// config, per the file < env < CLI layering order.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("ARCHITECT_STORAGE_DB_PATH") {
            self.storage.db_path = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("ARCHITECT_QUEUE_MAX_RETRIES") {
            if let Ok(n) = v.parse() {
                self.queue.max_retries = n;
            }
        }
        if let Ok(v) = std::env::var("ARCHITECT_HTTP_BIND_ADDR") {
            self.http.bind_addr = v;
        }
        if let Ok(v) = std::env::var("ARCHITECT_DISPATCHER_POLL_INTERVAL_MS") {
            if let Ok(n) = v.parse() {
                self.dispatcher.poll_interval_ms = n;
            }
        }
        self
    }
}

fn pick_non_default<T: PartialEq + Copy>(candidate: T, fallback: T, default: T) -> T {
    if candidate != default { candidate } else { fallback }
}

fn pick_non_default_f64(candidate: f64, fallback: f64, default: f64) -> f64 {
    if (candidate - default).abs() > f64::EPSILON { candidate } else { fallback }
}

/// Relational storage engine settings. See `SPEC_FULL.md` §4.1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file. `None` uses the default data dir.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { db_path: None, busy_timeout_ms: default_busy_timeout_ms() }
    }
}

fn default_busy_timeout_ms() -> u32 {
    30_000
}

/// Task queue (C1) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_seconds")]
    pub default_timeout_seconds: i64,
    #[serde(default = "default_claim_batch_size")]
    pub claim_batch_size: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            default_timeout_seconds: default_timeout_seconds(),
            claim_batch_size: default_claim_batch_size(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_timeout_seconds() -> i64 {
    300
}
fn default_claim_batch_size() -> u32 {
    1
}

/// Session dispatcher (C2) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_drain_grace_seconds")]
    pub drain_grace_seconds: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            drain_grace_seconds: default_drain_grace_seconds(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    500
}
fn default_heartbeat_interval_secs() -> u64 {
    10
}
fn default_drain_grace_seconds() -> u64 {
    30
}

/// Prompt auto-responder (C3) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponderConfig {
    /// Pool of generic prompts used when no pattern matches, per the
    /// fallback-prompt Open Question resolution in `SPEC_FULL.md` §9.
    #[serde(default = "default_fallback_prompts")]
    pub fallback_prompts: Vec<String>,
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f64,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            fallback_prompts: default_fallback_prompts(),
            confidence_floor: default_confidence_floor(),
        }
    }
}

fn default_fallback_prompts() -> Vec<String> {
    vec![
        "Proceeding with the default option.".to_string(),
        "Continuing automatically; no operator input required.".to_string(),
    ]
}

fn default_confidence_floor() -> f64 {
    0.6
}

/// Webhook dispatcher settings (per-endpoint config lives in the
/// `webhooks` table; this section holds process-wide defaults).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSectionConfig {
    #[serde(default = "default_webhook_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_webhook_retries")]
    pub default_retry_count: u32,
}

impl Default for WebhookSectionConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_webhook_timeout(),
            default_retry_count: default_webhook_retries(),
        }
    }
}

fn default_webhook_timeout() -> u64 {
    10
}
fn default_webhook_retries() -> u32 {
    3
}

/// Operator HTTP/JSON surface settings, including CSRF token lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_csrf_lifetime")]
    pub csrf_token_lifetime_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            csrf_token_lifetime_secs: default_csrf_lifetime(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:8787".to_string()
}
fn default_csrf_lifetime() -> u64 {
    3600
}

/// Load configuration from a directory, applying environment overrides.
pub fn load_config(dir: &Path) -> Result<Config> {
    let path = config_path(dir);
    let config = if path.exists() {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?
    } else {
        Config::default()
    };
    Ok(config.apply_env_overrides())
}

/// Load configuration from a specific file path, applying environment
/// overrides.
pub fn load_config_from_file(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?
    } else {
        Config::default()
    };
    Ok(config.apply_env_overrides())
}

/// Save configuration to a file.
pub fn save_config(dir: &Path, config: &Config) -> Result<()> {
    let path = config_path(dir);
    let content = toml::to_string_pretty(config).context("failed to serialize config to TOML")?;
    std::fs::write(&path, content)
        .with_context(|| format!("failed to write config file: {}", path.display()))?;
    Ok(())
}

/// Find the configuration file by walking up the directory tree.
pub fn find_config(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir;
    loop {
        let config_file = current.join(CONFIG_FILE);
        if config_file.exists() {
            return Some(config_file);
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => return None,
        }
    }
}
