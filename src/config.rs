//! Configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` relative to the current working directory,
//! then applies `PTERM_WORK_DIR` and `PTERM_LOG_LEVEL` env overrides.

use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::error::AppError;

/// Key material handling.
#[derive(Debug, Clone)]
pub struct KeysConfig {
    /// Write the private key to disk under `work_dir/keys/`. When `false` the
    /// identity records the empty-path sentinel.
    pub persist_private_key: bool,
}

/// Relay queue scheduling and retention policy.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Background tick period. `None` disables the ticker; `tick` can still be
    /// run by hand from the shell.
    pub tick_interval: Option<Duration>,
    /// Maximum messages attempted per tick.
    pub batch_size: usize,
    /// Delivered messages are purged this long after delivery.
    pub delivered_retention: Duration,
    /// Undelivered messages are purged this long after enqueue.
    pub max_age: Duration,
    /// Spool file the default transport appends handed-off messages to.
    pub outbox_file: PathBuf,
}

/// Fully-resolved node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Working directory for all persistent data (already expanded, no `~`).
    pub work_dir: PathBuf,
    /// SQLite database path (absolute, or joined onto `work_dir`).
    pub db_path: PathBuf,
    /// Plain level name, validated at load. `RUST_LOG` directives override it.
    pub log_level: String,
    /// Enables `list_core` / `drop_core`.
    pub developer_mode: bool,
    pub keys: KeysConfig,
    pub relay: RelayConfig,
}

impl Config {
    /// Directory key material is persisted under.
    pub fn keys_dir(&self) -> PathBuf {
        self.work_dir.join("keys")
    }
}

/// Raw TOML shape, the `serde` target before resolution.
#[derive(Deserialize)]
struct RawConfig {
    node: RawNode,
    #[serde(default)]
    keys: RawKeys,
    #[serde(default)]
    relay: RawRelay,
}

#[derive(Deserialize)]
struct RawNode {
    work_dir: String,
    #[serde(default = "default_db_file")]
    db_file: String,
    log_level: String,
    #[serde(default)]
    developer_mode: bool,
}

#[derive(Deserialize)]
struct RawKeys {
    #[serde(default = "default_true")]
    persist_private_key: bool,
}

impl Default for RawKeys {
    fn default() -> Self {
        Self { persist_private_key: true }
    }
}

#[derive(Deserialize)]
struct RawRelay {
    #[serde(default = "default_tick_secs")]
    tick_secs: u64,
    #[serde(default = "default_batch_size")]
    batch_size: usize,
    #[serde(default = "default_delivered_retention_secs")]
    delivered_retention_secs: u64,
    #[serde(default = "default_max_age_secs")]
    max_age_secs: u64,
    #[serde(default = "default_outbox_file")]
    outbox_file: String,
}

impl Default for RawRelay {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            batch_size: default_batch_size(),
            delivered_retention_secs: default_delivered_retention_secs(),
            max_age_secs: default_max_age_secs(),
            outbox_file: default_outbox_file(),
        }
    }
}

fn default_db_file() -> String { "pterm.db".to_string() }
fn default_true() -> bool { true }
fn default_tick_secs() -> u64 { 30 }
fn default_batch_size() -> usize { 64 }
fn default_delivered_retention_secs() -> u64 { 24 * 60 * 60 }
fn default_max_age_secs() -> u64 { 7 * 24 * 60 * 60 }
fn default_outbox_file() -> String { "outbox.jsonl".to_string() }

/// Load config from `config/default.toml`, then apply env-var overrides.
pub fn load() -> Result<Config, AppError> {
    let work_dir_override = env::var("PTERM_WORK_DIR").ok();
    let log_level_override = env::var("PTERM_LOG_LEVEL").ok();
    load_from(
        Path::new("config/default.toml"),
        work_dir_override.as_deref(),
        log_level_override.as_deref(),
    )
}

/// Internal loader. Accepts an explicit path and optional overrides.
/// Tests pass overrides directly instead of mutating env vars.
pub fn load_from(
    path: &Path,
    work_dir_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<Config, AppError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;

    let parsed: RawConfig = toml::from_str(&raw)
        .map_err(|e| AppError::Config(format!("parse error in {}: {e}", path.display())))?;

    let n = parsed.node;

    let work_dir_str = work_dir_override.unwrap_or(&n.work_dir).to_string();
    let work_dir = expand_home(&work_dir_str);
    let log_level = log_level_override.unwrap_or(&n.log_level).to_string();
    crate::logger::parse_level(&log_level)
        .map_err(|e| AppError::Config(format!("node.log_level: {e}")))?;

    if parsed.relay.batch_size == 0 {
        return Err(AppError::Config("relay.batch_size must be at least 1".into()));
    }

    Ok(Config {
        db_path: under(&work_dir, &n.db_file),
        log_level,
        developer_mode: n.developer_mode,
        keys: KeysConfig {
            persist_private_key: parsed.keys.persist_private_key,
        },
        relay: RelayConfig {
            tick_interval: match parsed.relay.tick_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            batch_size: parsed.relay.batch_size,
            delivered_retention: Duration::from_secs(parsed.relay.delivered_retention_secs),
            max_age: Duration::from_secs(parsed.relay.max_age_secs),
            outbox_file: under(&work_dir, &parsed.relay.outbox_file),
        },
        work_dir,
    })
}

fn under(work_dir: &Path, file: &str) -> PathBuf {
    let path = PathBuf::from(file);
    if path.is_absolute() { path } else { work_dir.join(path) }
}

/// Expand a leading `~` to the user's home directory.
/// Absolute or relative paths without `~` are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

// ── test helpers ──────────────────────────────────────────────────────────────

impl Config {
    /// Config rooted at `work_dir` with developer commands on and the
    /// background ticker off. Used by unit and integration tests.
    pub fn test_default(work_dir: &Path) -> Self {
        Self {
            work_dir: work_dir.to_path_buf(),
            db_path: work_dir.join("pterm.db"),
            log_level: "info".into(),
            developer_mode: true,
            keys: KeysConfig { persist_private_key: true },
            relay: RelayConfig {
                tick_interval: None,
                batch_size: 16,
                delivered_retention: Duration::from_secs(60),
                max_age: Duration::from_secs(3600),
                outbox_file: work_dir.join("outbox.jsonl"),
            },
        }
    }
}
