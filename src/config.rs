//! Configuration: defaults, environment variables, and the optional YAML
//! config file.
//!
//! Precedence for the store path is CLI flag, then `CACHEDASHH_DB`, then
//! the config file, then the built-in default. The stable-path list comes
//! from `CACHEDASHH_STABLEPATH`, then the config file, then the built-in
//! set.

use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Environment variable overriding the default store path.
pub const DB_PATH_ENV: &str = "CACHEDASHH_DB";

/// Colon-separated list of path prefixes assumed content-invariant.
pub const STABLE_PATH_ENV: &str = "CACHEDASHH_STABLEPATH";

const DEFAULT_DB_PATH: &str = "/tmp/cache-dash-h.db";

/// Prefixes whose contents are assumed invariant across runs; opens under
/// them are not recorded as dependencies.
const DEFAULT_STABLE_PATHS: &[&str] = &[
    "/usr/",
    "/etc/",
    "/lib/",
    "/lib64/",
    "/dev/",
    "/proc/",
    "/sys/",
    "/boot/",
    "/nix/store",
    "/gdn/",
    "/proj/",
];

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Replaces the built-in stable-path list when non-empty.
    #[serde(default)]
    pub stable_paths: Vec<String>,
}

/// Database configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub path: Option<String>,
}

impl Config {
    /// Load configuration from a YAML file.
    /// Searches in order:
    /// 1. ./helpcache.yaml (current directory)
    /// 2. ~/.config/helpcache/helpcache.yaml
    ///
    /// A missing or unparsable file falls back to defaults.
    pub fn load() -> Self {
        let search_paths = [
            "helpcache.yaml".to_string(),
            shellexpand::tilde("~/.config/helpcache/helpcache.yaml").to_string(),
        ];

        for search_path in &search_paths {
            if Path::new(search_path).exists() {
                if let Ok(content) = std::fs::read_to_string(search_path) {
                    if let Ok(config) = serde_yaml::from_str(&content) {
                        return config;
                    }
                }
            }
        }

        Config::default()
    }

    /// Resolve the store path against the CLI flag, the environment, the
    /// config file, and the default, expanding `~` and a leading
    /// `$ORIGIN0` / `$ORIGIN1` placeholder against the resolved command.
    pub fn resolve_db_path(&self, flag: Option<&str>, cmd: &[String]) -> String {
        let raw = flag
            .map(str::to_owned)
            .or_else(|| env::var(DB_PATH_ENV).ok())
            .or_else(|| self.database.path.clone())
            .unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        expand_origins(&shellexpand::tilde(&raw), cmd)
    }

    /// The effective stable-path prefix list.
    pub fn stable_paths(&self) -> Vec<String> {
        if let Ok(value) = env::var(STABLE_PATH_ENV) {
            return value.split(':').map(str::to_owned).collect();
        }
        if !self.stable_paths.is_empty() {
            return self.stable_paths.clone();
        }
        DEFAULT_STABLE_PATHS.iter().map(|s| s.to_string()).collect()
    }
}

/// Whether `path` falls under one of the stable prefixes.
pub fn is_stable(path: &Path, prefixes: &[String]) -> bool {
    let path = path.to_string_lossy();
    prefixes
        .iter()
        .any(|prefix| path.starts_with(prefix.as_str()))
}

/// Expand a leading `$ORIGIN0` (directory of the resolved executable) or
/// `$ORIGIN1` (directory of its first argument) in the store path.
fn expand_origins(db_path: &str, cmd: &[String]) -> String {
    if let Some(rest) = db_path.strip_prefix("$ORIGIN0") {
        if let Some(first) = cmd.first() {
            return format!("{}{}", parent_dir(first), rest);
        }
    } else if let Some(rest) = db_path.strip_prefix("$ORIGIN1") {
        if cmd.len() > 1 {
            return format!("{}{}", parent_dir(&cmd[1]), rest);
        }
    }
    db_path.to_string()
}

fn parent_dir(path: &str) -> String {
    match Path::new(path).parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_string_lossy().into_owned(),
        _ => ".".to_string(),
    }
}
