use std::{
    fs,
    path::{Path, PathBuf},
};

use color_eyre::{eyre::WrapErr, Result};
use dirs::config_dir;
use fieldvault_manager::{KeyVaultSettings, PoolSettings};
use serde::{Deserialize, Serialize};

/// User-level configuration loaded from `~/.config/fieldvault/config.toml` (platform-specific).
/// Unset values fall back to defaults rooted at the data directory.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct Config {
    /// Override for the data directory (store files and master key).
    pub data_dir: Option<PathBuf>,
    /// `memory://<name>` or `file://<dir>`.
    pub store_uri: Option<String>,
    pub database: Option<String>,
    pub master_key_path: Option<PathBuf>,
    pub key_vault: Option<KeyVaultSettings>,
    pub pool: Option<PoolSettings>,
}

impl Config {
    /// Apply `FIELDVAULT_*` overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(uri) = lookup("FIELDVAULT_STORE_URI") {
            self.store_uri = Some(uri);
        }
        if let Some(database) = lookup("FIELDVAULT_DATABASE") {
            self.database = Some(database);
        }
        if let Some(path) = lookup("FIELDVAULT_MASTER_KEY_PATH") {
            self.master_key_path = Some(PathBuf::from(path));
        }
        if let Some(max) = lookup("FIELDVAULT_POOL_MAX") {
            let max: usize = max.parse().wrap_err("FIELDVAULT_POOL_MAX must be a number")?;
            self.pool.get_or_insert_with(PoolSettings::default).max_size = max;
        }
        if let Some(min) = lookup("FIELDVAULT_POOL_MIN") {
            let min: usize = min.parse().wrap_err("FIELDVAULT_POOL_MIN must be a number")?;
            self.pool.get_or_insert_with(PoolSettings::default).min_size = min;
        }
        Ok(())
    }
}

/// Load config from the default path, then apply environment overrides.
pub fn load() -> Result<Config> {
    let mut config = load_from_path(default_path()?)?;
    config.apply_env(|key| std::env::var(key).ok())?;
    Ok(config)
}

/// Load config from a given path; if missing or empty, return defaults.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let cfg: Config = toml::from_str(&contents)
        .wrap_err_with(|| format!("invalid config at {}", path.display()))?;
    Ok(cfg)
}

/// Resolve the default config path (platform aware).
pub fn default_path() -> Result<PathBuf> {
    let base = config_dir().ok_or_else(|| color_eyre::eyre::eyre!("no config dir available"))?;
    Ok(base.join("fieldvault").join("config.toml"))
}

/// Write the given config to disk, creating parent directories as needed.
/// An existing file is left untouched.
pub fn write_default_if_missing(config: &Config) -> Result<PathBuf> {
    let path = default_path()?;
    write_if_missing(config, &path)?;
    Ok(path)
}

fn write_if_missing(config: &Config, path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(config)?;
    fs::write(path, body)?;
    Ok(())
}
