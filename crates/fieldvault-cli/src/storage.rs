use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::config::Config;
use color_eyre::Result;
use dirs::data_dir;
use fieldvault_core::store::{
    memory::{InMemoryStore, MEMORY_SCHEME},
    StoreConnector,
};
use fieldvault_manager::{ConnectionManager, ManagerSettings};
use fieldvault_storage::{
    file_store::{FileDocumentStore, FILE_SCHEME},
    master_key::FileMasterKeySource,
};
use tracing::debug;

/// Resolve the default data directory for fieldvault.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = data_dir().ok_or_else(|| color_eyre::eyre::eyre!("no data dir available"))?;
    Ok(base.join("fieldvault"))
}

/// Effective manager settings: explicit config values win, the store and the
/// master key otherwise live under the data directory.
pub fn settings_from_config(config: &Config) -> Result<ManagerSettings> {
    let data_dir = match &config.data_dir {
        Some(dir) => dir.clone(),
        None => default_data_dir()?,
    };
    Ok(resolve_settings(config, &data_dir))
}

fn resolve_settings(config: &Config, data_dir: &Path) -> ManagerSettings {
    let defaults = ManagerSettings::default();
    ManagerSettings {
        store_uri: config
            .store_uri
            .clone()
            .unwrap_or_else(|| format!("{FILE_SCHEME}{}", data_dir.join("store").display())),
        database: config.database.clone().unwrap_or(defaults.database),
        master_key_path: config
            .master_key_path
            .clone()
            .unwrap_or_else(|| data_dir.join("master_key.bin")),
        key_vault: config.key_vault.clone().unwrap_or(defaults.key_vault),
        pool: config.pool.unwrap_or(defaults.pool),
    }
}

/// Pick the store backend named by the uri scheme.
pub fn connector_for(uri: &str) -> Result<Arc<dyn StoreConnector>> {
    if uri.starts_with(MEMORY_SCHEME) {
        return Ok(Arc::new(InMemoryStore::new()));
    }
    if uri.starts_with(FILE_SCHEME) {
        let store = FileDocumentStore::from_uri(uri)?;
        debug!(root = ?store.root(), "using file-backed store");
        return Ok(Arc::new(store));
    }
    color_eyre::eyre::bail!("unsupported store uri {uri:?} (expected memory:// or file://)")
}

/// Build the connection manager for this process. Nothing is opened until
/// its first use.
pub fn manager_from_config(config: &Config) -> Result<Arc<ConnectionManager>> {
    let settings = settings_from_config(config)?;
    debug!(store = %settings.store_uri, key = ?settings.master_key_path, "configuring connection manager");
    let connector = connector_for(&settings.store_uri)?;
    let master_keys = Arc::new(FileMasterKeySource::new(&settings.master_key_path));
    Ok(Arc::new(ConnectionManager::new(settings, master_keys, connector)?))
}

/// Manager over an in-memory store with its master key under `dir`.
#[cfg(test)]
pub fn test_manager(dir: &Path) -> Arc<ConnectionManager> {
    let config = Config {
        data_dir: Some(dir.to_path_buf()),
        store_uri: Some("memory://test".into()),
        ..Config::default()
    };
    manager_from_config(&config).expect("test manager")
}
