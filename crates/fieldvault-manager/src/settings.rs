use std::path::PathBuf;

use fieldvault_core::store::{ClientOptions, Namespace};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Everything the connection manager needs to reach the store and the key
/// material. Missing fields take their defaults when deserialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSettings {
    /// `memory://<name>` or `file://<dir>`.
    pub store_uri: String,
    /// Database holding the application collections.
    pub database: String,
    pub master_key_path: PathBuf,
    pub key_vault: KeyVaultSettings,
    pub pool: PoolSettings,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            store_uri: "memory://default".to_string(),
            database: "app".to_string(),
            master_key_path: PathBuf::from("config/master_key.bin"),
            key_vault: KeyVaultSettings::default(),
            pool: PoolSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyVaultSettings {
    pub database: String,
    pub collection: String,
    /// Alt-name the deployment's data key is registered under.
    pub key_alt_name: String,
}

impl Default for KeyVaultSettings {
    fn default() -> Self {
        Self {
            database: "encryption".to_string(),
            collection: "__keyVault".to_string(),
            key_alt_name: "app-data-key".to_string(),
        }
    }
}

/// Backing connections per pooled client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_size: usize,
    pub min_size: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 100,
            min_size: 10,
        }
    }
}

impl ManagerSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.store_uri.trim().is_empty() {
            return Err(invalid("store_uri", "must not be empty"));
        }
        check_name("database", &self.database)?;
        check_name("key_vault.database", &self.key_vault.database)?;
        check_name("key_vault.collection", &self.key_vault.collection)?;
        if self.key_vault.key_alt_name.is_empty() {
            return Err(invalid("key_vault.key_alt_name", "must not be empty"));
        }
        if self.master_key_path.as_os_str().is_empty() {
            return Err(invalid("master_key_path", "must not be empty"));
        }
        if self.pool.max_size == 0 {
            return Err(invalid("pool.max_size", "must be at least 1"));
        }
        if self.pool.min_size > self.pool.max_size {
            return Err(invalid(
                "pool.min_size",
                format!("{} exceeds pool.max_size {}", self.pool.min_size, self.pool.max_size),
            ));
        }
        Ok(())
    }

    pub fn key_vault_namespace(&self) -> Namespace {
        Namespace::new(&self.key_vault.database, &self.key_vault.collection)
    }

    pub fn namespace(&self, collection: &str) -> Namespace {
        Namespace::new(&self.database, collection)
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions::new(&self.store_uri).with_pool_bounds(self.pool.max_size, self.pool.min_size)
    }
}

fn check_name(field: &'static str, value: &str) -> Result<(), SettingsError> {
    if value.is_empty() {
        return Err(invalid(field, "must not be empty"));
    }
    if value.contains('.') {
        return Err(invalid(field, format!("{value:?} must not contain '.'")));
    }
    Ok(())
}

fn invalid(field: &'static str, reason: impl Into<String>) -> SettingsError {
    SettingsError::Invalid {
        field,
        reason: reason.into(),
    }
}
