use std::sync::Arc;

use fieldvault_core::{
    schema::SchemaMap,
    store::{Namespace, StoreClient, StoreConnector, StoreError},
};
use fieldvault_storage::{
    auto_encryption::AutoEncryptionOptions,
    field_cipher::KeyRing,
    key_vault::{KeyVault, KeyVaultError, KmsProviders},
    master_key::{KeyStorageError, MasterKeySource},
};
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::settings::ManagerSettings;

#[derive(Debug, Error)]
pub enum EncryptionSetupError {
    #[error("master key: {0}")]
    MasterKey(#[from] KeyStorageError),
    #[error("key vault: {0}")]
    KeyVault(#[from] KeyVaultError),
    #[error("key vault connection: {0}")]
    Connect(#[from] StoreError),
}

/// Provider configuration, key-vault handle and data key shared by every
/// pooled client. Read-only once built.
pub struct EncryptionContext {
    providers: KmsProviders,
    key_vault_namespace: Namespace,
    data_key_id: Uuid,
    keys: Arc<KeyRing>,
    key_vault_client: Arc<dyn StoreClient>,
}

impl EncryptionContext {
    /// Obtain the master key, then make sure the deployment's data key exists
    /// in the key vault and unwrap it.
    #[instrument(skip_all, fields(key_vault = %settings.key_vault_namespace()))]
    pub async fn initialize(
        settings: &ManagerSettings,
        master_keys: &dyn MasterKeySource,
        connector: &dyn StoreConnector,
    ) -> Result<Self, EncryptionSetupError> {
        let master = master_keys.obtain().await?;
        let providers = KmsProviders::local(master);
        let key_vault_namespace = settings.key_vault_namespace();

        let client = connector.connect(&settings.client_options())?;
        let vault = KeyVault::new(client.collection(&key_vault_namespace), providers.clone());

        let loaded = async {
            let id = vault.ensure_data_key(&settings.key_vault.key_alt_name).await?;
            let cipher = vault.load_cipher(id).await?;
            Ok::<_, KeyVaultError>((id, cipher))
        }
        .await;

        let (data_key_id, cipher) = match loaded {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!(error = %err, "key vault setup failed");
                client.close().await;
                return Err(err.into());
            }
        };

        info!(%data_key_id, "encryption context ready");
        Ok(Self {
            providers,
            key_vault_namespace,
            data_key_id,
            keys: Arc::new(KeyRing::new(cipher)),
            key_vault_client: client,
        })
    }

    pub fn provider_config(&self) -> &KmsProviders {
        &self.providers
    }

    pub fn key_vault_namespace(&self) -> &Namespace {
        &self.key_vault_namespace
    }

    pub fn data_key_id(&self) -> Uuid {
        self.data_key_id
    }

    pub fn keyring(&self) -> &Arc<KeyRing> {
        &self.keys
    }

    /// Auto-encryption parameters for a client bound to `schema_map`.
    pub fn auto_encryption_options(&self, schema_map: SchemaMap) -> AutoEncryptionOptions {
        AutoEncryptionOptions {
            kms_providers: self.providers.clone(),
            key_vault_namespace: self.key_vault_namespace.clone(),
            schema_map,
            data_key_id: self.data_key_id,
        }
    }

    /// Release the key-vault connection.
    pub async fn close(&self) {
        self.key_vault_client.close().await;
    }
}

#[cfg(test)]
mod tests {
    use fieldvault_core::store::memory::InMemoryStore;
    use fieldvault_storage::master_key::{InMemoryMasterKeySource, MasterKey};

    use super::*;

    #[tokio::test]
    async fn initialize_reuses_the_registered_data_key() {
        let store = InMemoryStore::new();
        let keys = InMemoryMasterKeySource::with_key(MasterKey::generate());
        let settings = ManagerSettings::default();

        let first = EncryptionContext::initialize(&settings, &keys, &store)
            .await
            .expect("first setup");
        let second = EncryptionContext::initialize(&settings, &keys, &store)
            .await
            .expect("second setup");

        assert_eq!(first.data_key_id(), second.data_key_id());
        assert_eq!(store.documents(first.key_vault_namespace()).len(), 1);
        assert_eq!(first.provider_config().names().collect::<Vec<_>>(), ["local"]);
        assert!(first.keyring().get(&first.data_key_id()).is_some());
    }

    #[tokio::test]
    async fn unreachable_key_vault_is_a_setup_error() {
        let store = InMemoryStore::new();
        store.set_available(false);
        let keys = InMemoryMasterKeySource::default();

        let err = EncryptionContext::initialize(&ManagerSettings::default(), &keys, &store)
            .await
            .err()
            .expect("offline store");
        assert!(matches!(
            err,
            EncryptionSetupError::KeyVault(KeyVaultError::Store(StoreError::Unavailable { .. }))
        ));
        assert_eq!(store.open_clients(), 0, "failed setup releases its connection");
    }

    #[tokio::test]
    async fn close_releases_the_key_vault_client() {
        let store = InMemoryStore::new();
        let keys = InMemoryMasterKeySource::default();
        let context = EncryptionContext::initialize(&ManagerSettings::default(), &keys, &store)
            .await
            .expect("setup");
        assert_eq!(store.open_clients(), 1);

        context.close().await;
        assert_eq!(store.open_clients(), 0);
    }
}
