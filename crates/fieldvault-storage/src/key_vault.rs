use std::{collections::BTreeMap, fmt, sync::Arc};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use fieldvault_core::store::{Collection, Document, Namespace, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::{
    data_key::{self, CipherError, DataKey},
    field_cipher::FieldCipher,
    master_key::MasterKey,
};

/// Name of the provider backed by the local master key.
pub const LOCAL_PROVIDER: &str = "local";

const ALT_NAMES_FIELD: &str = "keyAltNames";

/// Named key-management providers and their key material.
#[derive(Clone, Default)]
pub struct KmsProviders {
    providers: BTreeMap<String, MasterKey>,
}

impl KmsProviders {
    pub fn local(key: MasterKey) -> Self {
        let mut providers = BTreeMap::new();
        providers.insert(LOCAL_PROVIDER.to_string(), key);
        Self { providers }
    }

    pub fn get(&self, provider: &str) -> Option<&MasterKey> {
        self.providers.get(provider)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }
}

impl fmt::Debug for KmsProviders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterKeyRef {
    pub provider: String,
}

/// Wrapped data key as stored in the key-vault collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyVaultRecord {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub key_alt_names: Vec<String>,
    /// Base64 of the data key wrapped under the provider's master key.
    pub key_material: String,
    pub master_key: MasterKeyRef,
    pub creation_date: DateTime<Utc>,
    #[serde(default)]
    pub status: i32,
}

#[derive(Debug, Error)]
pub enum KeyVaultError {
    #[error("key vault store: {0}")]
    Store(#[from] StoreError),
    #[error("key vault cipher: {0}")]
    Cipher(#[from] CipherError),
    #[error("no key-management provider named {provider:?}")]
    UnknownProvider { provider: String },
    #[error("data key {id} not found in key vault")]
    NotFound { id: Uuid },
    #[error("corrupt key vault record: {reason}")]
    Corrupt { reason: String },
}

/// Data-key records in a dedicated namespace, wrapped by the master key.
pub struct KeyVault {
    collection: Arc<dyn Collection>,
    providers: KmsProviders,
}

impl KeyVault {
    pub fn new(collection: Arc<dyn Collection>, providers: KmsProviders) -> Self {
        Self {
            collection,
            providers,
        }
    }

    pub fn namespace(&self) -> &Namespace {
        self.collection.namespace()
    }

    /// Return the id of the data key named `alt_name`, creating it when absent.
    /// A concurrent creator that loses the race adopts the winner's id.
    #[instrument(skip(self), fields(namespace = %self.namespace()))]
    pub async fn ensure_data_key(&self, alt_name: &str) -> Result<Uuid, KeyVaultError> {
        self.collection.create_unique_index(ALT_NAMES_FIELD).await?;

        if let Some(existing) = self.find_by_alt_name(alt_name).await? {
            debug!(key_id = %existing.id, "adopting existing data key");
            return Ok(existing.id);
        }

        let record = self.create_record(LOCAL_PROVIDER, alt_name)?;
        match self.collection.insert_one(to_document(&record)?).await {
            Ok(_) => {
                info!(key_id = %record.id, "created data key");
                Ok(record.id)
            }
            Err(StoreError::DuplicateKey { .. }) => {
                let winner = self.find_by_alt_name(alt_name).await?.ok_or_else(|| {
                    KeyVaultError::Corrupt {
                        reason: format!("duplicate key reported but {alt_name:?} not found"),
                    }
                })?;
                debug!(key_id = %winner.id, "data key created concurrently, adopting it");
                Ok(winner.id)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn find_by_alt_name(
        &self,
        alt_name: &str,
    ) -> Result<Option<KeyVaultRecord>, KeyVaultError> {
        let filter = filter(json!({ ALT_NAMES_FIELD: alt_name }));
        self.collection
            .find_one(filter)
            .await?
            .map(from_document)
            .transpose()
    }

    pub async fn count_by_alt_name(&self, alt_name: &str) -> Result<u64, KeyVaultError> {
        let filter = filter(json!({ ALT_NAMES_FIELD: alt_name }));
        Ok(self.collection.count_documents(filter).await?)
    }

    /// Fetch and unwrap a data key into a ready-to-use field cipher.
    #[instrument(skip(self))]
    pub async fn load_cipher(&self, id: Uuid) -> Result<FieldCipher, KeyVaultError> {
        let record = self
            .collection
            .find_one(filter(json!({ "_id": id.to_string() })))
            .await?
            .map(from_document)
            .transpose()?
            .ok_or(KeyVaultError::NotFound { id })?;

        let master = self.providers.get(&record.master_key.provider).ok_or_else(|| {
            KeyVaultError::UnknownProvider {
                provider: record.master_key.provider.clone(),
            }
        })?;
        let wrapped = STANDARD
            .decode(&record.key_material)
            .map_err(|e| KeyVaultError::Corrupt {
                reason: format!("key material: {e}"),
            })?;

        let key = data_key::unwrap(master, &wrapped)?;
        Ok(FieldCipher::new(record.id, &key)?)
    }

    fn create_record(&self, provider: &str, alt_name: &str) -> Result<KeyVaultRecord, KeyVaultError> {
        let master = self
            .providers
            .get(provider)
            .ok_or_else(|| KeyVaultError::UnknownProvider {
                provider: provider.to_string(),
            })?;
        let wrapped = data_key::wrap(master, &DataKey::generate())?;

        Ok(KeyVaultRecord {
            id: Uuid::new_v4(),
            key_alt_names: vec![alt_name.to_string()],
            key_material: STANDARD.encode(wrapped),
            master_key: MasterKeyRef {
                provider: provider.to_string(),
            },
            creation_date: Utc::now(),
            status: 0,
        })
    }
}

fn filter(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

fn to_document(record: &KeyVaultRecord) -> Result<Document, KeyVaultError> {
    match serde_json::to_value(record) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(KeyVaultError::Corrupt {
            reason: "record did not serialize to an object".to_string(),
        }),
        Err(e) => Err(KeyVaultError::Corrupt {
            reason: e.to_string(),
        }),
    }
}

fn from_document(document: Document) -> Result<KeyVaultRecord, KeyVaultError> {
    serde_json::from_value(Value::Object(document)).map_err(|e| KeyVaultError::Corrupt {
        reason: e.to_string(),
    })
}
