//! Transparent field encryption on top of a plain `StoreClient`.
//!
//! Writes encrypt the fields named in the schema map, filters encrypt
//! deterministic fields so equality still matches, and every encrypted value
//! read back is decrypted before it reaches the caller.

use std::sync::Arc;

use fieldvault_core::{
    schema::{Determinism, RecordSchema, SchemaMap},
    store::{
        Collection, Document, FindOptions, InsertOneResult, Namespace, StoreClient, StoreError,
        UpdateResult,
    },
};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{instrument, trace};
use uuid::Uuid;

use crate::{
    data_key::CipherError,
    field_cipher::{FieldCipher, KeyRing, SealedValue},
    key_vault::KmsProviders,
};

#[derive(Debug, Error)]
pub enum AutoEncryptionError {
    /// Store errors pass through untouched.
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("field encryption: {0}")]
    Cipher(#[from] CipherError),
    #[error("field {field:?} uses randomized encryption and cannot be queried")]
    UnqueryableField { field: String },
    #[error("data key {id} is not available to this client")]
    UnknownDataKey { id: Uuid },
}

/// Auto-encryption parameters a client is constructed with.
#[derive(Debug, Clone)]
pub struct AutoEncryptionOptions {
    pub kms_providers: KmsProviders,
    pub key_vault_namespace: Namespace,
    pub schema_map: SchemaMap,
    /// Key used for every encrypted field written by this client.
    pub data_key_id: Uuid,
}

/// A store client bound to a fixed schema map and key configuration.
pub struct EncryptedClient {
    raw: Arc<dyn StoreClient>,
    options: AutoEncryptionOptions,
    keys: Arc<KeyRing>,
    writer: Arc<FieldCipher>,
}

impl EncryptedClient {
    pub fn new(
        raw: Arc<dyn StoreClient>,
        options: AutoEncryptionOptions,
        keys: Arc<KeyRing>,
    ) -> Result<Self, AutoEncryptionError> {
        let writer = keys
            .get(&options.data_key_id)
            .cloned()
            .ok_or(AutoEncryptionError::UnknownDataKey {
                id: options.data_key_id,
            })?;
        Ok(Self {
            raw,
            options,
            keys,
            writer,
        })
    }

    pub fn options(&self) -> &AutoEncryptionOptions {
        &self.options
    }

    /// Collection handle; fields are encrypted per the schema registered for
    /// `namespace`, or not at all when none is.
    pub fn collection(self: &Arc<Self>, namespace: &Namespace) -> EncryptedCollection {
        EncryptedCollection {
            inner: self.raw.collection(namespace),
            schema: self.options.schema_map.get(namespace).cloned(),
            client: self.clone(),
        }
    }

    pub async fn run_command(
        &self,
        database: &str,
        command: Document,
    ) -> Result<Document, AutoEncryptionError> {
        Ok(self.raw.run_command(database, command).await?)
    }

    pub async fn close(&self) {
        self.raw.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.raw.is_closed()
    }

    fn seal(&self, value: &Value, determinism: Determinism) -> Result<Value, AutoEncryptionError> {
        Ok(self.writer.encrypt(value, determinism)?)
    }

    /// Decrypt the envelopes in `document`. Fields `schema` declares must
    /// decrypt; an envelope anywhere else is opened when it can be and
    /// otherwise returned as stored.
    fn open_document(
        &self,
        mut document: Document,
        schema: Option<&RecordSchema>,
    ) -> Result<Document, AutoEncryptionError> {
        for (field, value) in document.iter_mut() {
            let declared = schema.is_some_and(|schema| schema.field(field).is_some());
            match self.open_value(value) {
                Ok(Some(plain)) => *value = plain,
                Ok(None) => {}
                Err(err) if declared => return Err(err),
                Err(err) => trace!(%field, error = %err, "left undecryptable value in plain field"),
            }
        }
        Ok(document)
    }

    fn open_value(&self, value: &Value) -> Result<Option<Value>, AutoEncryptionError> {
        let Some(parsed) = SealedValue::parse(value) else {
            return Ok(None);
        };
        let sealed = parsed?;
        let cipher = self
            .keys
            .get(&sealed.key_id)
            .ok_or(AutoEncryptionError::UnknownDataKey { id: sealed.key_id })?;
        Ok(Some(cipher.decrypt(&sealed)?))
    }
}

/// Scoped handle on an encrypted collection. Dropping it releases only the
/// handle; the underlying pooled client stays open.
pub struct EncryptedCollection {
    client: Arc<EncryptedClient>,
    inner: Arc<dyn Collection>,
    schema: Option<Arc<RecordSchema>>,
}

impl EncryptedCollection {
    pub fn namespace(&self) -> &Namespace {
        self.inner.namespace()
    }

    pub fn schema(&self) -> Option<&RecordSchema> {
        self.schema.as_deref()
    }

    /// The pooled client behind this handle.
    pub fn client(&self) -> &Arc<EncryptedClient> {
        &self.client
    }

    #[instrument(skip_all, fields(namespace = %self.namespace()))]
    pub async fn insert_one(&self, document: Document) -> Result<InsertOneResult, AutoEncryptionError> {
        let sealed = self.seal_fields(document)?;
        Ok(self.inner.insert_one(sealed).await?)
    }

    #[instrument(skip_all, fields(namespace = %self.namespace()))]
    pub async fn find_one(&self, filter: Document) -> Result<Option<Document>, AutoEncryptionError> {
        let filter = self.seal_filter(filter)?;
        self.inner
            .find_one(filter)
            .await?
            .map(|doc| self.client.open_document(doc, self.schema()))
            .transpose()
    }

    #[instrument(skip_all, fields(namespace = %self.namespace()))]
    pub async fn find(
        &self,
        filter: Document,
        options: FindOptions,
    ) -> Result<Vec<Document>, AutoEncryptionError> {
        let filter = self.seal_filter(filter)?;
        self.inner
            .find(filter, options)
            .await?
            .into_iter()
            .map(|doc| self.client.open_document(doc, self.schema()))
            .collect()
    }

    /// `update` must be `{"$set": {...}}`; set values are encrypted like inserts.
    #[instrument(skip_all, fields(namespace = %self.namespace()))]
    pub async fn update_one(
        &self,
        filter: Document,
        mut update: Document,
    ) -> Result<UpdateResult, AutoEncryptionError> {
        let filter = self.seal_filter(filter)?;
        if let Some(Value::Object(fields)) = update.remove("$set") {
            update.insert("$set".into(), Value::Object(self.seal_fields(fields)?));
        }
        Ok(self.inner.update_one(filter, update).await?)
    }

    pub async fn count_documents(&self, filter: Document) -> Result<u64, AutoEncryptionError> {
        let filter = self.seal_filter(filter)?;
        Ok(self.inner.count_documents(filter).await?)
    }

    /// Run a command against this collection's database.
    pub async fn run_command(&self, command: Document) -> Result<Document, AutoEncryptionError> {
        let database = self.namespace().database.clone();
        self.client.run_command(&database, command).await
    }

    pub async fn ping(&self) -> Result<(), AutoEncryptionError> {
        let mut command = Document::new();
        command.insert("ping".into(), json!(1));
        self.run_command(command).await.map(|_| ())
    }

    fn seal_fields(&self, mut document: Document) -> Result<Document, AutoEncryptionError> {
        let Some(schema) = &self.schema else {
            return Ok(document);
        };
        for (field, spec) in &schema.fields {
            if let Some(value) = document.get_mut(field) {
                // Nulls have nothing to protect and stay queryable as null.
                if !value.is_null() {
                    *value = self.client.seal(value, spec.determinism)?;
                }
            }
        }
        Ok(document)
    }

    fn seal_filter(&self, mut filter: Document) -> Result<Document, AutoEncryptionError> {
        let Some(schema) = &self.schema else {
            return Ok(filter);
        };
        for (field, value) in filter.iter_mut() {
            let Some(spec) = schema.field(field) else {
                continue;
            };
            match spec.determinism {
                Determinism::Deterministic if !value.is_null() => {
                    *value = self.client.seal(value, Determinism::Deterministic)?;
                }
                Determinism::Deterministic => {}
                Determinism::Random => {
                    return Err(AutoEncryptionError::UnqueryableField {
                        field: field.clone(),
                    })
                }
            }
        }
        Ok(filter)
    }
}

impl Drop for EncryptedCollection {
    fn drop(&mut self) {
        trace!(namespace = %self.inner.namespace(), "released encrypted collection handle");
    }
}

#[cfg(test)]
mod tests {
    use fieldvault_core::{
        schema::{EncryptedModel, FieldAnnotation, RecordType, SchemaMapBuilder},
        store::{memory::InMemoryStore, ClientOptions, StoreConnector},
    };

    use super::*;
    use crate::{data_key::DataKey, master_key::MasterKey};

    struct Patient;

    impl EncryptedModel for Patient {
        const NAME: &'static str = "Patient";

        fn fields() -> Vec<FieldAnnotation> {
            vec![
                FieldAnnotation::plain("ward"),
                FieldAnnotation::queryable("ssn"),
                FieldAnnotation::standard("diagnosis"),
            ]
        }
    }

    fn ns() -> Namespace {
        Namespace::new("clinic", "patients")
    }

    fn doc(value: Value) -> Document {
        value.as_object().cloned().expect("object")
    }

    fn client(store: &InMemoryStore) -> Arc<EncryptedClient> {
        let schema = SchemaMapBuilder
            .build(&RecordType::of::<Patient>())
            .expect("schema");
        let key_id = Uuid::new_v4();
        let cipher = FieldCipher::new(key_id, &DataKey::generate()).expect("cipher");
        let options = AutoEncryptionOptions {
            kms_providers: KmsProviders::local(MasterKey::generate()),
            key_vault_namespace: Namespace::new("encryption", "__keyVault"),
            schema_map: SchemaMap::scoped(&ns(), Arc::new(schema)),
            data_key_id: key_id,
        };
        let raw = store
            .connect(&ClientOptions::new("memory://clinic"))
            .expect("connect");
        Arc::new(EncryptedClient::new(raw, options, Arc::new(KeyRing::new(cipher))).expect("client"))
    }

    #[tokio::test]
    async fn fields_are_encrypted_at_rest_and_decrypted_on_read() {
        let store = InMemoryStore::new();
        let collection = client(&store).collection(&ns());

        let patient = doc(json!({
            "_id": "p1",
            "ward": "B",
            "ssn": "123-45-6789",
            "diagnosis": "flu"
        }));
        collection.insert_one(patient.clone()).await.expect("insert");

        let raw = store.documents(&ns());
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0]["ward"], "B");
        assert!(SealedValue::parse(&raw[0]["ssn"]).is_some());
        assert!(SealedValue::parse(&raw[0]["diagnosis"]).is_some());
        assert!(!Value::Object(raw[0].clone()).to_string().contains("flu"));

        let found = collection
            .find_one(doc(json!({"ssn": "123-45-6789"})))
            .await
            .expect("find")
            .expect("present");
        assert_eq!(found, patient);
    }

    #[tokio::test]
    async fn randomized_fields_cannot_be_queried() {
        let store = InMemoryStore::new();
        let collection = client(&store).collection(&ns());

        let err = collection
            .find_one(doc(json!({"diagnosis": "flu"})))
            .await
            .expect_err("randomized field");
        assert!(matches!(err, AutoEncryptionError::UnqueryableField { field } if field == "diagnosis"));
    }

    #[tokio::test]
    async fn updates_encrypt_set_values() {
        let store = InMemoryStore::new();
        let collection = client(&store).collection(&ns());
        collection
            .insert_one(doc(json!({"_id": "p1", "ssn": "1", "diagnosis": "flu"})))
            .await
            .expect("insert");

        let result = collection
            .update_one(
                doc(json!({"ssn": "1"})),
                doc(json!({"$set": {"diagnosis": "cold", "ward": "C"}})),
            )
            .await
            .expect("update");
        assert_eq!(result.modified_count, 1);

        let raw = store.documents(&ns());
        assert!(!Value::Object(raw[0].clone()).to_string().contains("cold"));

        let found = collection
            .find(doc(json!({"ward": "C"})), FindOptions::default())
            .await
            .expect("find");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["diagnosis"], "cold");
    }

    #[tokio::test]
    async fn unregistered_namespaces_pass_through_and_ping_works() {
        let store = InMemoryStore::new();
        let plain = client(&store).collection(&Namespace::new("clinic", "audit"));
        plain
            .insert_one(doc(json!({"ssn": "visible"})))
            .await
            .expect("insert");
        assert_eq!(
            store.documents(&Namespace::new("clinic", "audit"))[0]["ssn"],
            "visible"
        );
        plain.ping().await.expect("ping");
    }

    #[tokio::test]
    async fn malformed_envelope_only_breaks_encrypted_fields() {
        let store = InMemoryStore::new();
        let collection = client(&store).collection(&ns());
        let raw = store
            .connect(&ClientOptions::new("memory://clinic"))
            .expect("connect")
            .collection(&ns());
        let bogus = json!({"$encrypted": "not-an-envelope"});

        raw.insert_one(doc(json!({"_id": "p1", "ward": bogus.clone()})))
            .await
            .expect("raw insert");
        let found = collection
            .find(Document::new(), FindOptions::default())
            .await
            .expect("plain field is returned as stored");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["ward"], bogus);

        raw.insert_one(doc(json!({"_id": "p2", "diagnosis": bogus})))
            .await
            .expect("raw insert");
        let err = collection
            .find_one(doc(json!({"_id": "p2"})))
            .await
            .expect_err("encrypted field must decrypt");
        assert!(matches!(err, AutoEncryptionError::Cipher(CipherError::Malformed { .. })));
    }

    #[tokio::test]
    async fn store_errors_propagate_unchanged() {
        let store = InMemoryStore::new();
        let collection = client(&store).collection(&ns());
        store.set_available(false);

        let err = collection
            .count_documents(Document::new())
            .await
            .expect_err("offline");
        assert!(matches!(err, AutoEncryptionError::Store(StoreError::Unavailable { .. })));
    }
}
