use std::{marker::PhantomData, sync::Arc};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fieldvault_core::{
    schema::EncryptedModel,
    store::{Document, FindOptions},
};
use fieldvault_manager::ConnectionManager;
use fieldvault_storage::auto_encryption::EncryptedCollection;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, instrument};
use uuid::Uuid;

/// A record as persisted: bookkeeping fields plus the record's own fields,
/// flattened into one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stored<T> {
    #[serde(rename = "_id")]
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_active: bool,
    pub is_deleted: bool,
    #[serde(flatten)]
    pub record: T,
}

/// Soft-deleting repository over one encrypted collection. Deleted records
/// stay in the store but are invisible to every read.
pub struct Repository<T> {
    manager: Arc<ConnectionManager>,
    collection: String,
    _record: PhantomData<fn() -> T>,
}

impl<T> Repository<T>
where
    T: EncryptedModel + Serialize + DeserializeOwned,
{
    pub fn new(manager: Arc<ConnectionManager>, collection: impl Into<String>) -> Self {
        Self {
            manager,
            collection: collection.into(),
            _record: PhantomData,
        }
    }

    pub fn collection_name(&self) -> &str {
        &self.collection
    }

    async fn handle(&self) -> Result<EncryptedCollection> {
        Ok(self
            .manager
            .with_encrypted_collection::<T>(&self.collection)
            .await?)
    }

    #[instrument(skip_all, fields(collection = %self.collection))]
    pub async fn create(&self, record: T) -> Result<Stored<T>> {
        let now = Utc::now();
        let stored = Stored {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            is_active: true,
            is_deleted: false,
            record,
        };

        let handle = self.handle().await?;
        handle.insert_one(to_document(&stored)?).await?;
        debug!(id = %stored.id, "record created");

        let created = handle
            .find_one(document(json!({ "_id": stored.id })))
            .await?
            .context("created record not found")?;
        from_document(created)
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<Stored<T>>> {
        self.find_one(document(json!({ "_id": id }))).await
    }

    /// First live record matching `filter` (equality on top-level fields).
    pub async fn find_one(&self, mut filter: Document) -> Result<Option<Stored<T>>> {
        filter.insert("is_deleted".into(), Value::Bool(false));
        self.handle()
            .await?
            .find_one(filter)
            .await?
            .map(from_document)
            .transpose()
    }

    pub async fn get_all(&self, skip: usize, limit: usize) -> Result<Vec<Stored<T>>> {
        self.handle()
            .await?
            .find(
                document(json!({ "is_deleted": false })),
                FindOptions::page(skip, limit),
            )
            .await?
            .into_iter()
            .map(from_document)
            .collect()
    }

    /// Set `fields` on a live record. `None` when no live record changed.
    #[instrument(skip(self, fields), fields(collection = %self.collection))]
    pub async fn update(&self, id: &str, mut fields: Document) -> Result<Option<Stored<T>>> {
        fields.insert("updated_at".into(), serde_json::to_value(Utc::now())?);

        let handle = self.handle().await?;
        let result = handle
            .update_one(live(id), document(json!({ "$set": fields })))
            .await?;
        if result.modified_count == 0 {
            return Ok(None);
        }

        handle
            .find_one(document(json!({ "_id": id })))
            .await?
            .map(from_document)
            .transpose()
    }

    /// Soft delete. `false` when no live record has this id.
    #[instrument(skip(self), fields(collection = %self.collection))]
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let update = json!({
            "$set": { "is_deleted": true, "updated_at": Utc::now() }
        });
        let result = self
            .handle()
            .await?
            .update_one(live(id), document(update))
            .await?;
        Ok(result.modified_count > 0)
    }
}

fn live(id: &str) -> Document {
    document(json!({ "_id": id, "is_deleted": false }))
}

fn document(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

fn to_document<T: Serialize>(stored: &Stored<T>) -> Result<Document> {
    match serde_json::to_value(stored)? {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("record serialized to {other}, expected an object"),
    }
}

fn from_document<T: DeserializeOwned>(document: Document) -> Result<Stored<T>> {
    serde_json::from_value(Value::Object(document)).context("decoding stored record")
}
