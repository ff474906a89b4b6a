//! Document-store contracts consumed by the encryption layer.
//!
//! The shape mirrors a driver client: a lazily connecting `StoreClient` hands
//! out `Collection` handles addressed by `Namespace`. Implementations live in
//! this crate (in-memory double) and in `fieldvault-storage` (JSON files).

use std::{fmt, str::FromStr, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod data;
pub mod memory;

pub use data::{matches_filter, CollectionData};

/// A stored document: a JSON object keyed by field name.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Errors produced by document-store implementations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The client was closed; no further operations are accepted.
    #[error("client is closed")]
    ClientClosed,
    /// The backing server could not be reached.
    #[error("store unavailable: {reason}")]
    Unavailable { reason: String },
    /// A unique index (or `_id`) rejected the write.
    #[error("duplicate key on {namespace}: {field}")]
    DuplicateKey { namespace: String, field: String },
    /// The update document is not a supported `$set` update.
    #[error("invalid update: {reason}")]
    InvalidUpdate { reason: String },
    /// A database command failed or is not supported.
    #[error("command failed: {reason}")]
    CommandFailed { reason: String },
    /// The connection string could not be understood.
    #[error("invalid store uri: {uri}")]
    InvalidUri { uri: String },
    /// Client options are inconsistent (e.g. min pool size above max).
    #[error("invalid client options: {reason}")]
    InvalidOptions { reason: String },
    /// Underlying storage failure.
    #[error("storage failure: {reason}")]
    Storage { reason: String },
}

/// `<database>.<collection>` address of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid namespace {0:?}: expected <database>.<collection>")]
pub struct InvalidNamespace(pub String);

impl FromStr for Namespace {
    type Err = InvalidNamespace;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() && !coll.contains('.') => {
                Ok(Namespace::new(db, coll))
            }
            _ => Err(InvalidNamespace(s.to_string())),
        }
    }
}

/// Options used to construct a store client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    pub uri: String,
    /// Upper bound on concurrently checked-out connections.
    pub max_pool_size: usize,
    /// Connections a networked backend would keep warm. Validated against
    /// `max_pool_size`; the memory and file backends open nothing up front.
    pub min_pool_size: usize,
}

impl ClientOptions {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            max_pool_size: 100,
            min_pool_size: 10,
        }
    }

    pub fn with_pool_bounds(mut self, max: usize, min: usize) -> Self {
        self.max_pool_size = max;
        self.min_pool_size = min;
        self
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.max_pool_size == 0 {
            return Err(StoreError::InvalidOptions {
                reason: "max_pool_size must be at least 1".to_string(),
            });
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(StoreError::InvalidOptions {
                reason: format!(
                    "min_pool_size {} exceeds max_pool_size {}",
                    self.min_pool_size, self.max_pool_size
                ),
            });
        }
        Ok(())
    }
}

/// Pagination for `Collection::find`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FindOptions {
    pub skip: usize,
    pub limit: Option<usize>,
}

impl FindOptions {
    pub fn page(skip: usize, limit: usize) -> Self {
        Self {
            skip,
            limit: Some(limit),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertOneResult {
    pub inserted_id: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
}

/// Operations on a single collection.
#[async_trait]
pub trait Collection: Send + Sync {
    fn namespace(&self) -> &Namespace;

    /// Insert a document, generating `_id` when absent.
    async fn insert_one(&self, document: Document) -> Result<InsertOneResult, StoreError>;

    async fn find_one(&self, filter: Document) -> Result<Option<Document>, StoreError>;

    async fn find(&self, filter: Document, options: FindOptions)
        -> Result<Vec<Document>, StoreError>;

    /// Apply a `{"$set": {...}}` update to the first matching document.
    async fn update_one(&self, filter: Document, update: Document)
        -> Result<UpdateResult, StoreError>;

    async fn count_documents(&self, filter: Document) -> Result<u64, StoreError>;

    /// Enforce uniqueness of `field` for future writes (idempotent).
    async fn create_unique_index(&self, field: &str) -> Result<(), StoreError>;
}

/// A connected (possibly lazily) client with its own bounded connection pool.
#[async_trait]
pub trait StoreClient: Send + Sync {
    fn collection(&self, namespace: &Namespace) -> Arc<dyn Collection>;

    /// Run a database command such as `{"ping": 1}`.
    async fn run_command(&self, database: &str, command: Document)
        -> Result<Document, StoreError>;

    /// Release the client's connections (idempotent).
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Builds clients. Construction is lazy: no network I/O happens here.
pub trait StoreConnector: Send + Sync {
    fn connect(&self, options: &ClientOptions) -> Result<Arc<dyn StoreClient>, StoreError>;
}

/// Answers the commands every backend understands.
pub fn builtin_command(command: &Document) -> Result<Document, StoreError> {
    let name = command.keys().next().ok_or_else(|| StoreError::CommandFailed {
        reason: "empty command".to_string(),
    })?;

    match name.as_str() {
        "ping" => {
            let mut reply = Document::new();
            reply.insert("ok".into(), serde_json::json!(1));
            Ok(reply)
        }
        other => Err(StoreError::CommandFailed {
            reason: format!("no such command: {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_parses_and_displays() {
        let ns: Namespace = "encryption.__keyVault".parse().expect("parse");
        assert_eq!(ns, Namespace::new("encryption", "__keyVault"));
        assert_eq!(ns.to_string(), "encryption.__keyVault");
    }

    #[test]
    fn namespace_rejects_malformed_input() {
        for bad in ["nodot", ".coll", "db.", "a.b.c"] {
            assert!(bad.parse::<Namespace>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn ping_is_answered_and_unknown_commands_fail() {
        let mut ping = Document::new();
        ping.insert("ping".into(), serde_json::json!(1));
        let reply = builtin_command(&ping).expect("ping");
        assert_eq!(reply.get("ok"), Some(&serde_json::json!(1)));

        let mut other = Document::new();
        other.insert("dropDatabase".into(), serde_json::json!(1));
        assert!(matches!(
            builtin_command(&other),
            Err(StoreError::CommandFailed { .. })
        ));
    }
}
