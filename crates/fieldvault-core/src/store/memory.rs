use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::instrument;

use super::{
    builtin_command, ClientOptions, Collection, CollectionData, Document, FindOptions,
    InsertOneResult, Namespace, StoreClient, StoreConnector, StoreError, UpdateResult,
};

pub const MEMORY_SCHEME: &str = "memory://";

/// In-memory document server for tests and smoke runs. Every client connected
/// through the same `InMemoryStore` (or its clones) sees the same data.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    server: Arc<Server>,
}

#[derive(Debug)]
struct Server {
    collections: Mutex<HashMap<Namespace, CollectionData>>,
    available: AtomicBool,
    clients_created: AtomicUsize,
    open_clients: AtomicUsize,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            server: Arc::new(Server {
                collections: Mutex::new(HashMap::new()),
                available: AtomicBool::new(true),
                clients_created: AtomicUsize::new(0),
                open_clients: AtomicUsize::new(0),
            }),
        }
    }

    /// Simulate the server going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.server.available.store(available, Ordering::SeqCst);
    }

    /// Number of clients ever constructed through this store.
    pub fn clients_created(&self) -> usize {
        self.server.clients_created.load(Ordering::SeqCst)
    }

    /// Clients constructed and not yet closed.
    pub fn open_clients(&self) -> usize {
        self.server.open_clients.load(Ordering::SeqCst)
    }

    /// Raw view of a collection as stored, bypassing any client.
    pub fn documents(&self, namespace: &Namespace) -> Vec<Document> {
        self.server
            .collections
            .lock()
            .map(|map| {
                map.get(namespace)
                    .map(|data| data.documents.clone())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }
}

impl StoreConnector for InMemoryStore {
    fn connect(&self, options: &ClientOptions) -> Result<Arc<dyn StoreClient>, StoreError> {
        Ok(Arc::new(self.open(options)?))
    }
}

impl InMemoryStore {
    fn open(&self, options: &ClientOptions) -> Result<InMemoryClient, StoreError> {
        if !options.uri.starts_with(MEMORY_SCHEME) {
            return Err(StoreError::InvalidUri {
                uri: options.uri.clone(),
            });
        }
        options.validate()?;

        self.server.clients_created.fetch_add(1, Ordering::SeqCst);
        self.server.open_clients.fetch_add(1, Ordering::SeqCst);
        Ok(InMemoryClient {
            shared: Arc::new(ClientShared {
                server: self.server.clone(),
                permits: Semaphore::new(options.max_pool_size),
                closed: AtomicBool::new(false),
            }),
        })
    }
}

struct ClientShared {
    server: Arc<Server>,
    /// One permit per pooled connection.
    permits: Semaphore,
    closed: AtomicBool,
}

impl ClientShared {
    async fn with_data<R, F>(&self, namespace: &Namespace, op: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut CollectionData) -> Result<R, StoreError> + Send,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| StoreError::ClientClosed)?;
        self.check_available()?;

        let mut collections = self.server.collections.lock().map_err(|err| StoreError::Storage {
            reason: format!("lock poisoned: {err}"),
        })?;
        op(collections.entry(namespace.clone()).or_default())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.server.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable {
                reason: "in-memory server is offline".to_string(),
            })
        }
    }
}

pub struct InMemoryClient {
    shared: Arc<ClientShared>,
}

#[async_trait]
impl StoreClient for InMemoryClient {
    fn collection(&self, namespace: &Namespace) -> Arc<dyn Collection> {
        Arc::new(InMemoryCollection {
            shared: self.shared.clone(),
            namespace: namespace.clone(),
        })
    }

    #[instrument(skip_all, fields(database = %database))]
    async fn run_command(&self, database: &str, command: Document) -> Result<Document, StoreError> {
        let _permit = self
            .shared
            .permits
            .acquire()
            .await
            .map_err(|_| StoreError::ClientClosed)?;
        self.shared.check_available()?;
        builtin_command(&command)
    }

    async fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            self.shared.permits.close();
            self.shared.server.open_clients.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

struct InMemoryCollection {
    shared: Arc<ClientShared>,
    namespace: Namespace,
}

#[async_trait]
impl Collection for InMemoryCollection {
    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    async fn insert_one(&self, document: Document) -> Result<InsertOneResult, StoreError> {
        let ns = self.namespace.clone();
        self.shared
            .with_data(&self.namespace, move |data| data.insert(&ns, document))
            .await
    }

    async fn find_one(&self, filter: Document) -> Result<Option<Document>, StoreError> {
        self.shared
            .with_data(&self.namespace, move |data| Ok(data.find_one(&filter)))
            .await
    }

    async fn find(&self, filter: Document, options: FindOptions) -> Result<Vec<Document>, StoreError> {
        self.shared
            .with_data(&self.namespace, move |data| Ok(data.find(&filter, options)))
            .await
    }

    async fn update_one(&self, filter: Document, update: Document) -> Result<UpdateResult, StoreError> {
        let ns = self.namespace.clone();
        self.shared
            .with_data(&self.namespace, move |data| {
                data.update_one(&ns, &filter, &update)
            })
            .await
    }

    async fn count_documents(&self, filter: Document) -> Result<u64, StoreError> {
        self.shared
            .with_data(&self.namespace, move |data| Ok(data.count(&filter)))
            .await
    }

    async fn create_unique_index(&self, field: &str) -> Result<(), StoreError> {
        let ns = self.namespace.clone();
        let field = field.to_string();
        self.shared
            .with_data(&self.namespace, move |data| data.add_unique_index(&ns, &field))
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn options() -> ClientOptions {
        ClientOptions::new("memory://test")
    }

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().expect("object")
    }

    #[tokio::test]
    async fn clients_share_server_state() {
        let store = InMemoryStore::new();
        let ns = Namespace::new("app", "things");
        let writer = store.connect(&options()).expect("connect");
        let reader = store.connect(&options()).expect("connect");

        writer
            .collection(&ns)
            .insert_one(doc(json!({"_id": "a", "v": 1})))
            .await
            .expect("insert");

        let found = reader
            .collection(&ns)
            .find_one(doc(json!({"_id": "a"})))
            .await
            .expect("find");
        assert_eq!(found, Some(doc(json!({"_id": "a", "v": 1}))));
        assert_eq!(store.clients_created(), 2);
    }

    #[tokio::test]
    async fn closed_client_rejects_operations() {
        let store = InMemoryStore::new();
        let client = store.connect(&options()).expect("connect");
        assert_eq!(store.open_clients(), 1);

        client.close().await;
        client.close().await;
        assert!(client.is_closed());
        assert_eq!(store.open_clients(), 0);

        let err = client
            .collection(&Namespace::new("app", "x"))
            .count_documents(Document::new())
            .await
            .expect_err("closed");
        assert_eq!(err, StoreError::ClientClosed);
    }

    #[tokio::test]
    async fn unavailable_server_fails_operations() {
        let store = InMemoryStore::new();
        let client = store.connect(&options()).expect("connect");
        store.set_available(false);

        let err = client
            .run_command("admin", doc(json!({"ping": 1})))
            .await
            .expect_err("offline");
        assert!(matches!(err, StoreError::Unavailable { .. }));

        store.set_available(true);
        client
            .run_command("admin", doc(json!({"ping": 1})))
            .await
            .expect("back online");
    }

    #[tokio::test]
    async fn exhausted_pool_makes_callers_wait() {
        let store = InMemoryStore::new();
        let client = store
            .open(&options().with_pool_bounds(1, 0))
            .expect("connect");
        let held = client.shared.permits.acquire().await.expect("permit");

        let collection = client.collection(&Namespace::new("app", "things"));
        let pending = tokio::spawn(async move { collection.find_one(Document::new()).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished(), "operation should wait for a free connection");

        drop(held);
        let found = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .expect("completes once the connection is released")
            .expect("join")
            .expect("find");
        assert_eq!(found, None);
    }

    #[test]
    fn connect_validates_uri_and_pool_bounds() {
        let store = InMemoryStore::new();
        let err = store
            .connect(&ClientOptions::new("file:///tmp/x"))
            .err()
            .expect("wrong scheme");
        assert!(matches!(err, StoreError::InvalidUri { .. }));

        let err = store
            .connect(&options().with_pool_bounds(5, 10))
            .err()
            .expect("min above max");
        assert!(matches!(err, StoreError::InvalidOptions { .. }));
        assert_eq!(store.clients_created(), 0);
    }
}
