use std::{
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use fieldvault_core::store::{
    builtin_command, ClientOptions, Collection, CollectionData, Document, FindOptions,
    InsertOneResult, Namespace, StoreClient, StoreConnector, StoreError, UpdateResult,
};
use tempfile::NamedTempFile;
use tokio::sync::{Mutex, Semaphore};
use tracing::instrument;

pub const FILE_SCHEME: &str = "file://";

/// Document store persisting each collection as a JSON file under `root`.
/// Clones share one write lock, so every client built from the same store
/// serializes its mutations.
#[derive(Debug, Clone)]
pub struct FileDocumentStore {
    root: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl FileDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Build from a `file://<dir>` uri.
    pub fn from_uri(uri: &str) -> Result<Self, StoreError> {
        match uri.strip_prefix(FILE_SCHEME) {
            Some(path) if !path.is_empty() => Ok(Self::new(path)),
            _ => Err(StoreError::InvalidUri {
                uri: uri.to_string(),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, namespace: &Namespace) -> PathBuf {
        self.root
            .join(sanitize(&namespace.database))
            .join(format!("{}.json", sanitize(&namespace.collection)))
    }
}

impl StoreConnector for FileDocumentStore {
    fn connect(&self, options: &ClientOptions) -> Result<Arc<dyn StoreClient>, StoreError> {
        Ok(Arc::new(self.open(options)?))
    }
}

impl FileDocumentStore {
    fn open(&self, options: &ClientOptions) -> Result<FileClient, StoreError> {
        if !options.uri.starts_with(FILE_SCHEME) {
            return Err(StoreError::InvalidUri {
                uri: options.uri.clone(),
            });
        }
        options.validate()?;

        Ok(FileClient {
            shared: Arc::new(Shared {
                store: self.clone(),
                permits: Semaphore::new(options.max_pool_size),
                closed: AtomicBool::new(false),
            }),
        })
    }
}

struct Shared {
    store: FileDocumentStore,
    permits: Semaphore,
    closed: AtomicBool,
}

impl Shared {
    /// Load, apply `op`, and persist when `op` reports a change.
    async fn with_data<R, F>(&self, namespace: &Namespace, op: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut CollectionData) -> Result<(R, bool), StoreError> + Send,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| StoreError::ClientClosed)?;
        let _guard = self.store.lock.lock().await;

        let path = self.store.path_for(namespace);
        let mut data = read_data(&path)?;
        let (result, changed) = op(&mut data)?;
        if changed {
            write_data(&path, &data)?;
        }
        Ok(result)
    }
}

struct FileClient {
    shared: Arc<Shared>,
}

#[async_trait]
impl StoreClient for FileClient {
    fn collection(&self, namespace: &Namespace) -> Arc<dyn Collection> {
        Arc::new(FileCollection {
            shared: self.shared.clone(),
            namespace: namespace.clone(),
        })
    }

    async fn run_command(&self, _database: &str, command: Document) -> Result<Document, StoreError> {
        let _permit = self
            .shared
            .permits
            .acquire()
            .await
            .map_err(|_| StoreError::ClientClosed)?;
        fs::create_dir_all(self.shared.store.root()).map_err(storage_err)?;
        builtin_command(&command)
    }

    async fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            self.shared.permits.close();
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

struct FileCollection {
    shared: Arc<Shared>,
    namespace: Namespace,
}

#[async_trait]
impl Collection for FileCollection {
    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    #[instrument(skip_all, fields(namespace = %self.namespace))]
    async fn insert_one(&self, document: Document) -> Result<InsertOneResult, StoreError> {
        let ns = self.namespace.clone();
        self.shared
            .with_data(&self.namespace, move |data| Ok((data.insert(&ns, document)?, true)))
            .await
    }

    async fn find_one(&self, filter: Document) -> Result<Option<Document>, StoreError> {
        self.shared
            .with_data(&self.namespace, move |data| Ok((data.find_one(&filter), false)))
            .await
    }

    async fn find(&self, filter: Document, options: FindOptions) -> Result<Vec<Document>, StoreError> {
        self.shared
            .with_data(&self.namespace, move |data| Ok((data.find(&filter, options), false)))
            .await
    }

    #[instrument(skip_all, fields(namespace = %self.namespace))]
    async fn update_one(&self, filter: Document, update: Document) -> Result<UpdateResult, StoreError> {
        let ns = self.namespace.clone();
        self.shared
            .with_data(&self.namespace, move |data| {
                let result = data.update_one(&ns, &filter, &update)?;
                Ok((result, result.modified_count > 0))
            })
            .await
    }

    async fn count_documents(&self, filter: Document) -> Result<u64, StoreError> {
        self.shared
            .with_data(&self.namespace, move |data| Ok((data.count(&filter), false)))
            .await
    }

    async fn create_unique_index(&self, field: &str) -> Result<(), StoreError> {
        let ns = self.namespace.clone();
        let field = field.to_string();
        self.shared
            .with_data(&self.namespace, move |data| {
                let existed = data.unique_fields.contains(&field);
                data.add_unique_index(&ns, &field)?;
                Ok(((), !existed))
            })
            .await
    }
}

fn read_data(path: &Path) -> Result<CollectionData, StoreError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(CollectionData::default())
        }
        Err(err) => return Err(storage_err(err)),
    };

    let mut buf = Vec::new();
    file.read_to_end(&mut buf).map_err(storage_err)?;
    serde_json::from_slice(&buf).map_err(storage_err)
}

fn write_data(path: &Path, data: &CollectionData) -> Result<(), StoreError> {
    let parent = path.parent().ok_or_else(|| StoreError::Storage {
        reason: "invalid storage path".to_string(),
    })?;
    fs::create_dir_all(parent).map_err(storage_err)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(storage_err)?;
    let json = serde_json::to_vec(data).map_err(storage_err)?;
    tmp.write_all(&json).map_err(storage_err)?;
    tmp.flush().map_err(storage_err)?;
    tmp.persist(path).map_err(|e| storage_err(e.error))?;
    Ok(())
}

fn sanitize(name: &str) -> String {
    URL_SAFE_NO_PAD.encode(name)
}

fn storage_err<E: ToString>(err: E) -> StoreError {
    StoreError::Storage {
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().expect("object")
    }

    fn connect(store: &FileDocumentStore) -> Arc<dyn StoreClient> {
        let uri = format!("{FILE_SCHEME}{}", store.root().display());
        store.connect(&ClientOptions::new(uri)).expect("connect")
    }

    #[tokio::test]
    async fn documents_survive_a_new_store_instance() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ns = Namespace::new("app", "users");

        let first = FileDocumentStore::new(dir.path());
        let collection = connect(&first).collection(&ns);
        collection.create_unique_index("email").await.expect("index");
        collection
            .insert_one(doc(json!({"_id": "u1", "email": "a@x"})))
            .await
            .expect("insert");

        let reopened = FileDocumentStore::new(dir.path());
        let collection = connect(&reopened).collection(&ns);
        let found = collection
            .find_one(doc(json!({"_id": "u1"})))
            .await
            .expect("find");
        assert_eq!(found, Some(doc(json!({"_id": "u1", "email": "a@x"}))));

        let err = collection
            .insert_one(doc(json!({"_id": "u2", "email": "a@x"})))
            .await
            .expect_err("unique index persisted");
        assert!(matches!(err, StoreError::DuplicateKey { .. }));
    }

    #[tokio::test]
    async fn update_persists_and_reads_do_not_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileDocumentStore::new(dir.path());
        let ns = Namespace::new("app", "items");
        let collection = connect(&store).collection(&ns);

        assert_eq!(collection.count_documents(Document::new()).await.unwrap(), 0);
        assert!(!store.path_for(&ns).exists(), "reads must not create files");

        collection
            .insert_one(doc(json!({"_id": "i", "n": 1})))
            .await
            .expect("insert");
        collection
            .update_one(doc(json!({"_id": "i"})), doc(json!({"$set": {"n": 2}})))
            .await
            .expect("update");

        let on_disk: CollectionData =
            serde_json::from_slice(&fs::read(store.path_for(&ns)).unwrap()).unwrap();
        assert_eq!(on_disk.documents[0]["n"], 2);
    }

    #[tokio::test]
    async fn closed_client_rejects_operations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let client = connect(&FileDocumentStore::new(dir.path()));
        client.close().await;
        let err = client
            .run_command("app", doc(json!({"ping": 1})))
            .await
            .expect_err("closed");
        assert_eq!(err, StoreError::ClientClosed);
    }

    fn on_disk(store: &FileDocumentStore) -> Vec<Document> {
        read_data(&store.path_for(&Namespace::new("app", "users")))
            .expect("read")
            .documents
    }

    #[tokio::test]
    async fn exhausted_pool_makes_writers_wait() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileDocumentStore::new(dir.path());
        let uri = format!("{FILE_SCHEME}{}", store.root().display());
        let client = store
            .open(&ClientOptions::new(uri).with_pool_bounds(1, 0))
            .expect("connect");
        let held = client.shared.permits.acquire().await.expect("permit");

        let collection = client.collection(&Namespace::new("app", "users"));
        let pending = tokio::spawn(async move {
            collection.insert_one(doc(json!({"_id": "u1"}))).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished(), "insert should wait for a free connection");
        assert!(on_disk(&store).is_empty());

        drop(held);
        tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .expect("completes once the connection is released")
            .expect("join")
            .expect("insert");
        assert_eq!(on_disk(&store).len(), 1);
    }

    #[test]
    fn from_uri_requires_file_scheme() {
        assert!(FileDocumentStore::from_uri("file:///var/lib/fv").is_ok());
        assert!(matches!(
            FileDocumentStore::from_uri("memory://x"),
            Err(StoreError::InvalidUri { .. })
        ));
    }
}
