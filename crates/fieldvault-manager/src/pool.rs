use std::{
    any::TypeId,
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use fieldvault_core::{
    schema::{RecordSchema, RecordType, SchemaMap, SchemaMapBuilder},
    store::{ClientOptions, StoreConnector},
};
use fieldvault_storage::auto_encryption::{EncryptedClient, EncryptedCollection};
use tracing::{debug, info, instrument};

use crate::{context::EncryptionContext, error::ManagerError, settings::ManagerSettings};

type PoolKey = (String, TypeId);

#[derive(Default)]
struct PoolState {
    closed: bool,
    clients: HashMap<PoolKey, Arc<EncryptedClient>>,
    schemas: HashMap<TypeId, Arc<RecordSchema>>,
}

/// Encrypted clients keyed by collection and record type, created on first
/// use. One mutex guards the whole cache; client construction does no I/O, so
/// holding it across creation never blocks on the network.
pub struct EncryptedClientPool {
    context: Arc<EncryptionContext>,
    connector: Arc<dyn StoreConnector>,
    settings: ManagerSettings,
    options: ClientOptions,
    builder: SchemaMapBuilder,
    state: Mutex<PoolState>,
    clients_created: AtomicUsize,
}

impl EncryptedClientPool {
    pub fn new(
        context: Arc<EncryptionContext>,
        connector: Arc<dyn StoreConnector>,
        settings: &ManagerSettings,
    ) -> Self {
        Self {
            context,
            connector,
            options: settings.client_options(),
            settings: settings.clone(),
            builder: SchemaMapBuilder,
            state: Mutex::new(PoolState::default()),
            clients_created: AtomicUsize::new(0),
        }
    }

    /// Handle on `collection` for records of type `record`, creating the
    /// pooled client on first request for this pair.
    #[instrument(skip(self, record), fields(record = record.name()))]
    pub fn acquire(
        &self,
        collection: &str,
        record: &RecordType,
    ) -> Result<EncryptedCollection, ManagerError> {
        let namespace = self.settings.namespace(collection);
        let mut state = self.state.lock().map_err(ManagerError::poisoned)?;
        if state.closed {
            return Err(ManagerError::ManagerClosed);
        }

        let key = (collection.to_string(), record.id());
        if let Some(client) = state.clients.get(&key) {
            debug!("reusing pooled client");
            return Ok(client.collection(&namespace));
        }

        let schema = match state.schemas.get(&record.id()) {
            Some(schema) => schema.clone(),
            None => {
                let schema = Arc::new(self.builder.build(record)?);
                state.schemas.insert(record.id(), schema.clone());
                schema
            }
        };
        debug!(schema = %schema.to_json_schema(), "creating pooled client");

        let options = self
            .context
            .auto_encryption_options(SchemaMap::scoped(&namespace, schema));
        let raw = self.connector.connect(&self.options)?;
        let client = EncryptedClient::new(raw, options, self.context.keyring().clone())
            .map_err(|err| ManagerError::Internal {
                reason: err.to_string(),
            })?;
        let client = Arc::new(client);

        state.clients.insert(key, client.clone());
        self.clients_created.fetch_add(1, Ordering::SeqCst);
        info!(%namespace, "pooled client created");
        Ok(client.collection(&namespace))
    }

    /// Clients constructed over the pool's lifetime.
    pub fn clients_created(&self) -> usize {
        self.clients_created.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.clients.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }

    /// Close every pooled client and refuse further acquires. Idempotent.
    pub async fn close(&self) {
        let clients: Vec<_> = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.closed = true;
            state.schemas.clear();
            state.clients.drain().map(|(_, client)| client).collect()
        };

        for client in &clients {
            client.close().await;
        }
        if !clients.is_empty() {
            info!(count = clients.len(), "pooled clients closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use fieldvault_core::{
        schema::{EncryptedModel, FieldAnnotation, SchemaBuildError},
        store::memory::InMemoryStore,
    };
    use fieldvault_storage::master_key::InMemoryMasterKeySource;

    use super::*;

    struct Account;

    impl EncryptedModel for Account {
        const NAME: &'static str = "Account";

        fn fields() -> Vec<FieldAnnotation> {
            vec![
                FieldAnnotation::queryable("iban"),
                FieldAnnotation::plain("currency"),
            ]
        }
    }

    struct Invoice;

    impl EncryptedModel for Invoice {
        const NAME: &'static str = "Invoice";

        fn fields() -> Vec<FieldAnnotation> {
            vec![FieldAnnotation::standard("amount")]
        }
    }

    struct Misdeclared;

    impl EncryptedModel for Misdeclared {
        const NAME: &'static str = "Misdeclared";

        fn fields() -> Vec<FieldAnnotation> {
            vec![FieldAnnotation::declared("iban", true, "paranoid")]
        }
    }

    async fn pool(store: &InMemoryStore) -> Arc<EncryptedClientPool> {
        let settings = ManagerSettings::default();
        let context = EncryptionContext::initialize(
            &settings,
            &InMemoryMasterKeySource::default(),
            store,
        )
        .await
        .expect("context");
        Arc::new(EncryptedClientPool::new(
            Arc::new(context),
            Arc::new(store.clone()),
            &settings,
        ))
    }

    #[tokio::test]
    async fn same_key_reuses_client_and_other_keys_do_not() {
        let store = InMemoryStore::new();
        let pool = pool(&store).await;
        let account = RecordType::of::<Account>();

        let a = pool.acquire("accounts", &account).expect("first");
        let b = pool.acquire("accounts", &account).expect("second");
        assert!(Arc::ptr_eq(a.client(), b.client()));

        let c = pool.acquire("archive", &account).expect("other collection");
        let d = pool
            .acquire("accounts", &RecordType::of::<Invoice>())
            .expect("other type");
        assert!(!Arc::ptr_eq(a.client(), c.client()));
        assert!(!Arc::ptr_eq(a.client(), d.client()));
        assert_eq!(pool.clients_created(), 3);
        assert_eq!(pool.len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquires_create_one_client() {
        let store = InMemoryStore::new();
        let pool = pool(&store).await;
        let created_before = store.clients_created();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                pool.acquire("accounts", &RecordType::of::<Account>())
                    .map(|handle| handle.client().clone())
            }));
        }

        let mut clients = Vec::new();
        for task in tasks {
            clients.push(task.await.expect("join").expect("acquire"));
        }
        assert!(clients.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
        assert_eq!(pool.clients_created(), 1);
        assert_eq!(store.clients_created() - created_before, 1);
    }

    #[tokio::test]
    async fn schema_errors_do_not_poison_the_pool() {
        let store = InMemoryStore::new();
        let pool = pool(&store).await;

        let err = pool
            .acquire("accounts", &RecordType::of::<Misdeclared>())
            .err()
            .expect("bad metadata");
        assert!(matches!(
            err,
            ManagerError::SchemaBuild(SchemaBuildError::UnknownLevel { .. })
        ));
        assert!(pool.is_empty());

        pool.acquire("accounts", &RecordType::of::<Account>())
            .expect("valid type still works");
    }

    #[tokio::test]
    async fn close_releases_clients_and_rejects_acquire() {
        let store = InMemoryStore::new();
        let pool = pool(&store).await;
        let handle = pool
            .acquire("accounts", &RecordType::of::<Account>())
            .expect("acquire");

        pool.close().await;
        pool.close().await;

        assert!(pool.is_closed());
        assert!(handle.client().is_closed());
        assert!(matches!(
            pool.acquire("accounts", &RecordType::of::<Account>()),
            Err(ManagerError::ManagerClosed)
        ));
    }

    #[tokio::test]
    async fn dropping_a_handle_keeps_the_client_open() {
        let store = InMemoryStore::new();
        let pool = pool(&store).await;
        let open_before = store.open_clients();

        {
            let handle = pool
                .acquire("accounts", &RecordType::of::<Account>())
                .expect("acquire");
            handle.ping().await.expect("ping");
        }

        assert_eq!(store.open_clients(), open_before + 1);
        let again = pool
            .acquire("accounts", &RecordType::of::<Account>())
            .expect("reacquire");
        again.ping().await.expect("ping after release");
        assert_eq!(pool.clients_created(), 1);
    }
}
