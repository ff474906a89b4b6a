use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fieldvault_core::{
    schema::{EncryptedModel, RecordType},
    store::StoreConnector,
};
use fieldvault_storage::{auto_encryption::EncryptedCollection, master_key::MasterKeySource};
use tracing::{debug, info, instrument, warn};

use crate::{
    context::EncryptionContext, error::ManagerError, pool::EncryptedClientPool,
    settings::ManagerSettings,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Uninitialized,
    Initializing,
    Ready,
    /// Terminal.
    Closed,
}

struct Ready {
    context: Arc<EncryptionContext>,
    pool: EncryptedClientPool,
}

enum Phase {
    Uninitialized,
    Initializing,
    Ready(Arc<Ready>),
    Closed,
}

impl Phase {
    fn state(&self) -> ManagerState {
        match self {
            Phase::Uninitialized => ManagerState::Uninitialized,
            Phase::Initializing => ManagerState::Initializing,
            Phase::Ready(_) => ManagerState::Ready,
            Phase::Closed => ManagerState::Closed,
        }
    }
}

struct Status {
    phase: Phase,
    /// Initialization attempts started so far.
    attempts: u64,
    /// Most recent failed attempt and its error message.
    failure: Option<(u64, String)>,
}

impl Status {
    fn current(&self) -> Result<Option<Arc<Ready>>, ManagerError> {
        match &self.phase {
            Phase::Ready(ready) => Ok(Some(ready.clone())),
            Phase::Closed => Err(ManagerError::ManagerClosed),
            Phase::Uninitialized | Phase::Initializing => Ok(None),
        }
    }

    /// The attempt a caller arriving now waits on: the one in flight, or the
    /// next one to start.
    fn joinable_attempt(&self) -> u64 {
        match self.phase {
            Phase::Initializing => self.attempts,
            _ => self.attempts + 1,
        }
    }
}

/// Process-wide owner of the encryption context and client pool. Construct
/// one at startup and share it (usually behind an `Arc`).
///
/// The first operation initializes it. Callers that arrive while an attempt
/// is pending wait for it and share its outcome. After a failure the manager
/// is Uninitialized again and the next new call starts a fresh attempt.
pub struct ConnectionManager {
    settings: ManagerSettings,
    master_keys: Arc<dyn MasterKeySource>,
    connector: Arc<dyn StoreConnector>,
    status: Mutex<Status>,
    /// Serializes initialization and shutdown. Never held by `status` holders.
    lifecycle: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    pub fn new(
        settings: ManagerSettings,
        master_keys: Arc<dyn MasterKeySource>,
        connector: Arc<dyn StoreConnector>,
    ) -> Result<Self, ManagerError> {
        settings.validate()?;
        Ok(Self {
            settings,
            master_keys,
            connector,
            status: Mutex::new(Status {
                phase: Phase::Uninitialized,
                attempts: 0,
                failure: None,
            }),
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn state(&self) -> ManagerState {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .phase
            .state()
    }

    /// The encryption context, once the manager is ready.
    pub fn context(&self) -> Option<Arc<EncryptionContext>> {
        match &self.status.lock().unwrap_or_else(PoisonError::into_inner).phase {
            Phase::Ready(ready) => Some(ready.context.clone()),
            _ => None,
        }
    }

    /// Bring the manager to `Ready` without acquiring anything.
    pub async fn initialize(&self) -> Result<(), ManagerError> {
        self.ready().await.map(|_| ())
    }

    /// Encrypted handle on `collection` for records of type `T`.
    pub async fn with_encrypted_collection<T: EncryptedModel>(
        &self,
        collection: &str,
    ) -> Result<EncryptedCollection, ManagerError> {
        self.acquire(collection, &RecordType::of::<T>()).await
    }

    pub async fn acquire(
        &self,
        collection: &str,
        record: &RecordType,
    ) -> Result<EncryptedCollection, ManagerError> {
        let ready = self.ready().await?;
        ready.pool.acquire(collection, record)
    }

    /// Release every pooled client and the key-vault connection. Idempotent.
    #[instrument(skip_all)]
    pub async fn close(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let previous = {
            let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut status.phase, Phase::Closed)
        };

        match previous {
            Phase::Ready(ready) => {
                ready.pool.close().await;
                ready.context.close().await;
                info!("connection manager closed");
            }
            Phase::Closed => debug!("connection manager already closed"),
            Phase::Uninitialized | Phase::Initializing => {
                info!("connection manager closed before initialization")
            }
        }
    }

    async fn ready(&self) -> Result<Arc<Ready>, ManagerError> {
        let joined = {
            let status = self.lock_status()?;
            if let Some(ready) = status.current()? {
                return Ok(ready);
            }
            status.joinable_attempt()
        };

        let _lifecycle = self.lifecycle.lock().await;
        let attempt = {
            let mut status = self.lock_status()?;
            if let Some(ready) = status.current()? {
                return Ok(ready);
            }
            // The attempt this caller waited on has already failed.
            if let Some((failed, reason)) = &status.failure {
                if *failed >= joined {
                    return Err(ManagerError::InitializationFailed {
                        reason: reason.clone(),
                    });
                }
            }
            status.attempts += 1;
            status.phase = Phase::Initializing;
            status.attempts
        };
        info!(store = %self.settings.store_uri, attempt, "initializing connection manager");

        match self.build().await {
            Ok(ready) => {
                let ready = Arc::new(ready);
                let mut status = self.lock_status()?;
                status.phase = Phase::Ready(ready.clone());
                status.failure = None;
                info!("connection manager ready");
                Ok(ready)
            }
            Err(err) => {
                let mut status = self.lock_status()?;
                status.phase = Phase::Uninitialized;
                status.failure = Some((attempt, err.to_string()));
                warn!(error = %err, attempt, "connection manager initialization failed");
                Err(err)
            }
        }
    }

    async fn build(&self) -> Result<Ready, ManagerError> {
        let context = EncryptionContext::initialize(
            &self.settings,
            self.master_keys.as_ref(),
            self.connector.as_ref(),
        )
        .await?;
        let context = Arc::new(context);
        let pool = EncryptedClientPool::new(context.clone(), self.connector.clone(), &self.settings);
        Ok(Ready { context, pool })
    }

    fn lock_status(&self) -> Result<MutexGuard<'_, Status>, ManagerError> {
        self.status.lock().map_err(ManagerError::poisoned)
    }
}
