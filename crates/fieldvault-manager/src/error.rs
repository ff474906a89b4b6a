use fieldvault_core::{schema::SchemaBuildError, store::StoreError};
use thiserror::Error;

use crate::{context::EncryptionSetupError, settings::SettingsError};

#[derive(Debug, Error)]
pub enum ManagerError {
    /// Bad metadata on one record type; other types are unaffected.
    #[error(transparent)]
    SchemaBuild(#[from] SchemaBuildError),
    /// Initialization failed; the manager stays retryable.
    #[error("encryption setup failed: {0}")]
    EncryptionSetup(#[from] EncryptionSetupError),
    /// The attempt this caller waited on failed; carries that attempt's error.
    #[error("connection manager initialization failed: {reason}")]
    InitializationFailed { reason: String },
    #[error("connection manager is closed")]
    ManagerClosed,
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl ManagerError {
    pub(crate) fn poisoned(err: impl std::fmt::Display) -> Self {
        Self::Internal {
            reason: format!("lock poisoned: {err}"),
        }
    }
}
