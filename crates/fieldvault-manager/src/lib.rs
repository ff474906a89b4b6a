//! Encrypted data-store connection manager: one process-wide owner of the
//! encryption context and the pool of encryption-capable store clients.

pub mod context;
pub mod error;
pub mod manager;
pub mod pool;
pub mod settings;

pub use context::{EncryptionContext, EncryptionSetupError};
pub use error::ManagerError;
pub use manager::{ConnectionManager, ManagerState};
pub use pool::EncryptedClientPool;
pub use settings::{KeyVaultSettings, ManagerSettings, PoolSettings, SettingsError};
