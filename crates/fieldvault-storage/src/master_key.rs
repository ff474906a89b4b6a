use std::{
    fmt, fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use rand::{rngs::OsRng, RngCore};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, instrument};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Size of the local master key in bytes.
pub const MASTER_KEY_LEN: usize = 96;

/// Long-lived local master key. Wraps the data encryption keys held in the
/// key vault; never logged.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; MASTER_KEY_LEN],
}

impl MasterKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; MASTER_KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Accepts exactly [`MASTER_KEY_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; MASTER_KEY_LEN] = bytes.try_into().ok()?;
        Some(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; MASTER_KEY_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

#[derive(Debug, Error)]
pub enum KeyStorageError {
    #[error("cannot read master key at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot write master key at {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("master key at {} is {actual} bytes, expected {MASTER_KEY_LEN}", path.display())]
    InvalidLength { path: PathBuf, actual: usize },
    #[error("master key source unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Provides the master key: generated and persisted on first use, loaded
/// thereafter. Safe to call concurrently.
#[async_trait]
pub trait MasterKeySource: Send + Sync {
    async fn obtain(&self) -> Result<MasterKey, KeyStorageError>;
}

/// Master key persisted as a raw 96-byte file.
pub struct FileMasterKeySource {
    path: PathBuf,
    cached: tokio::sync::Mutex<Option<MasterKey>>,
}

impl FileMasterKeySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MasterKeySource for FileMasterKeySource {
    #[instrument(skip_all, fields(path = %self.path.display()))]
    async fn obtain(&self) -> Result<MasterKey, KeyStorageError> {
        // Held across the whole generate-or-load sequence.
        let mut guard = self.cached.lock().await;
        if let Some(existing) = guard.as_ref() {
            return Ok(existing.clone());
        }

        let key = load_or_create(&self.path)?;
        *guard = Some(key.clone());
        Ok(key)
    }
}

fn load_or_create(path: &Path) -> Result<MasterKey, KeyStorageError> {
    match read_key(path) {
        Err(KeyStorageError::Read { source, .. }) if source.kind() == ErrorKind::NotFound => {
            info!("master key not found, creating new one");
            create_key(path)
        }
        other => {
            debug!("loading existing master key");
            other
        }
    }
}

fn read_key(path: &Path) -> Result<MasterKey, KeyStorageError> {
    let bytes = Zeroizing::new(fs::read(path).map_err(|source| KeyStorageError::Read {
        path: path.to_path_buf(),
        source,
    })?);

    MasterKey::from_slice(&bytes).ok_or_else(|| KeyStorageError::InvalidLength {
        path: path.to_path_buf(),
        actual: bytes.len(),
    })
}

fn create_key(path: &Path) -> Result<MasterKey, KeyStorageError> {
    let write_err = |source: std::io::Error| KeyStorageError::Write {
        path: path.to_path_buf(),
        source,
    };

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(write_err)?;

    let key = MasterKey::generate();
    let mut tmp = NamedTempFile::new_in(parent).map_err(write_err)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(write_err)?;
    }
    tmp.write_all(key.as_bytes()).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;

    match tmp.persist_noclobber(path) {
        Ok(_) => Ok(key),
        Err(err) if err.error.kind() == ErrorKind::AlreadyExists => {
            // Another process won the race; its key is authoritative.
            debug!("master key appeared concurrently, loading it");
            read_key(path)
        }
        Err(err) => Err(write_err(err.error)),
    }
}

/// In-memory master key source for tests and ephemeral sessions.
#[derive(Debug, Default, Clone)]
pub struct InMemoryMasterKeySource {
    inner: Arc<Mutex<Option<MasterKey>>>,
}

impl InMemoryMasterKeySource {
    pub fn with_key(key: MasterKey) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(key))),
        }
    }
}

#[async_trait]
impl MasterKeySource for InMemoryMasterKeySource {
    async fn obtain(&self) -> Result<MasterKey, KeyStorageError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|err| KeyStorageError::Unavailable {
                reason: format!("lock poisoned: {err}"),
            })?;

        if let Some(existing) = guard.clone() {
            return Ok(existing);
        }

        let key = MasterKey::generate();
        *guard = Some(key.clone());
        Ok(key)
    }
}
