use std::fmt;

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::master_key::MasterKey;

/// Data encryption key length: 32 bytes AES-256 key followed by 32 bytes HMAC key.
pub const DATA_KEY_LEN: usize = 64;

pub(crate) const NONCE_LEN: usize = 12;

const KEK_LABEL: &[u8] = b"fieldvault/local-kek/v1";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("cipher init failed: {reason}")]
    KeyInit { reason: String },
    #[error("encrypt failed")]
    Encrypt,
    /// Authentication failed: wrong key or tampered ciphertext.
    #[error("decrypt failed")]
    Decrypt,
    #[error("malformed ciphertext: {reason}")]
    Malformed { reason: String },
}

/// Per-deployment key used to encrypt field values. Only ever persisted
/// wrapped by the master key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DataKey {
    bytes: [u8; DATA_KEY_LEN],
}

impl DataKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; DATA_KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub(crate) fn encryption_key(&self) -> &[u8] {
        &self.bytes[..32]
    }

    pub(crate) fn mac_key(&self) -> &[u8] {
        &self.bytes[32..]
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataKey(<redacted>)")
    }
}

/// Encrypt a data key under the master key. Output is `nonce || ciphertext`.
pub fn wrap(master: &MasterKey, key: &DataKey) -> Result<Vec<u8>, CipherError> {
    let cipher = key_encryption_cipher(master)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, key.bytes.as_slice())
        .map_err(|_| CipherError::Encrypt)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn unwrap(master: &MasterKey, wrapped: &[u8]) -> Result<DataKey, CipherError> {
    if wrapped.len() <= NONCE_LEN {
        return Err(CipherError::Malformed {
            reason: format!("wrapped key is {} bytes", wrapped.len()),
        });
    }
    let (nonce, ciphertext) = wrapped.split_at(NONCE_LEN);
    let cipher = key_encryption_cipher(master)?;
    let plain = Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CipherError::Decrypt)?,
    );

    let bytes: [u8; DATA_KEY_LEN] =
        plain
            .as_slice()
            .try_into()
            .map_err(|_| CipherError::Malformed {
                reason: format!("data key is {} bytes, expected {DATA_KEY_LEN}", plain.len()),
            })?;
    Ok(DataKey { bytes })
}

fn key_encryption_cipher(master: &MasterKey) -> Result<Aes256Gcm, CipherError> {
    let mut kek = Zeroizing::new([0u8; 32]);
    kek.copy_from_slice(
        &Sha256::new()
            .chain_update(KEK_LABEL)
            .chain_update(master.as_bytes())
            .finalize(),
    );
    Aes256Gcm::new_from_slice(kek.as_slice()).map_err(|e| CipherError::KeyInit {
        reason: e.to_string(),
    })
}
