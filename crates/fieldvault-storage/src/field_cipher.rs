//! Field-level encryption of JSON values.
//!
//! A sealed value is stored as `{"$encrypted": "<base64url>"}` where the
//! payload is `algorithm (1) || key id (16) || nonce (12) || AES-GCM ciphertext`.
//! Deterministic encryption derives the nonce from an HMAC of the plaintext,
//! so equal plaintexts seal to equal values and stay matchable by equality.

use std::{collections::HashMap, fmt, sync::Arc};

use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use fieldvault_core::schema::Determinism;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use uuid::Uuid;

use crate::data_key::{CipherError, DataKey, NONCE_LEN};

type HmacSha256 = Hmac<Sha256>;

/// Key of the single-entry object that marks an encrypted value.
pub const ENCRYPTED_MARKER: &str = "$encrypted";

const HEADER_LEN: usize = 1 + 16;

fn algorithm_byte(determinism: Determinism) -> u8 {
    match determinism {
        Determinism::Deterministic => 1,
        Determinism::Random => 2,
    }
}

/// An encrypted value as parsed from its envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedValue {
    pub determinism: Determinism,
    pub key_id: Uuid,
    nonce: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
}

impl SealedValue {
    /// `None` when `value` is not an encrypted envelope at all.
    pub fn parse(value: &Value) -> Option<Result<Self, CipherError>> {
        let object = value.as_object()?;
        if object.len() != 1 {
            return None;
        }
        let encoded = object.get(ENCRYPTED_MARKER)?.as_str()?;
        Some(Self::decode(encoded))
    }

    fn decode(encoded: &str) -> Result<Self, CipherError> {
        let malformed = |reason: String| CipherError::Malformed { reason };

        let raw = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| malformed(format!("base64: {e}")))?;
        if raw.len() <= HEADER_LEN + NONCE_LEN {
            return Err(malformed(format!("payload is {} bytes", raw.len())));
        }

        let determinism = match raw[0] {
            1 => Determinism::Deterministic,
            2 => Determinism::Random,
            other => return Err(malformed(format!("unknown algorithm byte {other}"))),
        };
        let key_id = Uuid::from_slice(&raw[1..HEADER_LEN]).map_err(|e| malformed(e.to_string()))?;
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&raw[HEADER_LEN..HEADER_LEN + NONCE_LEN]);

        Ok(Self {
            determinism,
            key_id,
            nonce,
            ciphertext: raw[HEADER_LEN + NONCE_LEN..].to_vec(),
        })
    }

    fn header(&self) -> [u8; HEADER_LEN] {
        header(self.determinism, self.key_id)
    }
}

fn header(determinism: Determinism, key_id: Uuid) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[0] = algorithm_byte(determinism);
    out[1..].copy_from_slice(key_id.as_bytes());
    out
}

/// Encrypts and decrypts field values under one data key.
pub struct FieldCipher {
    key_id: Uuid,
    aead: Aes256Gcm,
    mac: HmacSha256,
}

impl fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldCipher")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl FieldCipher {
    pub fn new(key_id: Uuid, key: &DataKey) -> Result<Self, CipherError> {
        let aead = Aes256Gcm::new_from_slice(key.encryption_key()).map_err(|e| {
            CipherError::KeyInit {
                reason: e.to_string(),
            }
        })?;
        let mac = <HmacSha256 as Mac>::new_from_slice(key.mac_key()).map_err(|e| {
            CipherError::KeyInit {
                reason: e.to_string(),
            }
        })?;
        Ok(Self { key_id, aead, mac })
    }

    pub fn key_id(&self) -> Uuid {
        self.key_id
    }

    pub fn encrypt(&self, value: &Value, determinism: Determinism) -> Result<Value, CipherError> {
        let plaintext = serde_json::to_vec(value).map_err(|_| CipherError::Encrypt)?;
        let header = header(determinism, self.key_id);

        let nonce = match determinism {
            Determinism::Random => Aes256Gcm::generate_nonce(&mut OsRng),
            Determinism::Deterministic => {
                let mut mac = self.mac.clone();
                mac.update(&header);
                mac.update(&plaintext);
                let tag = mac.finalize().into_bytes();
                GenericArray::clone_from_slice(&tag[..NONCE_LEN])
            }
        };

        let ciphertext = self
            .aead
            .encrypt(
                &nonce,
                Payload {
                    msg: &plaintext,
                    aad: &header,
                },
            )
            .map_err(|_| CipherError::Encrypt)?;

        let mut raw = Vec::with_capacity(HEADER_LEN + NONCE_LEN + ciphertext.len());
        raw.extend_from_slice(&header);
        raw.extend_from_slice(nonce.as_slice());
        raw.extend_from_slice(&ciphertext);

        Ok(json!({ ENCRYPTED_MARKER: URL_SAFE_NO_PAD.encode(raw) }))
    }

    pub fn decrypt(&self, sealed: &SealedValue) -> Result<Value, CipherError> {
        if sealed.key_id != self.key_id {
            return Err(CipherError::Decrypt);
        }
        let header = sealed.header();
        let plaintext = self
            .aead
            .decrypt(
                Nonce::from_slice(&sealed.nonce),
                Payload {
                    msg: &sealed.ciphertext,
                    aad: &header,
                },
            )
            .map_err(|_| CipherError::Decrypt)?;

        serde_json::from_slice(&plaintext).map_err(|e| CipherError::Malformed {
            reason: format!("plaintext is not JSON: {e}"),
        })
    }
}

/// Unwrapped data keys available to a client, by key id.
#[derive(Debug, Default, Clone)]
pub struct KeyRing {
    ciphers: HashMap<Uuid, Arc<FieldCipher>>,
}

impl KeyRing {
    pub fn new(cipher: FieldCipher) -> Self {
        let mut ring = Self::default();
        ring.insert(cipher);
        ring
    }

    pub fn insert(&mut self, cipher: FieldCipher) {
        self.ciphers.insert(cipher.key_id(), Arc::new(cipher));
    }

    pub fn get(&self, key_id: &Uuid) -> Option<&Arc<FieldCipher>> {
        self.ciphers.get(key_id)
    }
}
