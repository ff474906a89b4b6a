//! Key management and field-level encryption for fieldvault.
//! Master keys wrap per-deployment data keys kept in a key-vault collection;
//! data keys encrypt individual record fields with AES-256-GCM.

pub mod auto_encryption;
pub mod data_key;
pub mod field_cipher;
pub mod file_store;
pub mod key_vault;
pub mod master_key;
