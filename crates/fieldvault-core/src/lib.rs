//! Core abstractions for fieldvault: document-store contracts and record
//! encryption metadata. This crate is intentionally small to keep dependency
//! surface minimal.

pub mod schema;
pub mod store;
