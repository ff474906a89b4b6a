//! Record encryption metadata and the schema map derived from it.
//!
//! Record types register their fields explicitly through [`EncryptedModel`];
//! [`SchemaMapBuilder`] turns that registration into a [`RecordSchema`]
//! listing the encrypted fields and their algorithms.

use std::{
    any::TypeId,
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::store::Namespace;

/// How an encrypted field is encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Determinism {
    /// Same plaintext, same ciphertext. Supports equality queries.
    Deterministic,
    /// Fresh ciphertext on every write. No equality queries.
    Random,
}

impl Determinism {
    pub fn algorithm(self) -> &'static str {
        match self {
            Determinism::Deterministic => "AEAD_AES_256_GCM_HMAC_SHA_256-Deterministic",
            Determinism::Random => "AEAD_AES_256_GCM_HMAC_SHA_256-Random",
        }
    }
}

/// Declared protection level of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionLevel {
    None,
    /// Randomized encryption.
    Standard,
    /// Deterministic encryption; the field stays queryable by equality.
    Queryable,
}

impl EncryptionLevel {
    fn determinism(self) -> Option<Determinism> {
        match self {
            EncryptionLevel::None => None,
            EncryptionLevel::Standard => Some(Determinism::Random),
            EncryptionLevel::Queryable => Some(Determinism::Deterministic),
        }
    }
}

impl FromStr for EncryptionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(EncryptionLevel::None),
            "standard" | "random" => Ok(EncryptionLevel::Standard),
            "queryable" | "deterministic" => Ok(EncryptionLevel::Queryable),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for EncryptionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EncryptionLevel::None => "none",
            EncryptionLevel::Standard => "standard",
            EncryptionLevel::Queryable => "queryable",
        };
        f.write_str(label)
    }
}

/// Field metadata as declared by a record type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldAnnotation {
    pub name: &'static str,
    pub encrypt: bool,
    /// Raw level text; `None` on an encrypted field means `standard`.
    pub level: Option<&'static str>,
}

impl FieldAnnotation {
    /// A field stored in clear.
    pub const fn plain(name: &'static str) -> Self {
        Self {
            name,
            encrypt: false,
            level: None,
        }
    }

    /// A field under randomized encryption.
    pub const fn standard(name: &'static str) -> Self {
        Self {
            name,
            encrypt: true,
            level: Some("standard"),
        }
    }

    /// A field under deterministic encryption.
    pub const fn queryable(name: &'static str) -> Self {
        Self {
            name,
            encrypt: true,
            level: Some("queryable"),
        }
    }

    pub const fn declared(name: &'static str, encrypt: bool, level: &'static str) -> Self {
        Self {
            name,
            encrypt,
            level: Some(level),
        }
    }
}

/// Registration hook implemented by every record type stored through an
/// encrypted collection.
pub trait EncryptedModel: Send + Sync + 'static {
    /// Human-readable type name used in logs and pool keys.
    const NAME: &'static str;

    fn fields() -> Vec<FieldAnnotation>;
}

/// Type descriptor: identity plus the registration function of a record type.
#[derive(Clone, Copy)]
pub struct RecordType {
    id: TypeId,
    name: &'static str,
    fields: fn() -> Vec<FieldAnnotation>,
}

impl RecordType {
    pub fn of<T: EncryptedModel>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: T::NAME,
            fields: T::fields,
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn fields(&self) -> Vec<FieldAnnotation> {
        (self.fields)()
    }
}

impl fmt::Debug for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordType").field("name", &self.name).finish()
    }
}

impl PartialEq for RecordType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for RecordType {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldEncryptionSpec {
    pub field_name: String,
    pub encrypted: bool,
    pub determinism: Determinism,
}

/// Encrypted fields of one record type. Fields absent from the map are
/// stored in clear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSchema {
    pub record: &'static str,
    pub fields: BTreeMap<String, FieldEncryptionSpec>,
}

impl RecordSchema {
    pub fn field(&self, name: &str) -> Option<&FieldEncryptionSpec> {
        self.fields.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Driver-style JSON schema, suitable for logging and inspection.
    pub fn to_json_schema(&self) -> Value {
        let properties: serde_json::Map<String, Value> = self
            .fields
            .values()
            .map(|spec| {
                (
                    spec.field_name.clone(),
                    json!({ "encrypt": { "algorithm": spec.determinism.algorithm() } }),
                )
            })
            .collect();
        json!({ "bsonType": "object", "properties": properties })
    }
}

/// Record schemas scoped to qualified collection names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaMap {
    entries: BTreeMap<String, Arc<RecordSchema>>,
}

impl SchemaMap {
    pub fn scoped(namespace: &Namespace, schema: Arc<RecordSchema>) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(namespace.to_string(), schema);
        Self { entries }
    }

    pub fn get(&self, namespace: &Namespace) -> Option<&Arc<RecordSchema>> {
        self.entries.get(&namespace.to_string())
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaBuildError {
    #[error("{record}.{field}: unknown encryption level {level:?}")]
    UnknownLevel {
        record: &'static str,
        field: &'static str,
        level: String,
    },
    #[error("{record}.{field}: encrypt={encrypt} contradicts level {level}")]
    Contradictory {
        record: &'static str,
        field: &'static str,
        encrypt: bool,
        level: EncryptionLevel,
    },
    #[error("{record}.{field}: field declared more than once")]
    DuplicateField {
        record: &'static str,
        field: &'static str,
    },
    #[error("{record}: field with empty name")]
    EmptyFieldName { record: &'static str },
}

/// Derives record schemas from field registrations. Pure: no I/O, and the
/// same record type always yields the same schema.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaMapBuilder;

impl SchemaMapBuilder {
    pub fn build(&self, record: &RecordType) -> Result<RecordSchema, SchemaBuildError> {
        let name = record.name();
        let mut seen = BTreeSet::new();
        let mut fields = BTreeMap::new();

        for annotation in record.fields() {
            if annotation.name.is_empty() {
                return Err(SchemaBuildError::EmptyFieldName { record: name });
            }
            if !seen.insert(annotation.name) {
                return Err(SchemaBuildError::DuplicateField {
                    record: name,
                    field: annotation.name,
                });
            }

            let level = match annotation.level {
                Some(raw) => raw
                    .parse::<EncryptionLevel>()
                    .map_err(|level| SchemaBuildError::UnknownLevel {
                        record: name,
                        field: annotation.name,
                        level,
                    })?,
                None if annotation.encrypt => EncryptionLevel::Standard,
                None => EncryptionLevel::None,
            };

            match (annotation.encrypt, level.determinism()) {
                (true, Some(determinism)) => {
                    fields.insert(
                        annotation.name.to_string(),
                        FieldEncryptionSpec {
                            field_name: annotation.name.to_string(),
                            encrypted: true,
                            determinism,
                        },
                    );
                }
                (false, None) => {}
                (encrypt, _) => {
                    return Err(SchemaBuildError::Contradictory {
                        record: name,
                        field: annotation.name,
                        encrypt,
                        level,
                    })
                }
            }
        }

        Ok(RecordSchema {
            record: name,
            fields,
        })
    }
}
