use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{Document, FindOptions, InsertOneResult, Namespace, StoreError, UpdateResult};

const ID_FIELD: &str = "_id";

/// Documents and index definitions of one collection. Backends wrap this in
/// whatever persistence they provide; the query semantics live here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionData {
    #[serde(default)]
    pub unique_fields: BTreeSet<String>,
    #[serde(default)]
    pub documents: Vec<Document>,
}

/// Top-level equality match. An array field matches when it contains the
/// filter value, so `{"keyAltNames": "a"}` matches `["a", "b"]`.
pub fn matches_filter(document: &Document, filter: &Document) -> bool {
    filter.iter().all(|(field, expected)| match document.get(field) {
        Some(actual) if actual == expected => true,
        Some(Value::Array(items)) => items.contains(expected),
        _ => false,
    })
}

impl CollectionData {
    pub fn insert(
        &mut self,
        namespace: &Namespace,
        mut document: Document,
    ) -> Result<InsertOneResult, StoreError> {
        let id = document
            .entry(ID_FIELD)
            .or_insert_with(|| Value::String(Uuid::new_v4().to_string()))
            .clone();

        self.check_unique(namespace, &document, None)?;
        self.documents.push(document);
        Ok(InsertOneResult { inserted_id: id })
    }

    pub fn find(&self, filter: &Document, options: FindOptions) -> Vec<Document> {
        let matching = self
            .documents
            .iter()
            .filter(|doc| matches_filter(doc, filter))
            .skip(options.skip);

        match options.limit {
            Some(limit) => matching.take(limit).cloned().collect(),
            None => matching.cloned().collect(),
        }
    }

    pub fn find_one(&self, filter: &Document) -> Option<Document> {
        self.documents
            .iter()
            .find(|doc| matches_filter(doc, filter))
            .cloned()
    }

    pub fn count(&self, filter: &Document) -> u64 {
        self.documents
            .iter()
            .filter(|doc| matches_filter(doc, filter))
            .count() as u64
    }

    pub fn update_one(
        &mut self,
        namespace: &Namespace,
        filter: &Document,
        update: &Document,
    ) -> Result<UpdateResult, StoreError> {
        let fields = set_fields(update)?;

        let Some(position) = self
            .documents
            .iter()
            .position(|doc| matches_filter(doc, filter))
        else {
            return Ok(UpdateResult::default());
        };

        let current = &self.documents[position];
        if let Some(new_id) = fields.get(ID_FIELD) {
            if current.get(ID_FIELD) != Some(new_id) {
                return Err(StoreError::InvalidUpdate {
                    reason: "_id is immutable".to_string(),
                });
            }
        }

        let mut updated = current.clone();
        for (field, value) in fields {
            updated.insert(field.clone(), value.clone());
        }

        if &updated == current {
            return Ok(UpdateResult {
                matched_count: 1,
                modified_count: 0,
            });
        }

        self.check_unique(namespace, &updated, Some(position))?;
        self.documents[position] = updated;
        Ok(UpdateResult {
            matched_count: 1,
            modified_count: 1,
        })
    }

    /// Register a unique index. Existing duplicates make the index unbuildable.
    pub fn add_unique_index(&mut self, namespace: &Namespace, field: &str) -> Result<(), StoreError> {
        if self.unique_fields.contains(field) {
            return Ok(());
        }

        let mut seen: Vec<&Value> = Vec::new();
        for doc in &self.documents {
            for value in index_values(doc, field) {
                if seen.contains(&value) {
                    return Err(StoreError::DuplicateKey {
                        namespace: namespace.to_string(),
                        field: field.to_string(),
                    });
                }
                seen.push(value);
            }
        }

        self.unique_fields.insert(field.to_string());
        Ok(())
    }

    fn check_unique(
        &self,
        namespace: &Namespace,
        candidate: &Document,
        skip: Option<usize>,
    ) -> Result<(), StoreError> {
        let fields = std::iter::once(ID_FIELD).chain(self.unique_fields.iter().map(String::as_str));

        for field in fields {
            let wanted = index_values(candidate, field);
            if wanted.is_empty() {
                continue;
            }
            let clash = self
                .documents
                .iter()
                .enumerate()
                .filter(|(idx, _)| Some(*idx) != skip)
                .any(|(_, doc)| index_values(doc, field).iter().any(|v| wanted.contains(v)));
            if clash {
                return Err(StoreError::DuplicateKey {
                    namespace: namespace.to_string(),
                    field: field.to_string(),
                });
            }
        }
        Ok(())
    }
}

fn index_values<'a>(document: &'a Document, field: &str) -> Vec<&'a Value> {
    match document.get(field) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.iter().collect(),
        Some(value) => vec![value],
    }
}

fn set_fields(update: &Document) -> Result<&Document, StoreError> {
    if update.len() != 1 {
        return Err(StoreError::InvalidUpdate {
            reason: "expected a single $set operator".to_string(),
        });
    }
    match update.get("$set") {
        Some(Value::Object(fields)) => Ok(fields),
        _ => Err(StoreError::InvalidUpdate {
            reason: "only {\"$set\": {...}} updates are supported".to_string(),
        }),
    }
}
