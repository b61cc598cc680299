//! Bulk operation and row models used by the store.
//!
//! Keep these structs focused on the data moved in and out of SQL. Sync
//! logic lives in higher layers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Collection that holds cursor cache entries.
pub const CACHE_COLLECTION: &str = "cache";

/// One upsert: `body` replaces whatever is stored under `(collection, id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkOp {
    pub collection: String,
    pub id: String,
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemResult {
    pub collection: String,
    pub id: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkResponse {
    pub items: Vec<BulkItemResult>,
}

impl BulkResponse {
    pub fn has_errors(&self) -> bool {
        self.items.iter().any(|i| i.error.is_some())
    }

    pub fn failed(&self) -> impl Iterator<Item = &BulkItemResult> {
        self.items.iter().filter(|i| i.error.is_some())
    }
}

/// Body of a document in the `cache` collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheDoc {
    pub owner: String,
    pub repo: String,
    pub position: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionCount {
    pub collection: String,
    pub documents: i64,
}
