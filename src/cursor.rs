//! Per-source memory of what each pagination position looked like last time.
//!
//! Entries live in the `cache` collection next to the documents so that a
//! page's documents and its entry can be committed in the same batch.

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::db::{BulkOp, DocumentStore, StoreError, CACHE_COLLECTION};
use crate::model::{Position, Source};

/// Cache entry staged for a page, written only together with its documents.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCacheWrite {
    op: BulkOp,
}

impl PendingCacheWrite {
    pub fn id(&self) -> &str {
        &self.op.id
    }

    pub fn into_op(self) -> BulkOp {
        self.op
    }
}

pub fn cache_id(source: &Source, position_key: &str) -> String {
    format!("{}_{}_{}", source.owner, source.repo, position_key)
}

#[derive(Clone)]
pub struct CursorStore {
    store: Arc<dyn DocumentStore>,
}

impl CursorStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Position key → token for every entry recorded for `source`. A source
    /// that was never synced yields an empty map.
    #[instrument(skip_all, fields(source = %source))]
    pub async fn load(&self, source: &Source) -> Result<HashMap<String, String>, StoreError> {
        let entries = self.store.cache_entries(&source.owner, &source.repo).await?;
        debug!(entries = entries.len(), "cache loaded");
        Ok(entries.into_iter().map(|e| (e.position, e.key)).collect())
    }

    /// Prepare the entry recording `token` for `position`; nothing is written
    /// until the indexer commits it.
    pub fn stage(&self, source: &Source, position: &Position, token: &str) -> PendingCacheWrite {
        let key = position.key();
        PendingCacheWrite {
            op: BulkOp {
                collection: CACHE_COLLECTION.to_string(),
                id: cache_id(source, &key),
                body: json!({
                    "owner": source.owner,
                    "repo": source.repo,
                    "position": key,
                    "key": token,
                }),
            },
        }
    }
}
