//! Batched persistence of canonical documents and their cache entries.

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::cursor::PendingCacheWrite;
use crate::db::{BulkOp, DocumentStore, StoreError};
use crate::model::CanonicalDocument;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{failed} of {total} bulk items failed; first: {first}")]
    Partial {
        failed: usize,
        total: usize,
        first: String,
    },
    #[error("failed to encode document {id}: {source}")]
    Encode {
        id: i64,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkSummary {
    pub documents: usize,
    pub cache_entries: usize,
}

#[derive(Clone)]
pub struct BulkIndexer {
    store: Arc<dyn DocumentStore>,
}

impl BulkIndexer {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Write a page's documents together with its staged cache entries as a
    /// single batch. Any item-level failure fails the whole call, so callers
    /// must not treat the page as processed.
    #[instrument(skip_all, fields(documents = documents.len(), cache_entries = cache.len()))]
    pub async fn write(
        &self,
        documents: &[CanonicalDocument],
        cache: Vec<PendingCacheWrite>,
    ) -> Result<BulkSummary, WriteError> {
        let summary = BulkSummary {
            documents: documents.len(),
            cache_entries: cache.len(),
        };
        if documents.is_empty() && cache.is_empty() {
            return Ok(summary);
        }

        let mut ops = Vec::with_capacity(documents.len() + cache.len());
        for doc in documents {
            let body = serde_json::to_value(doc).map_err(|source| WriteError::Encode {
                id: doc.id,
                source,
            })?;
            ops.push(BulkOp {
                collection: doc.collection(),
                id: doc.id.to_string(),
                body,
            });
        }
        ops.extend(cache.into_iter().map(PendingCacheWrite::into_op));

        let total = ops.len();
        let response = self.store.bulk(ops).await?;
        if response.has_errors() {
            let failed: Vec<_> = response.failed().collect();
            let first = failed
                .first()
                .map(|item| {
                    format!(
                        "{}/{}: {}",
                        item.collection,
                        item.id,
                        item.error.as_deref().unwrap_or("unknown error")
                    )
                })
                .unwrap_or_default();
            warn!(failed = failed.len(), total, %first, "bulk write reported item errors");
            return Err(WriteError::Partial {
                failed: failed.len(),
                total,
                first,
            });
        }
        debug!(total, "bulk write succeeded");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::CursorStore;
    use crate::db::{
        count_documents, get_document, init_pool, run_migrations, BulkItemResult, BulkResponse,
        CacheDoc, SqliteStore, CACHE_COLLECTION,
    };
    use crate::model::{PaginationMode, Position, Source};
    use async_trait::async_trait;

    fn doc(id: i64, title: &str) -> CanonicalDocument {
        CanonicalDocument {
            id,
            owner: "elastic".into(),
            repo: "eui".into(),
            state: Some("open".into()),
            title: Some(title.into()),
            number: id,
            url: None,
            locked: false,
            comments: 0,
            created_at: None,
            updated_at: None,
            closed_at: None,
            author_association: None,
            user: None,
            body: None,
            labels: vec![],
            is_pullrequest: false,
            assignees: None,
            reactions: None,
            time_to_resolve: None,
            pull_request: None,
        }
    }

    async fn sqlite() -> Arc<SqliteStore> {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        Arc::new(SqliteStore::new(pool))
    }

    /// Rejects every item of every batch.
    struct RejectingStore;

    #[async_trait]
    impl DocumentStore for RejectingStore {
        async fn bulk(&self, ops: Vec<BulkOp>) -> Result<BulkResponse, StoreError> {
            Ok(BulkResponse {
                items: ops
                    .into_iter()
                    .map(|op| BulkItemResult {
                        collection: op.collection,
                        id: op.id,
                        error: Some("mapper_parsing_exception".into()),
                    })
                    .collect(),
            })
        }

        async fn cache_entries(&self, _: &str, _: &str) -> Result<Vec<CacheDoc>, StoreError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn writes_documents_and_cache_together() {
        let db = sqlite().await;
        let indexer = BulkIndexer::new(db.clone());
        let source = Source::new("elastic", "eui", PaginationMode::Offset);
        let pending = CursorStore::new(db.clone()).stage(&source, &Position::Page(1), "\"e1\"");

        let summary = indexer
            .write(&[doc(1, "a"), doc(2, "b")], vec![pending])
            .await
            .unwrap();
        assert_eq!(
            summary,
            BulkSummary {
                documents: 2,
                cache_entries: 1
            }
        );
        assert_eq!(count_documents(db.pool(), "issues-elastic-eui").await.unwrap(), 2);
        assert_eq!(count_documents(db.pool(), CACHE_COLLECTION).await.unwrap(), 1);

        indexer.write(&[doc(1, "renamed")], vec![]).await.unwrap();
        let stored = get_document(db.pool(), "issues-elastic-eui", "1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored["title"], "renamed");
        assert_eq!(count_documents(db.pool(), "issues-elastic-eui").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn empty_batch_is_a_noop() {
        let indexer = BulkIndexer::new(Arc::new(RejectingStore));
        assert_eq!(indexer.write(&[], vec![]).await.unwrap(), BulkSummary::default());
    }

    #[tokio::test]
    async fn item_errors_fail_the_batch() {
        let indexer = BulkIndexer::new(Arc::new(RejectingStore));
        let err = indexer.write(&[doc(1, "a")], vec![]).await.unwrap_err();
        match err {
            WriteError::Partial { failed, total, first } => {
                assert_eq!(failed, 1);
                assert_eq!(total, 1);
                assert!(first.contains("issues-elastic-eui/1"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
