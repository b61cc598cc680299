//! Document store: bulk upserts into named collections backed by SQLite.
//!
//! This module is split into two submodules:
//! - `model`: bulk operations, per-item results and cache rows.
//! - `repo`: SQL-only functions plus the [`SqliteStore`] implementation.
//!
//! The sync engine only talks to the [`DocumentStore`] trait so tests can
//! swap in stores that fail on demand.

use async_trait::async_trait;
use thiserror::Error;

pub mod model;
pub mod repo;

pub use model::{BulkItemResult, BulkOp, BulkResponse, CacheDoc, CollectionCount, CACHE_COLLECTION};
pub use repo::*;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("invalid stored document: {0}")]
    Decode(#[from] serde_json::Error),
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Apply every operation as one logical batch. Item-level failures are
    /// reported in the response and leave nothing of the batch applied;
    /// `Err` means the batch as a whole failed.
    async fn bulk(&self, ops: Vec<BulkOp>) -> Result<BulkResponse, StoreError>;

    /// All cache entries recorded for one repository.
    async fn cache_entries(&self, owner: &str, repo: &str) -> Result<Vec<CacheDoc>, StoreError>;
}
