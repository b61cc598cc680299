use super::model::{BulkItemResult, BulkOp, BulkResponse, CacheDoc, CollectionCount, CACHE_COLLECTION};
use super::{DocumentStore, StoreError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, instrument, warn};

pub type Pool = SqlitePool;

const UPSERT_DOCUMENT: &str = "INSERT INTO documents (collection, doc_id, body, indexed_at) \
     VALUES (?, ?, ?, CURRENT_TIMESTAMP) \
     ON CONFLICT(collection, doc_id) DO UPDATE SET body = excluded.body, indexed_at = excluded.indexed_at";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let in_memory = normalized.starts_with("sqlite::memory");
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {}", normalized))?
        .create_if_missing(true)
        // WAL and stricter durability; cache commits must survive a crash.
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);
    // Every connection to `:memory:` is a separate database.
    let max_connections = if in_memory { 1 } else { 5 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .context("failed to open document store")?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{}", expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Upsert every operation inside one transaction. A failing statement is
/// recorded against its item and the whole batch is rolled back, so a cache
/// entry never lands without every document it was staged with.
#[instrument(skip_all, fields(ops = ops.len()))]
pub async fn bulk_upsert(pool: &Pool, ops: &[BulkOp]) -> Result<BulkResponse, StoreError> {
    let mut tx = pool.begin().await?;
    let mut items = Vec::with_capacity(ops.len());
    for op in ops {
        let res = sqlx::query(UPSERT_DOCUMENT)
            .bind(&op.collection)
            .bind(&op.id)
            .bind(op.body.to_string())
            .execute(&mut *tx)
            .await;
        items.push(BulkItemResult {
            collection: op.collection.clone(),
            id: op.id.clone(),
            error: res.err().map(|e| e.to_string()),
        });
    }
    let response = BulkResponse { items };
    if response.has_errors() {
        tx.rollback().await?;
        warn!(
            failed = response.failed().count(),
            items = response.items.len(),
            "bulk batch rolled back"
        );
        return Ok(response);
    }
    tx.commit().await?;
    debug!(items = response.items.len(), "bulk batch committed");
    Ok(response)
}

#[instrument(skip_all)]
pub async fn load_cache_entries(
    pool: &Pool,
    owner: &str,
    repo: &str,
) -> Result<Vec<CacheDoc>, StoreError> {
    let bodies: Vec<String> = sqlx::query_scalar(
        "SELECT body FROM documents \
         WHERE collection = ? AND json_extract(body, '$.owner') = ? AND json_extract(body, '$.repo') = ? \
         ORDER BY doc_id",
    )
    .bind(CACHE_COLLECTION)
    .bind(owner)
    .bind(repo)
    .fetch_all(pool)
    .await?;
    bodies
        .iter()
        .map(|b| serde_json::from_str(b).map_err(StoreError::from))
        .collect()
}

#[instrument(skip_all)]
pub async fn list_cache_entries(pool: &Pool) -> Result<Vec<CacheDoc>, StoreError> {
    let bodies: Vec<String> =
        sqlx::query_scalar("SELECT body FROM documents WHERE collection = ? ORDER BY doc_id")
            .bind(CACHE_COLLECTION)
            .fetch_all(pool)
            .await?;
    bodies
        .iter()
        .map(|b| serde_json::from_str(b).map_err(StoreError::from))
        .collect()
}

#[instrument(skip_all)]
pub async fn get_document(
    pool: &Pool,
    collection: &str,
    id: &str,
) -> Result<Option<Value>, StoreError> {
    let body: Option<String> =
        sqlx::query_scalar("SELECT body FROM documents WHERE collection = ? AND doc_id = ?")
            .bind(collection)
            .bind(id)
            .fetch_optional(pool)
            .await?;
    body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
        .transpose()
}

#[instrument(skip_all)]
pub async fn count_documents(pool: &Pool, collection: &str) -> Result<i64, StoreError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE collection = ?")
        .bind(collection)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[instrument(skip_all)]
pub async fn collection_counts(pool: &Pool) -> Result<Vec<CollectionCount>, StoreError> {
    let rows = sqlx::query(
        "SELECT collection, COUNT(*) AS documents FROM documents GROUP BY collection ORDER BY collection",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| CollectionCount {
            collection: row.get("collection"),
            documents: row.get("documents"),
        })
        .collect())
}

/// [`DocumentStore`] over a SQLite pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn bulk(&self, ops: Vec<BulkOp>) -> Result<BulkResponse, StoreError> {
        bulk_upsert(&self.pool, &ops).await
    }

    async fn cache_entries(&self, owner: &str, repo: &str) -> Result<Vec<CacheDoc>, StoreError> {
        load_cache_entries(&self.pool, owner, repo).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn setup_pool() -> Pool {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    fn op(collection: &str, id: &str, body: Value) -> BulkOp {
        BulkOp {
            collection: collection.into(),
            id: id.into(),
            body,
        }
    }

    #[tokio::test]
    async fn upsert_replaces_existing_document() {
        let pool = setup_pool().await;
        bulk_upsert(&pool, &[op("issues-a-b", "1", json!({"title": "first", "extra": true}))])
            .await
            .unwrap();
        let res = bulk_upsert(&pool, &[op("issues-a-b", "1", json!({"title": "second"}))])
            .await
            .unwrap();
        assert!(!res.has_errors());

        assert_eq!(count_documents(&pool, "issues-a-b").await.unwrap(), 1);
        let stored = get_document(&pool, "issues-a-b", "1").await.unwrap().unwrap();
        assert_eq!(stored, json!({"title": "second"}));
    }

    #[tokio::test]
    async fn rejected_item_rolls_back_the_batch() {
        let pool = setup_pool().await;
        sqlx::query(
            "CREATE TRIGGER reject_101 BEFORE INSERT ON documents \
             WHEN NEW.doc_id = '101' BEGIN SELECT RAISE(ABORT, 'rejected'); END",
        )
        .execute(&pool)
        .await
        .unwrap();

        let res = bulk_upsert(
            &pool,
            &[
                op("issues-a-b", "100", json!({"title": "kept?"})),
                op("issues-a-b", "101", json!({"title": "rejected"})),
                op(CACHE_COLLECTION, "a_b_1", json!({"owner": "a", "repo": "b", "position": "1", "key": "t1"})),
            ],
        )
        .await
        .unwrap();
        assert!(res.has_errors());
        let failed: Vec<_> = res.failed().map(|i| i.id.as_str()).collect();
        assert_eq!(failed, vec!["101"]);

        assert_eq!(count_documents(&pool, "issues-a-b").await.unwrap(), 0);
        assert!(load_cache_entries(&pool, "a", "b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cache_entries_are_scoped_to_repository() {
        let pool = setup_pool().await;
        assert!(load_cache_entries(&pool, "a", "b").await.unwrap().is_empty());

        let entry = |owner: &str, repo: &str, pos: &str, key: &str| {
            op(
                CACHE_COLLECTION,
                &format!("{}_{}_{}", owner, repo, pos),
                json!({"owner": owner, "repo": repo, "position": pos, "key": key}),
            )
        };
        bulk_upsert(
            &pool,
            &[
                entry("a", "b", "1", "\"e1\""),
                entry("a", "b", "2", "\"e2\""),
                entry("a", "c", "1", "\"x\""),
            ],
        )
        .await
        .unwrap();

        let entries = load_cache_entries(&pool, "a", "b").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.repo == "b"));
        assert_eq!(list_cache_entries(&pool).await.unwrap().len(), 3);

        let counts = collection_counts(&pool).await.unwrap();
        assert_eq!(
            counts,
            vec![CollectionCount {
                collection: CACHE_COLLECTION.into(),
                documents: 3
            }]
        );
    }

    #[test]
    fn prepare_sqlite_url_keeps_memory_and_query() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("postgres://localhost/db"),
            "postgres://localhost/db"
        );
        let td = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/nested/issues.db?mode=rwc", td.path().display());
        assert_eq!(prepare_sqlite_url(&url), url);
        assert!(td.path().join("nested").exists());
    }
}
