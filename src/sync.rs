//! Per-source sync loop and the bounded fan-out across sources.
//!
//! Each source walks its pages strictly in order: a page is committed before
//! the next one is requested, so an interrupted run resumes from whatever
//! was committed last. Sources share nothing but the store and run on their
//! own tasks.

use futures::future::join_all;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::SyncSettings;
use crate::cursor::CursorStore;
use crate::db::{DocumentStore, StoreError};
use crate::github::{FetchError, FetchOutcome, Page, PageFetcher};
use crate::indexer::{BulkIndexer, WriteError};
use crate::model::{PaginationMode, Position, RateLimit, Source};
use crate::transform;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to load cache: {0}")]
    CacheLoad(#[source] StoreError),
    #[error("no fetcher registered for {0} pagination")]
    NoFetcher(PaginationMode),
    #[error("fetching {position} failed after {attempts} attempt(s): {source}")]
    Fetch {
        position: String,
        attempts: u32,
        #[source]
        source: FetchError,
    },
    #[error("writing {position} failed: {source}")]
    Write {
        position: String,
        #[source]
        source: WriteError,
    },
    #[error("{position} reported more pages without a continuation cursor")]
    MissingCursor { position: String },
    #[error("sync task aborted: {0}")]
    Task(String),
}

/// Counters collected while a source is synced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub pages_fetched: u32,
    pub pages_skipped: u32,
    pub pages_written: u32,
    pub documents_written: usize,
    pub malformed_records: usize,
    pub retries: u32,
    /// Sum of the GraphQL query costs reported.
    pub query_cost: u64,
    pub last_rate_limit: Option<RateLimit>,
}

impl SourceStats {
    fn observe(&mut self, rate: Option<RateLimit>) {
        let Some(rate) = rate else { return };
        self.query_cost += rate.cost.unwrap_or(0);
        debug!(
            remaining = ?rate.remaining,
            limit = ?rate.limit,
            cost = ?rate.cost,
            "rate limit"
        );
        self.last_rate_limit = Some(rate);
    }
}

#[derive(Debug)]
pub enum SourceOutcome {
    Completed,
    Interrupted,
    Failed(SyncError),
}

impl SourceOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            SourceOutcome::Completed => "completed",
            SourceOutcome::Interrupted => "interrupted",
            SourceOutcome::Failed(_) => "failed",
        }
    }
}

#[derive(Debug)]
pub struct SourceReport {
    pub source: Source,
    pub outcome: SourceOutcome,
    pub stats: SourceStats,
}

#[derive(Debug)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub reports: Vec<SourceReport>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        !self
            .reports
            .iter()
            .any(|r| matches!(r.outcome, SourceOutcome::Failed(_)))
    }

    pub fn count(&self, label: &str) -> usize {
        self.reports
            .iter()
            .filter(|r| r.outcome.label() == label)
            .count()
    }

    pub fn report(&self, full_name: &str) -> Option<&SourceReport> {
        self.reports.iter().find(|r| r.source.full_name() == full_name)
    }

    /// Human-readable summary, one line per source.
    pub fn render(&self) -> String {
        let mut out = format!(
            "run {}: {} completed, {} failed, {} interrupted\n",
            self.run_id,
            self.count("completed"),
            self.count("failed"),
            self.count("interrupted"),
        );
        for r in &self.reports {
            let _ = write!(
                out,
                "  {} [{}] {}: fetched={} skipped={} written={} documents={} malformed={} retries={}",
                r.source,
                r.source.mode,
                r.outcome.label(),
                r.stats.pages_fetched,
                r.stats.pages_skipped,
                r.stats.pages_written,
                r.stats.documents_written,
                r.stats.malformed_records,
                r.stats.retries,
            );
            if let SourceOutcome::Failed(err) = &r.outcome {
                let _ = write!(out, " error=\"{}\"", err);
            }
            out.push('\n');
        }
        out
    }
}

/// `base * 2^attempt`, capped at `cap`.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    base.saturating_mul(1u32 << attempt.min(10)).min(cap)
}

enum Flow {
    Done,
    Interrupted,
}

#[derive(Clone)]
pub struct SyncOrchestrator {
    fetchers: HashMap<PaginationMode, Arc<dyn PageFetcher>>,
    cursors: CursorStore,
    indexer: BulkIndexer,
    settings: SyncSettings,
    shutdown: Arc<AtomicBool>,
}

impl SyncOrchestrator {
    pub fn new(store: Arc<dyn DocumentStore>, settings: SyncSettings) -> Self {
        Self {
            fetchers: HashMap::new(),
            cursors: CursorStore::new(store.clone()),
            indexer: BulkIndexer::new(store),
            settings,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register the fetcher used for sources of `fetcher.mode()`.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn PageFetcher>) -> Self {
        self.fetchers.insert(fetcher.mode(), fetcher);
        self
    }

    pub fn with_shutdown(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = flag;
        self
    }

    /// Setting the returned flag stops every source before its next page.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Sync every source, at most `sync.concurrency` at a time. Every source
    /// is attempted regardless of how the others end.
    pub async fn run(&self, sources: Vec<Source>) -> RunSummary {
        let run_id = Uuid::new_v4();
        info!(%run_id, sources = sources.len(), concurrency = self.settings.concurrency, "starting sync run");

        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut handles = Vec::with_capacity(sources.len());
        let mut reports = Vec::with_capacity(sources.len());
        for source in sources {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(err) => {
                    reports.push(SourceReport {
                        source,
                        outcome: SourceOutcome::Failed(SyncError::Task(err.to_string())),
                        stats: SourceStats::default(),
                    });
                    continue;
                }
            };
            let this = self.clone();
            let task_source = source.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                this.sync_source(task_source).await
            });
            handles.push((source, handle));
        }

        let joined = join_all(
            handles
                .into_iter()
                .map(|(source, handle)| async move { (source, handle.await) }),
        )
        .await;
        for (source, result) in joined {
            match result {
                Ok(report) => reports.push(report),
                Err(err) => {
                    error!(%source, %err, "sync task did not finish");
                    reports.push(SourceReport {
                        source,
                        outcome: SourceOutcome::Failed(SyncError::Task(err.to_string())),
                        stats: SourceStats::default(),
                    });
                }
            }
        }

        let summary = RunSummary { run_id, reports };
        info!(
            %run_id,
            completed = summary.count("completed"),
            failed = summary.count("failed"),
            interrupted = summary.count("interrupted"),
            "sync run finished"
        );
        summary
    }

    /// Sync one source to completion, failure or interruption.
    #[instrument(skip_all, fields(source = %source, mode = %source.mode))]
    pub async fn sync_source(&self, source: Source) -> SourceReport {
        let mut stats = SourceStats::default();
        let outcome = match self.drive(&source, &mut stats).await {
            Ok(Flow::Done) => {
                info!(
                    pages = stats.pages_fetched,
                    skipped = stats.pages_skipped,
                    documents = stats.documents_written,
                    "source synced"
                );
                SourceOutcome::Completed
            }
            Ok(Flow::Interrupted) => {
                warn!(pages = stats.pages_fetched, "source interrupted");
                SourceOutcome::Interrupted
            }
            Err(err) => {
                error!(%err, "source failed");
                SourceOutcome::Failed(err)
            }
        };
        SourceReport {
            source,
            outcome,
            stats,
        }
    }

    async fn drive(&self, source: &Source, stats: &mut SourceStats) -> Result<Flow, SyncError> {
        let fetcher = self
            .fetchers
            .get(&source.mode)
            .cloned()
            .ok_or(SyncError::NoFetcher(source.mode))?;
        let cache = self
            .cursors
            .load(source)
            .await
            .map_err(SyncError::CacheLoad)?;

        let mut position = Position::first(source.mode);
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(Flow::Interrupted);
            }

            let freshness = match source.mode {
                PaginationMode::Offset => cache.get(&position.key()).map(String::as_str),
                PaginationMode::Cursor => None,
            };
            let outcome = self
                .fetch_with_retry(fetcher.as_ref(), source, &position, freshness, stats)
                .await?;

            let (token, has_more) = match outcome {
                FetchOutcome::NotModified { rate_limit } => {
                    stats.pages_skipped += 1;
                    stats.observe(rate_limit);
                    debug!(%position, "not modified; skipping");
                    // Only positions the remote listed as existing are cached,
                    // so an unchanged one is never the last.
                    (None, true)
                }
                FetchOutcome::Fetched(page) => {
                    stats.pages_fetched += 1;
                    stats.observe(page.rate_limit);
                    self.commit_page(source, &position, &page, stats).await?;
                    (page.token, page.has_more)
                }
            };

            if !has_more {
                return Ok(Flow::Done);
            }
            position = position
                .next(token.as_deref())
                .ok_or_else(|| SyncError::MissingCursor {
                    position: position.to_string(),
                })?;
        }
    }

    async fn fetch_with_retry(
        &self,
        fetcher: &dyn PageFetcher,
        source: &Source,
        position: &Position,
        freshness: Option<&str>,
        stats: &mut SourceStats,
    ) -> Result<FetchOutcome, SyncError> {
        let mut attempt = 0u32;
        loop {
            match fetcher.fetch(source, position, freshness).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_transient() && attempt < self.settings.max_retries => {
                    let delay = backoff_delay(
                        attempt,
                        self.settings.retry_base(),
                        self.settings.max_backoff(),
                    );
                    warn!(%err, %position, attempt, delay_ms = delay.as_millis() as u64, "fetch failed; backing off");
                    stats.retries += 1;
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    return Err(SyncError::Fetch {
                        position: position.to_string(),
                        attempts: attempt + 1,
                        source: err,
                    })
                }
            }
        }
    }

    /// Transform and write one content-bearing page. The page's cache entry
    /// is staged only when every record converted.
    async fn commit_page(
        &self,
        source: &Source,
        position: &Position,
        page: &Page,
        stats: &mut SourceStats,
    ) -> Result<(), SyncError> {
        if page.records.is_empty() {
            debug!(%position, "empty page");
            return Ok(());
        }

        let mut documents = Vec::with_capacity(page.records.len());
        let mut malformed = 0usize;
        for raw in &page.records {
            match transform::convert(raw, source) {
                Ok(doc) => documents.push(doc),
                Err(err) => {
                    malformed += 1;
                    warn!(%err, %position, "skipping record");
                }
            }
        }
        stats.malformed_records += malformed;

        let mut cache = Vec::new();
        match page.token.as_deref() {
            Some(token) if malformed == 0 => cache.push(self.cursors.stage(source, position, token)),
            Some(_) => warn!(%position, malformed, "cache entry withheld; page will be fetched again"),
            None => debug!(%position, "page carried no token"),
        }

        let summary = self
            .indexer
            .write(&documents, cache)
            .await
            .map_err(|err| SyncError::Write {
                position: position.to_string(),
                source: err,
            })?;
        stats.pages_written += 1;
        stats.documents_written += summary.documents;
        debug!(%position, documents = summary.documents, "page committed");
        Ok(())
    }
}
