use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, ETAG, IF_NONE_MATCH, LINK};
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::config::Github;
use crate::model::{PaginationMode, Position, RateLimit, RawRecord, Source};

pub mod graphql;
pub mod model;

pub use graphql::GraphqlClient;

const USER_AGENT: &str = "issue-sync/0.1";

static NEXT_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<[^>]*>\s*;\s*rel="?next"?"#).expect("valid link regex"));

#[derive(Debug, Error)]
pub enum FetchError {
    /// Network trouble, rate limiting or a server-side failure; worth retrying.
    #[error("transient fetch failure: {0}")]
    Transient(String),
    /// Authentication, a malformed request or an undecodable response.
    #[error("permanent fetch failure: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

/// A page that carried content.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<RawRecord>,
    /// Entity tag (offset mode) or continuation cursor (cursor mode).
    pub token: Option<String>,
    pub has_more: bool,
    pub rate_limit: Option<RateLimit>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// The freshness token still matches; nothing to process.
    NotModified { rate_limit: Option<RateLimit> },
    Fetched(Page),
}

/// Fetch the next unit of a source, optionally conditioned on the token
/// recorded for that position on an earlier run.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    fn mode(&self) -> PaginationMode;

    async fn fetch(
        &self,
        source: &Source,
        position: &Position,
        freshness: Option<&str>,
    ) -> Result<FetchOutcome, FetchError>;
}

/// Offset-paginated issue listing over the REST API.
#[derive(Clone)]
pub struct RestClient {
    http: Client,
    base_url: Url,
    token: String,
    per_page: u32,
}

impl fmt::Debug for RestClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url)
            .field("per_page", &self.per_page)
            .finish_non_exhaustive()
    }
}

pub(crate) fn build_http(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .context("failed to build HTTP client")
}

impl RestClient {
    pub fn from_config(cfg: &Github) -> Result<Self> {
        let base_url = Url::parse(&cfg.api_url).context("invalid github.api_url")?;
        Self::with_base_url(
            cfg.token.clone(),
            base_url,
            cfg.per_page,
            Duration::from_secs(cfg.timeout_seconds),
        )
    }

    pub fn with_base_url(
        token: String,
        base_url: Url,
        per_page: u32,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            http: build_http(timeout)?,
            base_url,
            token,
            per_page,
        })
    }

    /// Oldest first so that existing page boundaries stay stable as new
    /// issues are opened.
    pub fn build_request(
        &self,
        source: &Source,
        page: u32,
        etag: Option<&str>,
    ) -> Result<reqwest::Request, FetchError> {
        let endpoint = self
            .base_url
            .join(&format!("repos/{}/{}/issues", source.owner, source.repo))
            .map_err(|e| FetchError::Permanent(format!("invalid issues url: {}", e)))?;
        let mut req = self
            .http
            .get(endpoint)
            .query(&[
                ("state", "all".to_string()),
                ("sort", "created".to_string()),
                ("direction", "asc".to_string()),
                ("per_page", self.per_page.to_string()),
                ("page", page.to_string()),
            ])
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .header(ACCEPT, "application/vnd.github+json");
        if let Some(tag) = etag {
            req = req.header(IF_NONE_MATCH, tag);
        }
        req.build()
            .map_err(|e| FetchError::Permanent(format!("failed to build request: {}", e)))
    }

    #[instrument(skip_all, fields(source = %source, page = page))]
    async fn fetch_page(
        &self,
        source: &Source,
        page: u32,
        etag: Option<&str>,
    ) -> Result<FetchOutcome, FetchError> {
        let request = self.build_request(source, page, etag)?;
        debug!(url = %request.url(), conditional = etag.is_some(), "requesting issues page");
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| FetchError::Transient(format!("failed to reach GitHub: {}", e)))?;

        let status = res.status();
        let rate_limit = rate_limit_from_headers(res.headers());
        if status == StatusCode::NOT_MODIFIED {
            return Ok(FetchOutcome::NotModified { rate_limit });
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, "GitHub REST error");
            return Err(classify_status(status, rate_limit.as_ref(), &body));
        }

        let token = res
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let has_more = res
            .headers()
            .get(LINK)
            .and_then(|v| v.to_str().ok())
            .map(has_next_link)
            .unwrap_or(false);
        let items: Vec<Value> = res.json().await.map_err(|e| {
            if e.is_decode() {
                FetchError::Permanent(format!("invalid issues payload: {}", e))
            } else {
                FetchError::Transient(format!("failed to read issues payload: {}", e))
            }
        })?;

        Ok(FetchOutcome::Fetched(Page {
            records: items.into_iter().map(RawRecord::Rest).collect(),
            token,
            has_more,
            rate_limit,
        }))
    }
}

#[async_trait]
impl PageFetcher for RestClient {
    fn mode(&self) -> PaginationMode {
        PaginationMode::Offset
    }

    async fn fetch(
        &self,
        source: &Source,
        position: &Position,
        freshness: Option<&str>,
    ) -> Result<FetchOutcome, FetchError> {
        match position {
            Position::Page(page) => self.fetch_page(source, *page, freshness).await,
            Position::Cursor(_) => Err(FetchError::Permanent(format!(
                "REST listing cannot fetch {}",
                position
            ))),
        }
    }
}

/// True when a `Link` header advertises a `rel="next"` relation.
pub fn has_next_link(link: &str) -> bool {
    link.split(',').any(|part| NEXT_LINK.is_match(part.trim()))
}

pub fn rate_limit_from_headers(headers: &HeaderMap) -> Option<RateLimit> {
    let read = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
    };
    let remaining = read("x-ratelimit-remaining");
    let limit = read("x-ratelimit-limit");
    if remaining.is_none() && limit.is_none() {
        return None;
    }
    Some(RateLimit {
        remaining,
        limit,
        cost: None,
    })
}

/// Map a non-success status onto the error taxonomy.
pub fn classify_status(status: StatusCode, rate: Option<&RateLimit>, body: &str) -> FetchError {
    let message = format!("GitHub returned {}: {}", status, body.trim());
    let exhausted = rate.and_then(|r| r.remaining) == Some(0);
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return FetchError::Transient(message);
    }
    if status == StatusCode::FORBIDDEN
        && (exhausted || body.to_ascii_lowercase().contains("rate limit"))
    {
        return FetchError::Transient(message);
    }
    FetchError::Permanent(message)
}
