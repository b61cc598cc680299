//! Cursor-paginated issue search over the GraphQL API.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::{build_http, classify_status, FetchError, FetchOutcome, Page, PageFetcher};
use crate::config::Github;
use crate::model::{PaginationMode, Position, RateLimit, RawRecord, Source};

const SEARCH_QUERY: &str = r#"
query($query: String!, $first: Int!, $after: String) {
  rateLimit { cost remaining limit }
  search(query: $query, type: ISSUE, first: $first, after: $after) {
    pageInfo { hasNextPage endCursor }
    nodes {
      __typename
      ... on Issue {
        databaseId number state title url locked createdAt updatedAt closedAt
        authorAssociation body
        author { login }
        comments { totalCount }
        labels(first: 50) { nodes { name } }
        assignees(first: 20) { nodes { login } }
        reactions { totalCount }
        reactionGroups { content reactors { totalCount } }
      }
      ... on PullRequest {
        databaseId number state title url locked createdAt updatedAt closedAt
        authorAssociation body
        author { login }
        comments { totalCount }
        labels(first: 50) { nodes { name } }
        assignees(first: 20) { nodes { login } }
        reactions { totalCount }
        reactionGroups { content reactors { totalCount } }
        additions deletions changedFiles merged
        mergedBy { login }
        commits { totalCount }
        reviews(first: 100) { nodes { author { login } } }
      }
    }
  }
}
"#;

#[derive(Clone)]
pub struct GraphqlClient {
    http: Client,
    endpoint: Url,
    token: String,
    per_page: u32,
}

impl fmt::Debug for GraphqlClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphqlClient")
            .field("endpoint", &self.endpoint)
            .field("per_page", &self.per_page)
            .finish_non_exhaustive()
    }
}

impl GraphqlClient {
    pub fn from_config(cfg: &Github) -> Result<Self> {
        let endpoint = Url::parse(&cfg.graphql_url).context("invalid github.graphql_url")?;
        Self::with_endpoint(
            cfg.token.clone(),
            endpoint,
            cfg.per_page,
            Duration::from_secs(cfg.timeout_seconds),
        )
    }

    pub fn with_endpoint(
        token: String,
        endpoint: Url,
        per_page: u32,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            http: build_http(timeout)?,
            endpoint,
            token,
            per_page,
        })
    }

    pub fn build_request(
        &self,
        source: &Source,
        cursor: Option<&str>,
    ) -> Result<reqwest::Request, FetchError> {
        let body = json!({
            "query": SEARCH_QUERY,
            "variables": {
                "query": search_filter(source),
                "first": self.per_page,
                "after": cursor,
            }
        });
        self.http
            .post(self.endpoint.clone())
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .json(&body)
            .build()
            .map_err(|e| FetchError::Permanent(format!("failed to build request: {}", e)))
    }

    #[instrument(skip_all, fields(source = %source, cursor = cursor.unwrap_or("start")))]
    async fn fetch_cursor(
        &self,
        source: &Source,
        cursor: Option<&str>,
    ) -> Result<FetchOutcome, FetchError> {
        let request = self.build_request(source, cursor)?;
        debug!("requesting search page");
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| FetchError::Transient(format!("failed to reach GitHub: {}", e)))?;

        let status = res.status();
        let header_rate = super::rate_limit_from_headers(res.headers());
        let body = res
            .text()
            .await
            .map_err(|e| FetchError::Transient(format!("failed to read search payload: {}", e)))?;
        if !status.is_success() {
            warn!(%status, "GitHub GraphQL error");
            return Err(classify_status(status, header_rate.as_ref(), &body));
        }

        let mut page = parse_search_response(&body)?;
        if page.rate_limit.is_none() {
            page.rate_limit = header_rate;
        }
        Ok(FetchOutcome::Fetched(page))
    }
}

#[async_trait]
impl PageFetcher for GraphqlClient {
    fn mode(&self) -> PaginationMode {
        PaginationMode::Cursor
    }

    /// Cursor pages are never conditioned; `freshness` is ignored.
    async fn fetch(
        &self,
        source: &Source,
        position: &Position,
        _freshness: Option<&str>,
    ) -> Result<FetchOutcome, FetchError> {
        match position {
            Position::Cursor(cursor) => self.fetch_cursor(source, cursor.as_deref()).await,
            Position::Page(_) => Err(FetchError::Permanent(format!(
                "GraphQL search cannot fetch {}",
                position
            ))),
        }
    }
}

/// Search qualifier selecting every issue and pull request of a repository,
/// oldest first.
pub fn search_filter(source: &Source) -> String {
    format!("repo:{}/{} sort:created-asc", source.owner, source.repo)
}

#[derive(Deserialize)]
struct GraphResponse {
    #[serde(default)]
    data: Option<SearchData>,
    #[serde(default)]
    errors: Vec<GraphError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchData {
    #[serde(default)]
    rate_limit: Option<GraphRateLimit>,
    search: SearchConnection,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchConnection {
    page_info: PageInfo,
    #[serde(default)]
    nodes: Vec<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    #[serde(default)]
    end_cursor: Option<String>,
}

#[derive(Deserialize)]
struct GraphRateLimit {
    #[serde(default)]
    cost: Option<u64>,
    #[serde(default)]
    remaining: Option<u64>,
    #[serde(default)]
    limit: Option<u64>,
}

#[derive(Deserialize)]
struct GraphError {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    message: String,
}

/// Decode a search response body into a page. Nodes of other types come back
/// as empty objects and are dropped here.
pub fn parse_search_response(body: &str) -> Result<Page, FetchError> {
    let resp: GraphResponse = serde_json::from_str(body)
        .map_err(|e| FetchError::Permanent(format!("invalid GraphQL payload: {}", e)))?;

    if !resp.errors.is_empty() {
        let message = resp
            .errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        let rate_limited = resp
            .errors
            .iter()
            .any(|e| e.kind.as_deref() == Some("RATE_LIMITED"));
        return Err(if rate_limited {
            FetchError::Transient(format!("GraphQL rate limited: {}", message))
        } else {
            FetchError::Permanent(format!("GraphQL errors: {}", message))
        });
    }

    let data = resp
        .data
        .ok_or_else(|| FetchError::Permanent("GraphQL response without data".to_string()))?;
    let info = data.search.page_info;
    if info.has_next_page && info.end_cursor.is_none() {
        return Err(FetchError::Permanent(
            "search reported more pages without an end cursor".to_string(),
        ));
    }

    let records = data
        .search
        .nodes
        .into_iter()
        .filter(|node| node.as_object().map_or(false, |o| !o.is_empty()))
        .map(RawRecord::Graph)
        .collect();

    Ok(Page {
        records,
        token: info.end_cursor,
        has_more: info.has_next_page,
        rate_limit: data.rate_limit.map(|r| RateLimit {
            remaining: r.remaining,
            limit: r.limit,
            cost: r.cost,
        }),
    })
}
