use serde::{Deserialize, Serialize};
use std::fmt;

/// How a source is paged through.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PaginationMode {
    /// Numbered pages with per-page entity tags (REST).
    #[default]
    Offset,
    /// Opaque continuation cursors (GraphQL).
    Cursor,
}

impl PaginationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaginationMode::Offset => "offset",
            PaginationMode::Cursor => "cursor",
        }
    }
}

impl fmt::Display for PaginationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tracked repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Source {
    pub owner: String,
    pub repo: String,
    pub mode: PaginationMode,
}

impl Source {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>, mode: PaginationMode) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            mode,
        }
    }

    /// Parse `owner/name`. Returns `None` when either half is missing.
    pub fn parse(full_name: &str, mode: PaginationMode) -> Option<Self> {
        let (owner, repo) = full_name.trim().split_once('/')?;
        if owner.is_empty() || repo.is_empty() || repo.contains('/') {
            return None;
        }
        Some(Self::new(owner, repo, mode))
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    /// Collection holding this source's canonical documents.
    pub fn collection(&self) -> String {
        issues_collection(&self.owner, &self.repo)
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

pub fn issues_collection(owner: &str, repo: &str) -> String {
    format!("issues-{}-{}", owner, repo)
}

/// Where in a source's pagination a fetch happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Position {
    /// 1-based page number.
    Page(u32),
    /// Continuation cursor; `None` is the first call.
    Cursor(Option<String>),
}

impl Position {
    pub fn first(mode: PaginationMode) -> Self {
        match mode {
            PaginationMode::Offset => Position::Page(1),
            PaginationMode::Cursor => Position::Cursor(None),
        }
    }

    /// Key used for cache entries of this position.
    pub fn key(&self) -> String {
        match self {
            Position::Page(page) => page.to_string(),
            Position::Cursor(None) => "start".to_string(),
            Position::Cursor(Some(cursor)) => cursor.clone(),
        }
    }

    /// The position after this one. Cursor positions advance to the token the
    /// remote returned and have no successor without one.
    pub fn next(&self, token: Option<&str>) -> Option<Position> {
        match self {
            Position::Page(page) => Some(Position::Page(page + 1)),
            Position::Cursor(_) => token.map(|t| Position::Cursor(Some(t.to_string()))),
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Page(page) => write!(f, "page {}", page),
            Position::Cursor(None) => f.write_str("cursor start"),
            Position::Cursor(Some(cursor)) => write!(f, "cursor {}", cursor),
        }
    }
}

/// Untransformed record as returned by one of the API variants.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    Rest(serde_json::Value),
    Graph(serde_json::Value),
}

/// Rate-limit accounting reported alongside a page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimit {
    pub remaining: Option<u64>,
    pub limit: Option<u64>,
    pub cost: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnrichedDate {
    pub time: String,
    pub weekday: String,
    pub weekday_number: u32,
    pub hour_of_day: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReactionSummary {
    pub total: i64,
    pub up_vote: i64,
    pub down_vote: i64,
    pub laugh: i64,
    pub hooray: i64,
    pub confused: i64,
    pub heart: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PullRequestDetails {
    pub additions: Option<i64>,
    pub deletions: Option<i64>,
    pub changed_files: Option<i64>,
    pub commits: Option<i64>,
    pub merged: bool,
    pub merged_by: Option<String>,
    pub reviewers: Vec<String>,
}

/// Storage-ready shape of one issue or pull request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CanonicalDocument {
    pub id: i64,
    pub owner: String,
    pub repo: String,
    pub state: Option<String>,
    pub title: Option<String>,
    pub number: i64,
    pub url: Option<String>,
    pub locked: bool,
    pub comments: i64,
    pub created_at: Option<EnrichedDate>,
    pub updated_at: Option<EnrichedDate>,
    pub closed_at: Option<EnrichedDate>,
    pub author_association: Option<String>,
    pub user: Option<String>,
    pub body: Option<String>,
    pub labels: Vec<String>,
    pub is_pullrequest: bool,
    pub assignees: Option<Vec<String>>,
    pub reactions: Option<ReactionSummary>,
    /// Milliseconds between creation and close.
    pub time_to_resolve: Option<i64>,
    pub pull_request: Option<PullRequestDetails>,
}

impl CanonicalDocument {
    pub fn collection(&self) -> String {
        issues_collection(&self.owner, &self.repo)
    }
}
