//! Wire shapes of issues as returned by the REST and GraphQL APIs.
//!
//! Only the identifying fields are required. Every other field is read
//! leniently: a value of the wrong shape is logged and null-filled instead of
//! failing the record.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::warn;

fn parse_or_null<T: DeserializeOwned>(value: Value) -> Option<T> {
    if value.is_null() {
        return None;
    }
    match serde_json::from_value(value) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            warn!(%err, expected = std::any::type_name::<T>(), "unreadable field null-filled");
            None
        }
    }
}

/// Optional field that degrades to `None` when it cannot be read.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    Ok(Option::<Value>::deserialize(deserializer)?.and_then(parse_or_null))
}

/// Optional list whose unreadable items are dropped.
fn lenient_list<'de, D, T>(deserializer: D) -> Result<Option<Vec<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Array(items)) => Some(items.into_iter().filter_map(parse_or_null).collect()),
        Some(Value::Null) | None => None,
        Some(other) => {
            warn!(found = %other, "expected a list; null-filled");
            None
        }
    })
}

/// Connection nodes; unreadable nodes become `None` like inaccessible ones.
fn lenient_nodes<'de, D, T>(deserializer: D) -> Result<Vec<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Array(items)) => items.into_iter().map(parse_or_null).collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(other) => {
            warn!(found = %other, "expected connection nodes; treated as empty");
            Vec::new()
        }
    })
}

#[derive(Deserialize, Debug, Clone)]
pub struct Login {
    pub login: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Name {
    pub name: String,
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "camelCase")]
pub struct TotalCount {
    pub total_count: i64,
}

/// `GET /repos/{owner}/{repo}/issues` item.
#[derive(Deserialize, Debug, Clone)]
pub struct RestIssue {
    pub id: i64,
    pub number: i64,
    #[serde(default, deserialize_with = "lenient")]
    pub state: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub locked: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    pub comments: Option<i64>,
    #[serde(default, deserialize_with = "lenient")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient")]
    pub author_association: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub user: Option<Login>,
    #[serde(default, deserialize_with = "lenient")]
    pub body: Option<String>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub labels: Option<Vec<Name>>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub assignees: Option<Vec<Login>>,
    #[serde(default, deserialize_with = "lenient")]
    pub reactions: Option<RestReactions>,
    /// Present (with link URLs only) when the issue is a pull request.
    #[serde(default)]
    pub pull_request: Option<Value>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct RestReactions {
    #[serde(default, deserialize_with = "lenient")]
    pub total_count: Option<i64>,
    #[serde(rename = "+1", default, deserialize_with = "lenient")]
    pub plus_one: Option<i64>,
    #[serde(rename = "-1", default, deserialize_with = "lenient")]
    pub minus_one: Option<i64>,
    #[serde(default, deserialize_with = "lenient")]
    pub laugh: Option<i64>,
    #[serde(default, deserialize_with = "lenient")]
    pub hooray: Option<i64>,
    #[serde(default, deserialize_with = "lenient")]
    pub confused: Option<i64>,
    #[serde(default, deserialize_with = "lenient")]
    pub heart: Option<i64>,
}

/// GraphQL connection; nodes may be null for inaccessible items.
#[derive(Deserialize, Debug, Clone)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
pub struct Connection<T> {
    #[serde(default = "Vec::new", deserialize_with = "lenient_nodes")]
    pub nodes: Vec<Option<T>>,
}

impl<T> Connection<T> {
    pub fn into_present(self) -> impl Iterator<Item = T> {
        self.nodes.into_iter().flatten()
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct ReactionGroup {
    pub content: String,
    #[serde(default, deserialize_with = "lenient")]
    pub reactors: Option<TotalCount>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Review {
    #[serde(default, deserialize_with = "lenient")]
    pub author: Option<Login>,
}

/// `search(type: ISSUE)` node, either an `Issue` or a `PullRequest`.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GraphIssue {
    #[serde(rename = "__typename", default, deserialize_with = "lenient")]
    pub typename: Option<String>,
    pub database_id: i64,
    pub number: i64,
    #[serde(default, deserialize_with = "lenient")]
    pub state: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub locked: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    pub comments: Option<TotalCount>,
    #[serde(default, deserialize_with = "lenient")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient")]
    pub author_association: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub author: Option<Login>,
    #[serde(default, deserialize_with = "lenient")]
    pub body: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub labels: Option<Connection<Name>>,
    #[serde(default, deserialize_with = "lenient")]
    pub assignees: Option<Connection<Login>>,
    #[serde(default, deserialize_with = "lenient")]
    pub reactions: Option<TotalCount>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub reaction_groups: Option<Vec<ReactionGroup>>,
    #[serde(default, deserialize_with = "lenient")]
    pub additions: Option<i64>,
    #[serde(default, deserialize_with = "lenient")]
    pub deletions: Option<i64>,
    #[serde(default, deserialize_with = "lenient")]
    pub changed_files: Option<i64>,
    #[serde(default, deserialize_with = "lenient")]
    pub commits: Option<TotalCount>,
    #[serde(default, deserialize_with = "lenient")]
    pub merged: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    pub merged_by: Option<Login>,
    #[serde(default, deserialize_with = "lenient")]
    pub reviews: Option<Connection<Review>>,
}
