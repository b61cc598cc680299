//! Raw issue → canonical document conversion.
//!
//! Pure and deterministic: converting the same record twice yields equal
//! documents, which is what lets unchanged pages converge on re-ingest.

use chrono::{DateTime, Datelike, SecondsFormat, Timelike, Utc};
use serde::Deserialize;
use std::collections::{BTreeSet, HashSet};
use thiserror::Error;

use crate::github::model::{GraphIssue, Login, ReactionGroup, RestIssue, RestReactions, TotalCount};
use crate::model::{
    CanonicalDocument, EnrichedDate, PullRequestDetails, RawRecord, ReactionSummary, Source,
};

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("malformed {variant} record: {reason}")]
    MalformedRecord {
        variant: &'static str,
        reason: String,
    },
}

pub fn enrich_date(ts: Option<DateTime<Utc>>) -> Option<EnrichedDate> {
    let ts = ts?;
    Some(EnrichedDate {
        time: ts.to_rfc3339_opts(SecondsFormat::Secs, true),
        weekday: ts.format("%a").to_string(),
        weekday_number: ts.weekday().num_days_from_sunday(),
        hour_of_day: ts.hour(),
    })
}

/// Milliseconds from creation to close; `None` while open.
pub fn time_to_resolve(
    created: Option<DateTime<Utc>>,
    closed: Option<DateTime<Utc>>,
) -> Option<i64> {
    match (created, closed) {
        (Some(created), Some(closed)) => Some((closed - created).num_milliseconds()),
        _ => None,
    }
}

/// `None` for an empty or missing list, so consumers can tell "nobody is
/// assigned" apart from a list that happens to contain handles.
fn handles<I>(logins: Option<I>) -> Option<Vec<String>>
where
    I: IntoIterator<Item = Login>,
{
    let list: Vec<String> = logins?.into_iter().map(|l| l.login).collect();
    if list.is_empty() {
        None
    } else {
        Some(list)
    }
}

/// Label names in first-seen order without repeats.
fn label_names<I>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    names
        .into_iter()
        .filter(|n| seen.insert(n.clone()))
        .collect()
}

fn rest_reactions(r: RestReactions) -> ReactionSummary {
    ReactionSummary {
        total: r.total_count.unwrap_or(0),
        up_vote: r.plus_one.unwrap_or(0),
        down_vote: r.minus_one.unwrap_or(0),
        laugh: r.laugh.unwrap_or(0),
        hooray: r.hooray.unwrap_or(0),
        confused: r.confused.unwrap_or(0),
        heart: r.heart.unwrap_or(0),
    }
}

fn graph_reactions(
    total: Option<TotalCount>,
    groups: Option<Vec<ReactionGroup>>,
) -> Option<ReactionSummary> {
    if total.is_none() && groups.is_none() {
        return None;
    }
    let groups = groups.unwrap_or_default();
    let count = |content: &str| {
        groups
            .iter()
            .find(|g| g.content == content)
            .and_then(|g| g.reactors)
            .map_or(0, |c| c.total_count)
    };
    let mut summary = ReactionSummary {
        total: 0,
        up_vote: count("THUMBS_UP"),
        down_vote: count("THUMBS_DOWN"),
        laugh: count("LAUGH"),
        hooray: count("HOORAY"),
        confused: count("CONFUSED"),
        heart: count("HEART"),
    };
    summary.total = match total {
        Some(t) => t.total_count,
        None => groups
            .iter()
            .filter_map(|g| g.reactors)
            .map(|c| c.total_count)
            .sum(),
    };
    Some(summary)
}

fn convert_rest(issue: RestIssue, source: &Source) -> CanonicalDocument {
    CanonicalDocument {
        id: issue.id,
        owner: source.owner.clone(),
        repo: source.repo.clone(),
        state: issue.state.map(|s| s.to_ascii_lowercase()),
        title: issue.title,
        number: issue.number,
        url: issue.url,
        locked: issue.locked.unwrap_or(false),
        comments: issue.comments.unwrap_or(0),
        created_at: enrich_date(issue.created_at),
        updated_at: enrich_date(issue.updated_at),
        closed_at: enrich_date(issue.closed_at),
        author_association: issue.author_association,
        user: issue.user.map(|u| u.login),
        body: issue.body,
        labels: label_names(issue.labels.unwrap_or_default().into_iter().map(|l| l.name)),
        is_pullrequest: issue.pull_request.is_some(),
        assignees: handles(issue.assignees),
        reactions: issue.reactions.map(rest_reactions),
        time_to_resolve: time_to_resolve(issue.created_at, issue.closed_at),
        // The listing endpoint does not carry diff statistics.
        pull_request: None,
    }
}

fn convert_graph(issue: GraphIssue, source: &Source) -> CanonicalDocument {
    let is_pullrequest = issue.typename.as_deref() == Some("PullRequest");
    let pull_request = is_pullrequest.then(|| {
        let reviewers: BTreeSet<String> = issue
            .reviews
            .clone()
            .map(|c| c.into_present().filter_map(|r| r.author).map(|a| a.login).collect())
            .unwrap_or_default();
        PullRequestDetails {
            additions: issue.additions,
            deletions: issue.deletions,
            changed_files: issue.changed_files,
            commits: issue.commits.map(|c| c.total_count),
            merged: issue.merged.unwrap_or(false),
            merged_by: issue.merged_by.clone().map(|m| m.login),
            reviewers: reviewers.into_iter().collect(),
        }
    });

    CanonicalDocument {
        id: issue.database_id,
        owner: source.owner.clone(),
        repo: source.repo.clone(),
        state: issue.state.map(|s| s.to_ascii_lowercase()),
        title: issue.title,
        number: issue.number,
        url: issue.url,
        locked: issue.locked.unwrap_or(false),
        comments: issue.comments.map_or(0, |c| c.total_count),
        created_at: enrich_date(issue.created_at),
        updated_at: enrich_date(issue.updated_at),
        closed_at: enrich_date(issue.closed_at),
        author_association: issue.author_association,
        user: issue.author.map(|a| a.login),
        body: issue.body,
        labels: label_names(
            issue
                .labels
                .map(|c| c.into_present().map(|l| l.name).collect::<Vec<_>>())
                .unwrap_or_default(),
        ),
        is_pullrequest,
        assignees: handles(issue.assignees.map(|c| c.into_present().collect::<Vec<_>>())),
        reactions: graph_reactions(issue.reactions, issue.reaction_groups),
        time_to_resolve: time_to_resolve(issue.created_at, issue.closed_at),
        pull_request,
    }
}

/// Convert one raw record for `source`.
pub fn convert(raw: &RawRecord, source: &Source) -> Result<CanonicalDocument, TransformError> {
    match raw {
        RawRecord::Rest(value) => RestIssue::deserialize(value)
            .map(|issue| convert_rest(issue, source))
            .map_err(|e| TransformError::MalformedRecord {
                variant: "REST",
                reason: e.to_string(),
            }),
        RawRecord::Graph(value) => GraphIssue::deserialize(value)
            .map(|issue| convert_graph(issue, source))
            .map_err(|e| TransformError::MalformedRecord {
                variant: "GraphQL",
                reason: e.to_string(),
            }),
    }
}
