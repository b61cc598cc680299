use reqwest::Url;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use issue_sync::github::{FetchOutcome, GraphqlClient, PageFetcher, RestClient};
use issue_sync::model::{PaginationMode, Position, Source};

fn eui() -> Source {
    Source::new("elastic", "eui", PaginationMode::Offset)
}

fn charts() -> Source {
    Source::new("elastic", "elastic-charts", PaginationMode::Cursor)
}

fn rest_client(server: &MockServer) -> RestClient {
    let base = Url::parse(&format!("{}/", server.uri())).unwrap();
    RestClient::with_base_url("test-token".into(), base, 2, Duration::from_secs(5)).unwrap()
}

fn graphql_client(server: &MockServer) -> GraphqlClient {
    let endpoint = Url::parse(&format!("{}/graphql", server.uri())).unwrap();
    GraphqlClient::with_endpoint("test-token".into(), endpoint, 2, Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn offset_page_reads_etag_link_and_rate_limit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/elastic/eui/issues"))
        .and(query_param("page", "1"))
        .and(query_param("per_page", "2"))
        .and(query_param("state", "all"))
        .and(query_param("direction", "asc"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([
                    { "id": 100, "number": 1 },
                    { "id": 101, "number": 2 }
                ]))
                .insert_header("ETag", "W/\"abc\"")
                .insert_header(
                    "Link",
                    "<https://api.github.com/repositories/1/issues?page=2>; rel=\"next\", \
                     <https://api.github.com/repositories/1/issues?page=5>; rel=\"last\"",
                )
                .insert_header("x-ratelimit-remaining", "4998")
                .insert_header("x-ratelimit-limit", "5000"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let outcome = rest_client(&server)
        .fetch(&eui(), &Position::Page(1), None)
        .await
        .unwrap();
    let page = match outcome {
        FetchOutcome::Fetched(page) => page,
        other => panic!("expected a fetched page, got {:?}", other),
    };
    assert_eq!(page.records.len(), 2);
    assert_eq!(page.token.as_deref(), Some("W/\"abc\""));
    assert!(page.has_more);
    let rate = page.rate_limit.unwrap();
    assert_eq!(rate.remaining, Some(4998));
    assert_eq!(rate.limit, Some(5000));
}

#[tokio::test]
async fn last_offset_page_has_no_more() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/elastic/eui/issues"))
        .and(query_param("page", "5"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([{ "id": 500, "number": 9 }]))
                .insert_header("ETag", "\"last\"")
                .insert_header(
                    "Link",
                    "<https://api.github.com/repositories/1/issues?page=4>; rel=\"prev\"",
                ),
        )
        .mount(&server)
        .await;

    let outcome = rest_client(&server)
        .fetch(&eui(), &Position::Page(5), None)
        .await
        .unwrap();
    let page = match outcome {
        FetchOutcome::Fetched(page) => page,
        other => panic!("expected a fetched page, got {:?}", other),
    };
    assert!(!page.has_more);
    assert_eq!(page.token.as_deref(), Some("\"last\""));
}

#[tokio::test]
async fn cached_etag_is_sent_and_304_is_not_modified() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/elastic/eui/issues"))
        .and(header("if-none-match", "W/\"abc\""))
        .respond_with(ResponseTemplate::new(304).insert_header("x-ratelimit-remaining", "4997"))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = rest_client(&server)
        .fetch(&eui(), &Position::Page(1), Some("W/\"abc\""))
        .await
        .unwrap();
    match outcome {
        FetchOutcome::NotModified { rate_limit } => {
            assert_eq!(rate_limit.and_then(|r| r.remaining), Some(4997));
        }
        other => panic!("expected not modified, got {:?}", other),
    }
}

#[tokio::test]
async fn rest_errors_are_classified() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(502).set_body_string("Bad Gateway"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(query_param("page", "2"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({ "message": "Bad credentials" })),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(query_param("page", "3"))
        .respond_with(
            ResponseTemplate::new(403)
                .insert_header("x-ratelimit-remaining", "0")
                .set_body_json(json!({ "message": "API rate limit exceeded" })),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(query_param("page", "4"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let client = rest_client(&server);
    let fetch = |page| {
        let client = client.clone();
        async move { client.fetch(&eui(), &Position::Page(page), None).await }
    };
    assert!(fetch(1).await.unwrap_err().is_transient());
    let unauthorized = fetch(2).await.unwrap_err();
    assert!(!unauthorized.is_transient());
    assert!(unauthorized.to_string().contains("Bad credentials"));
    assert!(fetch(3).await.unwrap_err().is_transient());
    assert!(!fetch(4).await.unwrap_err().is_transient());
}

#[tokio::test]
async fn graphql_page_follows_cursor() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(header("authorization", "Bearer test-token"))
        .and(body_partial_json(json!({
            "variables": {
                "query": "repo:elastic/elastic-charts sort:created-asc",
                "first": 2,
                "after": "c1"
            }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "rateLimit": { "cost": 1, "remaining": 4980, "limit": 5000 },
                "search": {
                    "pageInfo": { "hasNextPage": true, "endCursor": "c2" },
                    "nodes": [
                        { "__typename": "Issue", "databaseId": 7, "number": 7 },
                        { "__typename": "PullRequest", "databaseId": 8, "number": 8 }
                    ]
                }
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = graphql_client(&server)
        .fetch(&charts(), &Position::Cursor(Some("c1".into())), None)
        .await
        .unwrap();
    let page = match outcome {
        FetchOutcome::Fetched(page) => page,
        other => panic!("expected a fetched page, got {:?}", other),
    };
    assert_eq!(page.records.len(), 2);
    assert_eq!(page.token.as_deref(), Some("c2"));
    assert!(page.has_more);
    assert_eq!(page.rate_limit.and_then(|r| r.cost), Some(1));
}

#[tokio::test]
async fn graphql_errors_are_classified() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_partial_json(json!({ "variables": { "after": "limited" } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errors": [{ "type": "RATE_LIMITED", "message": "API rate limit exceeded" }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_partial_json(json!({ "variables": { "after": "denied" } })))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({ "message": "Bad credentials" })),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_partial_json(json!({ "variables": { "after": "flaky" } })))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = graphql_client(&server);
    let fetch = |cursor: &'static str| {
        let client = client.clone();
        async move {
            client
                .fetch(&charts(), &Position::Cursor(Some(cursor.into())), None)
                .await
        }
    };
    assert!(fetch("limited").await.unwrap_err().is_transient());
    assert!(!fetch("denied").await.unwrap_err().is_transient());
    assert!(fetch("flaky").await.unwrap_err().is_transient());
}

#[tokio::test]
async fn fetchers_reject_foreign_positions() {
    let server = MockServer::start().await;
    let rest = rest_client(&server);
    let graphql = graphql_client(&server);
    assert!(!rest
        .fetch(&eui(), &Position::Cursor(None), None)
        .await
        .unwrap_err()
        .is_transient());
    assert!(!graphql
        .fetch(&charts(), &Position::Page(1), None)
        .await
        .unwrap_err()
        .is_transient());
}
