//! Integration tests for the REST client against a mock server.

use pipeline_run::api::{ApiClient, LogQuery};
use pipeline_run::logs::{LogAction, LogWindow};
use pipeline_run::session::ChannelAuthenticator;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const LOGS_PATH: &str = "/api/organizations/1/pipelines/2/runs/3/logs";

#[tokio::test]
async fn test_channel_auth_posts_socket_and_channel() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/super-api/channel_auth"))
        .and(header("authorization", "Bearer tok"))
        .and(body_json(json!({"socket_id": "sock-1", "channel_name": "pipelines:1:2"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"auth": "signed"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = ApiClient::new(&server.uri(), Some("tok".into())).unwrap();
    let token = client.authenticate("sock-1", "pipelines:1:2").await.unwrap();
    assert_eq!(token.get("auth"), Some(&json!("signed")));
}

#[tokio::test]
async fn test_channel_auth_failure_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/super-api/channel_auth"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let client = ApiClient::new(&server.uri(), None).unwrap();
    let err = client.authenticate_channel("s", "pipelines:1:2").await.unwrap_err();
    assert!(err.to_string().contains("403"));
}

#[tokio::test]
async fn test_run_logs_sends_query() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(LOGS_PATH))
        .and(query_param("after", "c1"))
        .and(query_param("block_name", "chat"))
        .and(query_param("per_page", "20"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"id": 5, "message": "done", "block_name": "chat", "message_types": ["text"]}],
            "meta": {"after": "c2"}
        })))
        .mount(&server)
        .await;

    let client = ApiClient::new(&server.uri(), None).unwrap();
    let query = LogQuery {
        after: Some("c1".into()),
        block_name: Some("chat".into()),
        per_page: Some(20),
    };
    let page = client.run_logs(1, 2, "3", &query).await.unwrap();
    assert_eq!(page.data.len(), 1);
    assert_eq!(page.data[0].message, "done");
    assert_eq!(page.meta.after.as_deref(), Some("c2"));
}

#[tokio::test]
async fn test_paginating_into_a_log_window() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(LOGS_PATH))
        .and(query_param("after", "older"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"id": 2, "message": "b"}, {"id": 1, "message": "a"}],
            "meta": {"after": null}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(LOGS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"id": 4, "message": "d"}, {"id": 3, "message": "c"}],
            "meta": {"after": "older"}
        })))
        .mount(&server)
        .await;

    let client = ApiClient::new(&server.uri(), None).unwrap();
    let mut window = LogWindow::new();
    while window.has_more() {
        let query = LogQuery {
            after: window.next_cursor().map(str::to_string),
            ..LogQuery::default()
        };
        let page = client.run_logs(1, 2, "3", &query).await.unwrap();
        window.apply(LogAction::FetchOlder {
            entries: page.data,
            after: page.meta.after,
        });
    }

    let ids: Vec<u64> = window.entries().iter().map(|e| e.id).collect();
    assert_eq!(ids, [1, 2, 3, 4]);
}

#[tokio::test]
async fn test_run_logs_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(LOGS_PATH))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let client = ApiClient::new(&server.uri(), None).unwrap();
    assert!(client.run_logs(1, 2, "3", &LogQuery::default()).await.is_err());
}
