use mockito::Matcher;

use crate::support::{authorization, http};
use tier1_dashboard::adapters::Artifact;
use tier1_dashboard::BackendClient;

const TASKS: &str = r#"[
    {"id": "t1", "name": "run 42", "filename": "run42.root", "size": 1024, "timestamp": "2025-01-01T00:00:00Z"},
    {"id": "t2", "name": "run 43", "filename": "run43.root", "size": 2048, "timestamp": "2025-01-02T00:00:00Z"}
]"#;

#[tokio::test]
async fn test_collections_carry_bearer_token() {
    let mut server = mockito::Server::new_async().await;
    let tasks = server
        .mock("GET", "/tasks")
        .match_header("authorization", "Bearer token-a")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(TASKS)
        .create_async()
        .await;
    let events = server
        .mock("GET", "/events")
        .match_header("authorization", "Bearer token-a")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"[{"task_id": "t1", "event": "INGESTED", "timestamp": "2025-01-01T00:00:01Z"}]"#)
        .create_async()
        .await;

    let backend = BackendClient::new(http(), &server.url()).unwrap();
    let auth = authorization("token-a");

    let fetched = backend.tasks(&auth).await.unwrap();
    assert_eq!(fetched.len(), 2);
    assert_eq!(fetched[1].filename, "run43.root");
    assert_eq!(fetched[1].size, 2048);

    let fetched = backend.events(&auth).await.unwrap();
    assert_eq!(fetched[0].event, "INGESTED");

    tasks.assert_async().await;
    events.assert_async().await;
}

#[tokio::test]
async fn test_null_and_empty_lists() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/tasks")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body("null")
        .create_async()
        .await;
    server
        .mock("GET", "/events")
        .with_status(200)
        .create_async()
        .await;

    let backend = BackendClient::new(http(), &server.url()).unwrap();
    let auth = authorization("token-a");
    assert!(backend.tasks(&auth).await.unwrap().is_empty());
    assert!(backend.events(&auth).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_error_status_is_reported() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/tasks")
        .with_status(401)
        .with_body("token expired")
        .create_async()
        .await;

    let backend = BackendClient::new(http(), &server.url()).unwrap();
    let err = backend.tasks(&authorization("token-a")).await.unwrap_err();
    assert!(format!("{:#}", err).contains("401"));
}

#[tokio::test]
async fn test_task_lookup_and_search() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/tasks/t1")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"id": "t1", "name": "run 42", "filename": "run42.root", "size": 1024, "timestamp": "2025-01-01T00:00:00Z"}"#)
        .create_async()
        .await;
    let search = server
        .mock("GET", "/tasks")
        .match_query(Matcher::UrlEncoded("q".into(), "run 4".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(TASKS)
        .create_async()
        .await;

    let backend = BackendClient::new(http(), &server.url()).unwrap();
    let auth = authorization("token-a");

    let task = backend.task("t1", &auth).await.unwrap();
    assert_eq!(task.name, "run 42");

    let found = backend.search_tasks("run 4", &auth).await.unwrap();
    assert_eq!(found.len(), 2);
    search.assert_async().await;
}

#[tokio::test]
async fn test_presigned_artifact_is_fetched_without_credentials() {
    let mut server = mockito::Server::new_async().await;
    let presigned_url = format!("{}/bucket/run42.root?X-Amz-Signature=abc", server.url());
    server
        .mock("GET", "/data/t1")
        .match_header("authorization", "Bearer token-a")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(serde_json::json!({ "url": presigned_url }).to_string())
        .create_async()
        .await;
    let object = server
        .mock("GET", "/bucket/run42.root")
        .match_query(Matcher::Any)
        .match_header("authorization", Matcher::Missing)
        .with_status(200)
        .with_body("raw bytes")
        .create_async()
        .await;

    let backend = BackendClient::new(http(), &server.url()).unwrap();
    let artifact = backend.artifact("t1", &authorization("token-a")).await.unwrap();
    let Artifact::Presigned(url) = artifact else {
        panic!("expected a presigned URL");
    };
    assert_eq!(url, presigned_url);

    let bytes = backend.fetch_presigned(&url).await.unwrap();
    assert_eq!(&bytes[..], b"raw bytes");
    object.assert_async().await;
}

#[tokio::test]
async fn test_health_probe() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/health")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"status": "ok"}"#)
        .create_async()
        .await;

    let backend = BackendClient::new(http(), &server.url()).unwrap();
    assert!(backend.health().await.unwrap());

    let unreachable = BackendClient::new(http(), "http://127.0.0.1:9").unwrap();
    assert!(unreachable.health().await.is_err());
}
