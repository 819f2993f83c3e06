use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::support::{
    http, state_of, token_body, token_path, ApprovingRedirect, CLIENT_ID, REALM, REDIRECT_URI,
};
use tier1_dashboard::{
    Config, Dashboard, DashboardView, DownloadOutcome, FilenamePolicy, InitOutcome, KeycloakProvider,
    LoginRedirect, SessionState, SystemClock,
};

fn config(server_url: &str, downloads: &Path) -> Config {
    let mut config = Config::default();
    config.identity.url = server_url.to_string();
    config.identity.realm = REALM.to_string();
    config.identity.client_id = CLIENT_ID.to_string();
    config.identity.redirect_uri = REDIRECT_URI.to_string();
    config.backend.url = server_url.to_string();
    config.download.directory = downloads.to_path_buf();
    config.download.filename = FilenamePolicy::TaskFilename;
    config
}

fn dashboard(config: Config, redirect: Arc<dyn LoginRedirect>) -> Dashboard {
    let provider = KeycloakProvider::new(http()).with_redirect(redirect);
    Dashboard::new(config, Arc::new(provider), http(), Arc::new(SystemClock)).unwrap()
}

async fn wait_for_data(dashboard: &Dashboard) {
    for _ in 0..200 {
        if dashboard.tasks().updated_at().is_some() && dashboard.events().updated_at().is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("collections were never fetched");
}

#[tokio::test]
async fn test_full_session_against_mock_servers() {
    let mut server = mockito::Server::new_async().await;
    let downloads = tempfile::tempdir().unwrap();

    server
        .mock("POST", token_path().as_str())
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(token_body("access-1", Some("refresh-1"), 300))
        .create_async()
        .await;
    let tasks = server
        .mock("GET", "/tasks")
        .match_header("authorization", "Bearer access-1")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"[{"id": "t1", "name": "run 42", "filename": "run42.root", "size": 9, "timestamp": "2025-01-01T00:00:00Z"}]"#)
        .expect(1)
        .create_async()
        .await;
    server
        .mock("GET", "/events")
        .match_header("authorization", "Bearer access-1")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body("null")
        .create_async()
        .await;
    server
        .mock("GET", "/data/t1")
        .match_header("authorization", "Bearer access-1")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(serde_json::json!({ "url": format!("{}/bucket/run42", server.url()) }).to_string())
        .create_async()
        .await;
    server
        .mock("GET", "/bucket/run42")
        .with_status(200)
        .with_body("raw bytes")
        .create_async()
        .await;

    let dashboard = dashboard(
        config(&server.url(), downloads.path()),
        Arc::new(ApprovingRedirect::new("code-1")),
    );

    let outcome = dashboard.start().await.unwrap();
    assert!(matches!(outcome, InitOutcome::Authenticated(_)));

    wait_for_data(&dashboard).await;
    match dashboard.view() {
        DashboardView::Ready { tasks, events } => {
            assert_eq!(tasks.len(), 1);
            assert!(events.is_empty());
        }
        other => panic!("expected ready view, got {:?}", other),
    }
    tasks.assert_async().await;

    // Named after the task's filename, taken from the fetched collection
    match dashboard.download("t1").await.unwrap() {
        DownloadOutcome::Delivered { path, bytes, .. } => {
            assert_eq!(path, downloads.path().join("run42.root"));
            assert_eq!(bytes, 9);
            assert_eq!(tokio::fs::read(&path).await.unwrap(), b"raw bytes");
        }
        other => panic!("expected delivery, got {:?}", other),
    }

    let logout_url = dashboard.logout().await.unwrap().unwrap();
    assert!(logout_url.contains("id_token_hint=id-access-1"));
    assert_eq!(dashboard.state(), SessionState::Unauthenticated);

    dashboard.shutdown().await;
}

/// Browser that comes back with Keycloak's "no session" answer
struct NoSessionRedirect;

#[async_trait]
impl LoginRedirect for NoSessionRedirect {
    async fn redirect(&self, login_url: &str) -> Result<Option<String>> {
        Ok(Some(format!(
            "{}?error=login_required&state={}",
            REDIRECT_URI,
            state_of(login_url)?
        )))
    }
}

#[tokio::test]
async fn test_no_session_sends_user_to_login_without_fetching() {
    let mut server = mockito::Server::new_async().await;
    let downloads = tempfile::tempdir().unwrap();

    let token = server
        .mock("POST", token_path().as_str())
        .expect(0)
        .create_async()
        .await;
    let tasks = server.mock("GET", "/tasks").expect(0).create_async().await;
    let data = server.mock("GET", "/data/t1").expect(0).create_async().await;

    let dashboard = dashboard(config(&server.url(), downloads.path()), Arc::new(NoSessionRedirect));

    match dashboard.start().await.unwrap() {
        InitOutcome::Redirecting { login_url } => {
            let login_url = login_url.unwrap();
            assert!(login_url.starts_with(&server.url()));
            assert!(login_url.contains("client_id=tier1-frontend"));
        }
        other => panic!("expected redirect, got {:?}", other),
    }
    assert!(matches!(
        dashboard.view(),
        DashboardView::RedirectingToLogin { login_url: Some(_) }
    ));
    assert_eq!(
        dashboard.download("t1").await.unwrap(),
        DownloadOutcome::Skipped
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    token.assert_async().await;
    tasks.assert_async().await;
    data.assert_async().await;

    dashboard.shutdown().await;
}
