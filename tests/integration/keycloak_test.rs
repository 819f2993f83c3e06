use std::sync::Arc;

use chrono::Duration;
use mockito::Matcher;

use crate::support::{
    http, login_request, state_of, token_body, token_path, ApprovingRedirect, CLIENT_ID, REDIRECT_URI,
};
use tier1_dashboard::auth::{LoginOutcome, RenewOutcome};
use tier1_dashboard::{IdentityProvider, KeycloakProvider};

#[tokio::test]
async fn test_code_exchange_then_refresh() {
    let mut server = mockito::Server::new_async().await;

    let exchange = server
        .mock("POST", token_path().as_str())
        .match_header("content-type", "application/x-www-form-urlencoded")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
            Matcher::UrlEncoded("client_id".into(), CLIENT_ID.into()),
            Matcher::UrlEncoded("code".into(), "code-1".into()),
            Matcher::UrlEncoded("redirect_uri".into(), REDIRECT_URI.into()),
            Matcher::Regex("code_verifier=".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(token_body("access-1", Some("refresh-1"), 300))
        .expect(1)
        .create_async()
        .await;

    let redirect = Arc::new(ApprovingRedirect::new("code-1"));
    let provider = KeycloakProvider::new(http()).with_redirect(redirect.clone());

    let credential = match provider.check_login(&login_request(&server.url())).await.unwrap() {
        LoginOutcome::Authenticated(credential) => credential,
        other => panic!("expected a credential, got {:?}", other),
    };
    exchange.assert_async().await;
    assert_eq!(credential.access_token(), "access-1");
    assert_eq!(credential.refresh_token(), Some("refresh-1"));
    assert_eq!(redirect.seen.lock().unwrap().len(), 1);
    assert_eq!(provider.pending_logins(), 0);

    // Keycloak leaves the refresh token out when it is not rotated
    let refresh = server
        .mock("POST", token_path().as_str())
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
            Matcher::UrlEncoded("refresh_token".into(), "refresh-1".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(token_body("access-2", None, 300))
        .expect(1)
        .create_async()
        .await;

    // Asking for more validity than the token has left forces a refresh
    match provider.renew(&credential, Duration::seconds(600)).await.unwrap() {
        RenewOutcome::Renewed(renewed) => {
            assert_eq!(renewed.access_token(), "access-2");
            assert_eq!(renewed.refresh_token(), Some("refresh-1"));
        }
        RenewOutcome::Unchanged => panic!("expected a renewed credential"),
    }
    refresh.assert_async().await;
}

#[tokio::test]
async fn test_renew_leaves_fresh_credential_alone() {
    let mut server = mockito::Server::new_async().await;
    let token = server
        .mock("POST", token_path().as_str())
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(token_body("access-1", Some("refresh-1"), 300))
        .expect(1)
        .create_async()
        .await;

    let provider =
        KeycloakProvider::new(http()).with_redirect(Arc::new(ApprovingRedirect::new("code-1")));
    let LoginOutcome::Authenticated(credential) =
        provider.check_login(&login_request(&server.url())).await.unwrap()
    else {
        panic!("login should succeed");
    };

    let outcome = provider.renew(&credential, Duration::seconds(30)).await.unwrap();
    assert!(matches!(outcome, RenewOutcome::Unchanged));
    // Only the code exchange reached the server
    token.assert_async().await;
}

#[tokio::test]
async fn test_rejected_code_fails_login() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", token_path().as_str())
        .with_status(400)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error":"invalid_grant","error_description":"Code not valid"}"#)
        .create_async()
        .await;

    let provider =
        KeycloakProvider::new(http()).with_redirect(Arc::new(ApprovingRedirect::new("stale")));
    let err = provider
        .check_login(&login_request(&server.url()))
        .await
        .unwrap_err();
    let message = format!("{:#}", err);
    assert!(message.contains("invalid_grant"), "{}", message);
}

#[tokio::test]
async fn test_resume_from_callback_url_without_redirect() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", token_path().as_str())
        .match_body(Matcher::UrlEncoded("code".into(), "code-9".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(token_body("access-9", Some("refresh-9"), 60))
        .create_async()
        .await;

    let provider = KeycloakProvider::new(http());
    let request = login_request(&server.url());

    let login_url = match provider.check_login(&request).await.unwrap() {
        LoginOutcome::NotAuthenticated { login_url } => login_url.unwrap(),
        other => panic!("expected a login URL, got {:?}", other),
    };
    assert!(login_url.starts_with(&server.url()));
    assert!(login_url.contains("code_challenge_method=S256"));

    let callback = format!(
        "{}?state={}&code=code-9",
        REDIRECT_URI,
        state_of(&login_url).unwrap()
    );
    match provider.check_login(&request.with_callback(callback)).await.unwrap() {
        LoginOutcome::Authenticated(credential) => {
            assert_eq!(credential.access_token(), "access-9")
        }
        other => panic!("expected a credential, got {:?}", other),
    }

    let logout = provider
        .logout_url(None, REDIRECT_URI)
        .expect("logout URL after login");
    assert!(logout.contains("/realms/nica/protocol/openid-connect/logout"));
    assert!(logout.contains("client_id=tier1-frontend"));
}
