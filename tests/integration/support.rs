//! Shared fixtures for the integration tests

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Url;

use tier1_dashboard::auth::{Authorization, Credential};
use tier1_dashboard::{CredentialStore, HttpClient, LoginRedirect, LoginRequest, ReqwestHttpClient};

pub const REALM: &str = "nica";
pub const CLIENT_ID: &str = "tier1-frontend";
pub const REDIRECT_URI: &str = "http://localhost:3000/";

pub fn token_path() -> String {
    format!("/realms/{}/protocol/openid-connect/token", REALM)
}

pub fn http() -> Arc<dyn HttpClient> {
    Arc::new(ReqwestHttpClient::new())
}

pub fn login_request(endpoint: &str) -> LoginRequest {
    LoginRequest {
        endpoint: endpoint.to_string(),
        realm: REALM.to_string(),
        client_id: CLIENT_ID.to_string(),
        scope: "openid".to_string(),
        redirect_uri: REDIRECT_URI.to_string(),
        callback_url: None,
    }
}

pub fn token_body(access: &str, refresh: Option<&str>, expires_in: i64) -> String {
    let mut body = serde_json::json!({
        "access_token": access,
        "expires_in": expires_in,
        "id_token": format!("id-{}", access),
        "token_type": "Bearer",
        "scope": "openid profile",
    });
    if let Some(refresh) = refresh {
        body["refresh_token"] = serde_json::json!(refresh);
    }
    body.to_string()
}

pub fn state_of(login_url: &str) -> Result<String> {
    Url::parse(login_url)?
        .query_pairs()
        .find(|(key, _)| key == "state")
        .map(|(_, value)| value.into_owned())
        .ok_or_else(|| anyhow!("login URL carries no state"))
}

/// An `Authorization` for `token`, minted the only way there is: through a store
pub fn authorization(token: &str) -> Authorization {
    let store = CredentialStore::new();
    store.begin_authentication().unwrap();
    store
        .set_credential(Credential::with_lifetime(
            token,
            Utc::now(),
            chrono::Duration::seconds(300),
        ))
        .unwrap();
    store.authorization().unwrap()
}

/// Plays the browser: approves every login with a fixed code
pub struct ApprovingRedirect {
    pub code: String,
    pub seen: Mutex<Vec<String>>,
}

impl ApprovingRedirect {
    pub fn new(code: &str) -> Self {
        Self {
            code: code.to_string(),
            seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl LoginRedirect for ApprovingRedirect {
    async fn redirect(&self, login_url: &str) -> Result<Option<String>> {
        self.seen.lock().unwrap().push(login_url.to_string());
        Ok(Some(format!(
            "{}?state={}&session_state=abc&code={}",
            REDIRECT_URI,
            state_of(login_url)?,
            self.code
        )))
    }
}
