use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use reqwest::Url;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::adapters::http_client::HttpClient;
use crate::auth::pkce::{generate_nonce, generate_state, PkcePair};
use crate::auth::providers::{
    IdentityProvider, LoginOutcome, LoginRedirect, LoginRequest, RenewOutcome,
};
use crate::auth::token::Credential;
use crate::clock::{Clock, SystemClock};

/// Pending logins older than this are discarded
const PENDING_LOGIN_TTL_MINUTES: i64 = 10;

/// Provider errors that mean "no session" rather than failure
const NO_SESSION_ERRORS: &[&str] = &["login_required", "interaction_required"];

// Response type for token requests
#[derive(Debug, Clone, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

// Error response from the token endpoint
#[derive(Debug, Clone, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// OpenID Connect endpoints of one realm
#[derive(Debug, Clone, PartialEq, Eq)]
struct RealmEndpoints {
    authorize: Url,
    token: Url,
    logout: Url,
}

impl RealmEndpoints {
    fn new(endpoint: &str, realm: &str) -> Result<Self> {
        let base = Url::parse(endpoint)
            .with_context(|| format!("invalid identity provider URL '{}'", endpoint))?;
        let build = |leaf: &str| -> Result<Url> {
            let mut url = base.clone();
            url.path_segments_mut()
                .map_err(|_| anyhow!("identity provider URL '{}' cannot be a base", endpoint))?
                .pop_if_empty()
                .extend(["realms", realm, "protocol", "openid-connect", leaf]);
            Ok(url)
        };
        Ok(Self {
            authorize: build("auth")?,
            token: build("token")?,
            logout: build("logout")?,
        })
    }
}

/// Client the session logged in with, reused for renewal and logout
#[derive(Debug, Clone)]
struct ActiveClient {
    endpoints: RealmEndpoints,
    client_id: String,
}

// A login waiting for the provider's redirect
#[derive(Debug, Clone)]
struct PendingLogin {
    code_verifier: String,
    redirect_uri: String,
    endpoints: RealmEndpoints,
    client_id: String,
    created_at: DateTime<Utc>,
}

/// Parameters the provider put on the redirect URI
#[derive(Debug, Default)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

impl CallbackParams {
    /// Read from the query, or the fragment for `response_mode=fragment`
    fn parse(callback_url: &str) -> Result<Self> {
        let url = Url::parse(callback_url).context("invalid callback URL")?;
        let mut params = Self::default();
        let pairs = url
            .query_pairs()
            .into_owned()
            .chain(
                url.fragment()
                    .map(|f| serde_urlencoded::from_str::<Vec<(String, String)>>(f))
                    .transpose()
                    .context("invalid callback fragment")?
                    .unwrap_or_default(),
            )
            .collect::<Vec<_>>();
        for (key, value) in pairs {
            match key.as_str() {
                "code" => params.code = Some(value),
                "state" => params.state = Some(value),
                "error" => params.error = Some(value),
                "error_description" => params.error_description = Some(value),
                _ => {}
            }
        }
        Ok(params)
    }

    fn is_empty(&self) -> bool {
        self.code.is_none() && self.error.is_none()
    }
}

/// Keycloak (OpenID Connect) provider using the authorization code flow with PKCE
pub struct KeycloakProvider {
    http: Arc<dyn HttpClient>,
    clock: Arc<dyn Clock>,
    redirect: Option<Arc<dyn LoginRedirect>>,
    pending: DashMap<String, PendingLogin>,
    active: RwLock<Option<ActiveClient>>,
}

impl KeycloakProvider {
    pub fn new(http: Arc<dyn HttpClient>) -> Self {
        Self {
            http,
            clock: Arc::new(SystemClock),
            redirect: None,
            pending: DashMap::new(),
            active: RwLock::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Complete logins in one call by driving the user through `redirect`.
    ///
    /// Without it the login check only reports the login URL.
    pub fn with_redirect(mut self, redirect: Arc<dyn LoginRedirect>) -> Self {
        self.redirect = Some(redirect);
        self
    }

    /// Build a login URL and remember its PKCE verifier under a fresh state
    pub fn login_url(&self, request: &LoginRequest) -> Result<String> {
        let endpoints = RealmEndpoints::new(&request.endpoint, &request.realm)?;
        let pkce = PkcePair::generate();
        let state = generate_state();
        let nonce = generate_nonce();

        let mut url = endpoints.authorize.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &request.client_id)
            .append_pair("redirect_uri", &request.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &request.scope)
            .append_pair("state", &state)
            .append_pair("nonce", &nonce)
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("code_challenge_method", "S256");

        self.prune_pending();
        self.pending.insert(
            state,
            PendingLogin {
                code_verifier: pkce.verifier,
                redirect_uri: request.redirect_uri.clone(),
                endpoints,
                client_id: request.client_id.clone(),
                created_at: self.clock.now(),
            },
        );

        Ok(url.into())
    }

    /// Number of logins waiting for a redirect
    pub fn pending_logins(&self) -> usize {
        self.pending.len()
    }

    fn prune_pending(&self) {
        let cutoff = self.clock.now() - Duration::minutes(PENDING_LOGIN_TTL_MINUTES);
        self.pending.retain(|_, login| login.created_at > cutoff);
    }

    fn active_client(&self) -> Option<ActiveClient> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn complete_login(
        &self,
        request: &LoginRequest,
        callback_url: &str,
    ) -> Result<Option<LoginOutcome>> {
        let params = CallbackParams::parse(callback_url)?;
        if params.is_empty() {
            return Ok(None);
        }

        // Consume the pending login whatever the outcome
        let pending = params
            .state
            .as_deref()
            .and_then(|state| self.pending.remove(state))
            .map(|(_, login)| login);

        if let Some(error) = params.error {
            if NO_SESSION_ERRORS.contains(&error.as_str()) {
                debug!(error = %error, "Provider reports no active session");
                return Ok(Some(LoginOutcome::NotAuthenticated {
                    login_url: Some(self.login_url(request)?),
                }));
            }
            bail!(
                "provider returned error '{}': {}",
                error,
                params.error_description.unwrap_or_default()
            );
        }

        let code = params.code.ok_or_else(|| anyhow!("callback carries no code"))?;
        let pending =
            pending.ok_or_else(|| anyhow!("callback state does not match any pending login"))?;

        let form = [
            ("grant_type", "authorization_code"),
            ("client_id", pending.client_id.as_str()),
            ("code", code.as_str()),
            ("redirect_uri", pending.redirect_uri.as_str()),
            ("code_verifier", pending.code_verifier.as_str()),
        ];
        let credential = self
            .token_request(&pending.endpoints.token, &form, None)
            .await
            .context("authorization code exchange failed")?;

        *self.active.write().unwrap_or_else(PoisonError::into_inner) = Some(ActiveClient {
            endpoints: pending.endpoints,
            client_id: pending.client_id,
        });

        info!(
            provider = self.name(),
            token = %credential.preview(),
            expires_at = %credential.expires_at(),
            "Login completed"
        );
        Ok(Some(LoginOutcome::Authenticated(credential)))
    }

    async fn token_request(
        &self,
        token_url: &Url,
        form: &[(&str, &str)],
        previous_refresh_token: Option<&str>,
    ) -> Result<Credential> {
        let body = serde_urlencoded::to_string(form)?;
        let mut headers = HashMap::new();
        headers.insert(
            http::header::CONTENT_TYPE.as_str().to_string(),
            "application/x-www-form-urlencoded".to_string(),
        );
        headers.insert(http::header::ACCEPT.as_str().to_string(), "application/json".to_string());

        let response = self
            .http
            .post(token_url.as_str(), headers, body)
            .await
            .context("token endpoint unreachable")?;

        if !response.is_success() {
            let status = response.status();
            return match response.json::<ErrorResponse>() {
                Ok(err) => Err(anyhow!(
                    "token endpoint returned HTTP {}: {} {}",
                    status,
                    err.error,
                    err.error_description.unwrap_or_default()
                )),
                Err(_) => Err(anyhow!(
                    "token endpoint returned HTTP {}: {}",
                    status,
                    response.text()
                )),
            };
        }

        let token: TokenResponse = response
            .json()
            .context("failed to parse token response")?;

        let mut credential = Credential::with_lifetime(
            token.access_token,
            self.clock.now(),
            Duration::seconds(token.expires_in),
        );
        // Keycloak may omit the refresh token on refresh; keep the old one
        if let Some(refresh) = token.refresh_token.as_deref().or(previous_refresh_token) {
            credential = credential.with_refresh_token(refresh);
        }
        if let Some(id_token) = token.id_token {
            credential = credential.with_id_token(id_token);
        }
        if let Some(scope) = token.scope {
            credential = credential.with_scope(scope.split_whitespace().map(String::from).collect());
        }
        Ok(credential)
    }
}

#[async_trait]
impl IdentityProvider for KeycloakProvider {
    fn name(&self) -> &str {
        "keycloak"
    }

    async fn check_login(&self, request: &LoginRequest) -> Result<LoginOutcome> {
        if let Some(callback_url) = &request.callback_url {
            if let Some(outcome) = self.complete_login(request, callback_url).await? {
                return Ok(outcome);
            }
        }

        let login_url = self.login_url(request)?;
        let Some(redirect) = &self.redirect else {
            return Ok(LoginOutcome::NotAuthenticated {
                login_url: Some(login_url),
            });
        };

        debug!("Sending user to the login page");
        match redirect.redirect(&login_url).await? {
            Some(callback_url) => self
                .complete_login(request, &callback_url)
                .await?
                .ok_or_else(|| anyhow!("redirect carried neither code nor error")),
            None => {
                warn!("Login redirect was not completed");
                Ok(LoginOutcome::NotAuthenticated {
                    login_url: Some(login_url),
                })
            }
        }
    }

    async fn renew(&self, current: &Credential, min_validity: Duration) -> Result<RenewOutcome> {
        if !current.expires_within(min_validity, self.clock.now()) {
            return Ok(RenewOutcome::Unchanged);
        }

        let client = self
            .active_client()
            .ok_or_else(|| anyhow!("no login has completed against this provider"))?;
        let refresh_token = current
            .refresh_token()
            .ok_or_else(|| anyhow!("credential carries no refresh token"))?;

        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", client.client_id.as_str()),
            ("refresh_token", refresh_token),
        ];
        let credential = self
            .token_request(&client.endpoints.token, &form, Some(refresh_token))
            .await
            .context("refresh token grant failed")?;

        debug!(token = %credential.preview(), "Credential renewed by provider");
        Ok(RenewOutcome::Renewed(credential))
    }

    fn logout_url(&self, credential: Option<&Credential>, redirect_uri: &str) -> Option<String> {
        let client = self.active_client()?;
        let mut url = client.endpoints.logout;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", &client.client_id)
                .append_pair("post_logout_redirect_uri", redirect_uri);
            if let Some(id_token) = credential.and_then(Credential::id_token) {
                query.append_pair("id_token_hint", id_token);
            }
        }
        Some(url.into())
    }
}
