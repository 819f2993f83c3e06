use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::auth::token::Credential;

pub mod keycloak;

pub use keycloak::KeycloakProvider;

/// Parameters of the redirect-based login check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    /// Base URL of the identity provider
    pub endpoint: String,
    pub realm: String,
    pub client_id: String,
    /// Space separated scopes
    pub scope: String,
    /// Where the provider sends the browser back to
    pub redirect_uri: String,
    /// URL the browser landed on when resuming a login, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

impl LoginRequest {
    /// Resume a login from the URL the provider redirected to
    pub fn with_callback(mut self, callback_url: impl Into<String>) -> Self {
        self.callback_url = Some(callback_url.into());
        self
    }
}

/// Result of a login check
#[derive(Debug, Clone)]
pub enum LoginOutcome {
    Authenticated(Credential),
    /// The user has no session; `login_url` is where to send them
    NotAuthenticated { login_url: Option<String> },
}

/// Result of a renewal request
#[derive(Debug, Clone)]
pub enum RenewOutcome {
    /// A fresh credential replacing the current one
    Renewed(Credential),
    /// The current credential is still valid for the requested window
    Unchanged,
}

/// External identity provider
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Get the provider name
    fn name(&self) -> &str;

    /// Perform the login check. Errors mean the provider could not be
    /// reached or answered nonsense; an absent session is not an error.
    async fn check_login(&self, request: &LoginRequest) -> Result<LoginOutcome>;

    /// Renew `current` if it expires within `min_validity`
    async fn renew(&self, current: &Credential, min_validity: chrono::Duration) -> Result<RenewOutcome>;

    /// URL that ends the provider-side session
    fn logout_url(&self, _credential: Option<&Credential>, _redirect_uri: &str) -> Option<String> {
        None
    }
}

/// Sends the user to the provider's login page and captures the redirect back.
///
/// Returns the full callback URL, or `None` when the user never came back.
#[async_trait]
pub trait LoginRedirect: Send + Sync {
    async fn redirect(&self, login_url: &str) -> Result<Option<String>>;
}
