use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bearer credential issued by the identity provider.
///
/// A credential is immutable: renewal produces a new value which replaces
/// the old one in the [`CredentialStore`](super::store::CredentialStore).
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    access_token: String,
    refresh_token: Option<String>,
    id_token: Option<String>,
    expires_at: DateTime<Utc>,
    issued_at: DateTime<Utc>,
    #[serde(default)]
    scope: Vec<String>,
}

impl Credential {
    /// Create a credential valid until `expires_at`
    pub fn new(
        access_token: impl Into<String>,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            id_token: None,
            expires_at,
            issued_at,
            scope: Vec::new(),
        }
    }

    /// Create a credential that lives for `lifetime` starting at `issued_at`
    pub fn with_lifetime(
        access_token: impl Into<String>,
        issued_at: DateTime<Utc>,
        lifetime: Duration,
    ) -> Self {
        Self::new(access_token, issued_at, issued_at + lifetime)
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_id_token(mut self, id_token: impl Into<String>) -> Self {
        self.id_token = Some(id_token.into());
        self
    }

    pub fn with_scope(mut self, scope: Vec<String>) -> Self {
        self.scope = scope;
        self
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    pub fn id_token(&self) -> Option<&str> {
        self.id_token.as_deref()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn scope(&self) -> &[String] {
        &self.scope
    }

    /// Remaining lifetime at `now` (negative once expired)
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at - now
    }

    /// Check if the token is expired
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Check if fewer than `threshold` of validity remain
    pub fn expires_within(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        self.remaining(now) < threshold
    }

    /// Whether two credentials carry the same bearer token
    pub fn same_token(&self, other: &Credential) -> bool {
        self.access_token == other.access_token
    }

    /// Short, log-safe prefix of the access token
    pub fn preview(&self) -> String {
        token_preview(&self.access_token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &self.preview())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Get a preview of a token (first 8 chars + ...)
pub fn token_preview(token: &str) -> String {
    match token.char_indices().nth(8) {
        Some((idx, _)) if token.len() > 12 => format!("{}...", &token[..idx]),
        _ => token.to_string(),
    }
}

/// Coarse lifecycle stage of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Nothing has happened yet
    Uninitialized,
    /// The login handshake is in progress
    AwaitingAuthentication,
    /// A live credential is held
    Authenticated,
    /// No credential; the user has to (re)authenticate
    Unauthenticated,
}

impl SessionState {
    /// Transitions only flow forward; renewal keeps Authenticated, and an
    /// authenticated session may end.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Uninitialized, AwaitingAuthentication)
                | (AwaitingAuthentication, Authenticated)
                | (AwaitingAuthentication, Unauthenticated)
                | (Authenticated, Authenticated)
                | (Authenticated, Unauthenticated)
        )
    }

    pub fn is_authenticated(self) -> bool {
        self == SessionState::Authenticated
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::AwaitingAuthentication => "awaiting_authentication",
            SessionState::Authenticated => "authenticated",
            SessionState::Unauthenticated => "unauthenticated",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authorization header value bound to one credential generation.
///
/// Only the credential store hands these out, and only while the session is
/// authenticated, so holding one is proof that a request may be issued.
#[derive(Clone)]
pub struct Authorization {
    header_value: String,
    generation: u64,
}

impl Authorization {
    pub(crate) fn new(credential: &Credential, generation: u64) -> Self {
        Self {
            header_value: format!("Bearer {}", credential.access_token()),
            generation,
        }
    }

    /// Value for the `Authorization` header
    pub fn header_value(&self) -> &str {
        &self.header_value
    }

    /// Credential generation this authorization was minted from
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Debug for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authorization")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}
