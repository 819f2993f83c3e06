//! One-time login handshake populating the credential store

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::auth::providers::{IdentityProvider, LoginOutcome, LoginRequest};
use crate::auth::store::{CredentialSnapshot, CredentialStore};
use crate::auth::token::SessionState;
use crate::error::{DashboardError, DashboardResult};
use crate::events::{DashboardEvent, EventBus};

/// What the login handshake produced
#[derive(Debug, Clone)]
pub enum InitOutcome {
    /// The store now holds the initial credential
    Authenticated(CredentialSnapshot),
    /// The user must be sent to the login page
    Redirecting { login_url: Option<String> },
    /// The handshake already ran; this is the state it left behind
    AlreadyStarted(SessionState),
}

impl InitOutcome {
    /// Treat a pending redirect as [`DashboardError::AuthenticationAbsent`]
    pub fn into_result(self) -> DashboardResult<Self> {
        match self {
            InitOutcome::Redirecting { login_url } => {
                Err(DashboardError::AuthenticationAbsent { login_url })
            }
            other => Ok(other),
        }
    }
}

/// Runs the provider login check once per session
pub struct SessionInitializer {
    provider: Arc<dyn IdentityProvider>,
    store: Arc<CredentialStore>,
    events: EventBus,
    started: AtomicBool,
}

impl SessionInitializer {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        store: Arc<CredentialStore>,
        events: EventBus,
    ) -> Self {
        Self {
            provider,
            store,
            events,
            started: AtomicBool::new(false),
        }
    }

    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Perform the login check.
    ///
    /// Only the first call contacts the provider. Provider failures leave
    /// the session in AwaitingAuthentication and return
    /// [`DashboardError::Initialization`].
    pub async fn initialize(&self, request: &LoginRequest) -> DashboardResult<InitOutcome> {
        if self.started.swap(true, Ordering::SeqCst) {
            let state = self.store.state();
            warn!(state = %state, "Session initializer already ran");
            return Ok(InitOutcome::AlreadyStarted(state));
        }

        let begun = self.store.begin_authentication()?;
        self.publish_transition(SessionState::Uninitialized, begun.state());

        info!(
            provider = self.provider.name(),
            realm = %request.realm,
            client_id = %request.client_id,
            "Checking login with identity provider"
        );

        let outcome = match self.provider.check_login(request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(provider = self.provider.name(), error = %format!("{:#}", e), "Identity provider initialization failed");
                let err = DashboardError::Initialization(format!("{:#}", e));
                self.events.publish(DashboardEvent::InitializationFailed {
                    error: err.to_string(),
                });
                return Err(err);
            }
        };

        match outcome {
            LoginOutcome::Authenticated(credential) => {
                let snapshot = self.store.set_credential(credential)?;
                self.publish_transition(begun.state(), snapshot.state());
                info!(generation = snapshot.generation(), "Session authenticated");
                Ok(InitOutcome::Authenticated(snapshot))
            }
            LoginOutcome::NotAuthenticated { login_url } => {
                let snapshot = self.store.mark_unauthenticated()?;
                self.publish_transition(begun.state(), snapshot.state());
                self.events.publish(DashboardEvent::LoginRequired {
                    login_url: login_url.clone(),
                });
                warn!(login_url = ?login_url, "Not authenticated, redirecting to login");
                Ok(InitOutcome::Redirecting { login_url })
            }
        }
    }

    fn publish_transition(&self, from: SessionState, to: SessionState) {
        self.events
            .publish(DashboardEvent::SessionStateChanged { from, to });
    }
}
