//! Single-writer holder of the live credential.
//!
//! The credential, the session state and the version counters live in one
//! [`CredentialSnapshot`] which is swapped as a whole under a short write
//! lock. Listeners are then notified inline, before the write call returns.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info};

use crate::auth::token::{Authorization, Credential, SessionState};
use crate::callback_system::{CallbackId, CallbackRegistry};
use crate::error::{DashboardError, DashboardResult};

/// Immutable view of the store at one version
#[derive(Debug, Clone)]
pub struct CredentialSnapshot {
    state: SessionState,
    credential: Option<Arc<Credential>>,
    /// Bumped on every write
    version: u64,
    /// Bumped whenever the bearer token changes or is cleared
    generation: u64,
    token_changed: bool,
}

impl CredentialSnapshot {
    fn initial() -> Self {
        Self {
            state: SessionState::Uninitialized,
            credential: None,
            version: 0,
            generation: 0,
            token_changed: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn credential(&self) -> Option<&Arc<Credential>> {
        self.credential.as_ref()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether this write replaced the bearer token
    pub fn token_changed(&self) -> bool {
        self.token_changed
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.is_authenticated() && self.credential.is_some()
    }

    /// Authorization for backend requests, only while authenticated
    pub fn authorization(&self) -> Option<Authorization> {
        match (&self.credential, self.state) {
            (Some(credential), SessionState::Authenticated) => {
                Some(Authorization::new(credential, self.generation))
            }
            _ => None,
        }
    }
}

/// Holder of the current credential
pub struct CredentialStore {
    current: RwLock<CredentialSnapshot>,
    listeners: CallbackRegistry<CredentialSnapshot>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(CredentialSnapshot::initial()),
            listeners: CallbackRegistry::with_group("credential_store"),
        }
    }

    /// Current snapshot
    pub fn snapshot(&self) -> CredentialSnapshot {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> SessionState {
        self.snapshot().state
    }

    pub fn generation(&self) -> u64 {
        self.snapshot().generation
    }

    pub fn authorization(&self) -> Option<Authorization> {
        self.snapshot().authorization()
    }

    /// Enter AwaitingAuthentication; only valid from Uninitialized
    pub fn begin_authentication(&self) -> DashboardResult<CredentialSnapshot> {
        self.apply(SessionState::AwaitingAuthentication, |prev| {
            prev.credential.clone()
        })
    }

    /// Install a credential and mark the session authenticated
    pub fn set_credential(&self, credential: Credential) -> DashboardResult<CredentialSnapshot> {
        let credential = Arc::new(credential);
        self.apply(SessionState::Authenticated, move |_| Some(credential))
    }

    /// Drop the credential and mark the session unauthenticated
    pub fn mark_unauthenticated(&self) -> DashboardResult<CredentialSnapshot> {
        self.apply(SessionState::Unauthenticated, |_| None)
    }

    /// Register a listener called with every new snapshot
    pub fn subscribe<F>(&self, listener: F) -> CallbackId
    where
        F: Fn(CredentialSnapshot) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.listeners.register(listener)
    }

    pub fn unsubscribe(&self, id: CallbackId) -> bool {
        self.listeners.unregister(id)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.count()
    }

    fn apply<F>(&self, next_state: SessionState, next_credential: F) -> DashboardResult<CredentialSnapshot>
    where
        F: FnOnce(&CredentialSnapshot) -> Option<Arc<Credential>>,
    {
        let snapshot = {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            if !current.state.can_transition_to(next_state) {
                return Err(DashboardError::InvalidTransition {
                    from: current.state,
                    to: next_state,
                });
            }

            let credential = next_credential(&current);
            let token_changed = match (&current.credential, &credential) {
                (Some(old), Some(new)) => !old.same_token(new),
                (None, None) => false,
                _ => true,
            };

            let snapshot = CredentialSnapshot {
                state: next_state,
                credential,
                version: current.version + 1,
                generation: current.generation + u64::from(token_changed),
                token_changed,
            };
            *current = snapshot.clone();
            snapshot
        };

        if snapshot.token_changed {
            info!(
                state = %snapshot.state,
                version = snapshot.version,
                generation = snapshot.generation,
                token = %snapshot.credential.as_ref().map(|c| c.preview()).unwrap_or_default(),
                "Credential replaced"
            );
        } else {
            debug!(state = %snapshot.state, version = snapshot.version, "Credential store updated");
        }

        // Lock released: listeners may read the store.
        self.listeners.trigger(snapshot.clone());
        Ok(snapshot)
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}
