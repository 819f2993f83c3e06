use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

// Export modules
pub mod adapters;
pub mod auth;
pub mod callback_system;
pub mod clock;
pub mod config;
pub mod download;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod redirect;

#[cfg(test)]
mod tests;

pub use adapters::backend::{BackendClient, CollectionKind, Event, Task};
pub use adapters::http_client::{HttpClient, ReqwestHttpClient};
pub use auth::{
    CredentialRenewer, CredentialSnapshot, CredentialStore, IdentityProvider, InitOutcome,
    KeycloakProvider, LoginRedirect, LoginRequest, RenewalHandle, RenewalPolicy, SessionInitializer,
    SessionState,
};
pub use clock::{Clock, SystemClock};
pub use config::{load_config, Config};
pub use download::{ArtifactDownloadGateway, DirectorySink, DownloadOutcome, FilenamePolicy};
pub use error::{DashboardError, DashboardResult, ErrorCode, ErrorSeverity};
pub use events::{DashboardEvent, EventBus, StreamEvent, Subscriber};
pub use orchestrator::{Collection, DataFetchOrchestrator, OrchestratorHandle};

/// What the user should be looking at
#[derive(Debug, Clone)]
pub enum DashboardView {
    Initializing,
    RedirectingToLogin { login_url: Option<String> },
    InitializationFailed { error: DashboardError },
    Ready {
        tasks: Collection<Task>,
        events: Collection<Event>,
    },
}

#[derive(Default)]
struct Running {
    renewal: Option<RenewalHandle>,
    orchestrator: Option<OrchestratorHandle>,
    login_url: Option<String>,
    init_error: Option<DashboardError>,
}

/// A dashboard session: login, renewal, data and downloads wired together
pub struct Dashboard {
    config: Config,
    store: Arc<CredentialStore>,
    events: EventBus,
    provider: Arc<dyn IdentityProvider>,
    backend: BackendClient,
    initializer: SessionInitializer,
    renewer: Arc<CredentialRenewer>,
    orchestrator: Arc<DataFetchOrchestrator>,
    gateway: ArtifactDownloadGateway,
    running: Mutex<Running>,
}

impl Dashboard {
    /// Build a session against Keycloak and the backend over HTTP
    pub fn from_config(
        config: Config,
        redirect: Option<Arc<dyn LoginRedirect>>,
    ) -> DashboardResult<Self> {
        config.validate()?;
        let http: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::with_timeout(config.request_timeout())?);
        let mut provider = KeycloakProvider::new(http.clone());
        if let Some(redirect) = redirect {
            provider = provider.with_redirect(redirect);
        }
        Self::new(config, Arc::new(provider), http, Arc::new(SystemClock))
    }

    pub fn new(
        config: Config,
        provider: Arc<dyn IdentityProvider>,
        http: Arc<dyn HttpClient>,
        clock: Arc<dyn Clock>,
    ) -> DashboardResult<Self> {
        let policy = config.renewal_policy()?;
        let backend = BackendClient::new(http, &config.backend.url)
            .map_err(|e| DashboardError::config("backend.url", format!("{:#}", e)))?;

        let store = Arc::new(CredentialStore::new());
        let events = EventBus::default();

        let initializer = SessionInitializer::new(provider.clone(), store.clone(), events.clone());
        let renewer = Arc::new(CredentialRenewer::new(
            provider.clone(),
            store.clone(),
            events.clone(),
            clock,
            policy,
        ));
        let orchestrator = Arc::new(DataFetchOrchestrator::new(
            backend.clone(),
            store.clone(),
            events.clone(),
        ));
        let gateway = ArtifactDownloadGateway::new(
            backend.clone(),
            store.clone(),
            events.clone(),
            Arc::new(DirectorySink::new(config.download.directory.clone())),
        )
        .with_policy(config.download.filename.clone())
        .with_collections(orchestrator.clone());

        Ok(Self {
            config,
            store,
            events,
            provider,
            backend,
            initializer,
            renewer,
            orchestrator,
            gateway,
            running: Mutex::new(Running::default()),
        })
    }

    fn running(&self) -> std::sync::MutexGuard<'_, Running> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run the login check and, once authenticated, start renewal and data fetching
    pub async fn start(&self) -> DashboardResult<InitOutcome> {
        self.start_with(self.config.login_request()).await
    }

    /// Like [`start`](Self::start), completing a login from the URL the provider redirected to
    pub async fn resume(&self, callback_url: &str) -> DashboardResult<InitOutcome> {
        self.start_with(self.config.login_request().with_callback(callback_url))
            .await
    }

    async fn start_with(&self, request: LoginRequest) -> DashboardResult<InitOutcome> {
        {
            let mut running = self.running();
            if running.orchestrator.is_none() {
                running.orchestrator = Some(self.orchestrator.attach());
            }
        }

        let outcome = match self.initializer.initialize(&request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.running().init_error = Some(e.clone());
                return Err(e);
            }
        };

        match &outcome {
            InitOutcome::Authenticated(_) => {
                let handle = self.renewer.clone().spawn();
                self.running().renewal = Some(handle);
                info!("Dashboard session started");
            }
            InitOutcome::Redirecting { login_url } => {
                self.running().login_url = login_url.clone();
            }
            InitOutcome::AlreadyStarted(state) => debug!(state = %state, "Dashboard already started"),
        }
        Ok(outcome)
    }

    /// The screen to show for the current session state
    pub fn view(&self) -> DashboardView {
        let running = self.running();
        match self.store.state() {
            SessionState::Uninitialized | SessionState::AwaitingAuthentication => {
                match &running.init_error {
                    Some(error) => DashboardView::InitializationFailed {
                        error: error.clone(),
                    },
                    None => DashboardView::Initializing,
                }
            }
            SessionState::Unauthenticated => DashboardView::RedirectingToLogin {
                login_url: running.login_url.clone(),
            },
            SessionState::Authenticated => DashboardView::Ready {
                tasks: self.orchestrator.tasks(),
                events: self.orchestrator.events(),
            },
        }
    }

    pub fn state(&self) -> SessionState {
        self.store.state()
    }

    pub fn tasks(&self) -> Collection<Task> {
        self.orchestrator.tasks()
    }

    pub fn events(&self) -> Collection<Event> {
        self.orchestrator.events()
    }

    /// Download a task's artifact into the configured directory
    pub async fn download(&self, task_id: &str) -> DashboardResult<DownloadOutcome> {
        self.gateway.download(task_id).await
    }

    /// Whether the backend answers its health probe
    pub async fn backend_healthy(&self) -> bool {
        match self.backend.health().await {
            Ok(healthy) => healthy,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Backend health probe failed");
                false
            }
        }
    }

    /// Receive session events
    pub fn subscribe(&self) -> Subscriber<StreamEvent> {
        self.events.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// End the session: stop renewal, drop the credential and return the
    /// provider's logout URL, if it has one
    pub async fn logout(&self) -> DashboardResult<Option<String>> {
        let renewal = self.running().renewal.take();
        if let Some(handle) = renewal {
            handle.stop().await;
        }

        let snapshot = self.store.snapshot();
        let logout_url = self.provider.logout_url(
            snapshot.credential().map(|c| &**c),
            &self.config.identity.redirect_uri,
        );

        if snapshot.state() == SessionState::Authenticated {
            self.store.mark_unauthenticated()?;
            self.events.publish(DashboardEvent::SessionStateChanged {
                from: SessionState::Authenticated,
                to: SessionState::Unauthenticated,
            });
            info!("Logged out");
        }
        Ok(logout_url)
    }

    /// Stop background work without touching the credential
    pub async fn shutdown(&self) {
        let (renewal, orchestrator) = {
            let mut running = self.running();
            (running.renewal.take(), running.orchestrator.take())
        };
        if let Some(handle) = renewal {
            handle.stop().await;
        }
        if let Some(handle) = orchestrator {
            handle.detach();
        }
        debug!("Dashboard background tasks stopped");
    }
}
