//! Refreshes the task and event collections whenever the credential changes

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::adapters::backend::{BackendClient, CollectionKind, Event, Task};
use crate::auth::store::{CredentialSnapshot, CredentialStore};
use crate::callback_system::CallbackId;
use crate::error::DashboardError;
use crate::events::{DashboardEvent, EventBus};

/// One collection as last fetched
#[derive(Debug, Clone)]
pub struct Collection<T> {
    items: Arc<Vec<T>>,
    /// Credential generation the items were fetched under
    generation: u64,
    last_error: Option<DashboardError>,
    updated_at: Option<DateTime<Utc>>,
}

impl<T> Collection<T> {
    fn empty() -> Self {
        Self {
            items: Arc::new(Vec::new()),
            generation: 0,
            last_error: None,
            updated_at: None,
        }
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Error of the most recent fetch, if it failed
    pub fn last_error(&self) -> Option<&DashboardError> {
        self.last_error.as_ref()
    }

    /// When the items were last replaced
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }
}

struct Collections {
    tasks: Collection<Task>,
    events: Collection<Event>,
}

/// What one fetch did to its collection
#[derive(Debug, Clone, PartialEq)]
pub enum FetchStatus {
    Updated { count: usize },
    /// Prior items kept
    Failed { error: String },
    /// Issued under a superseded credential; result dropped
    Stale { current_generation: u64 },
}

/// Result of one refresh round
#[derive(Debug, Clone, PartialEq)]
pub struct FetchReport {
    pub generation: u64,
    pub tasks: FetchStatus,
    pub events: FetchStatus,
}

/// Fetches both collections with the current credential
pub struct DataFetchOrchestrator {
    backend: BackendClient,
    store: Arc<CredentialStore>,
    events: EventBus,
    collections: RwLock<Collections>,
    rounds: AtomicU64,
}

impl DataFetchOrchestrator {
    pub fn new(backend: BackendClient, store: Arc<CredentialStore>, events: EventBus) -> Self {
        Self {
            backend,
            store,
            events,
            collections: RwLock::new(Collections {
                tasks: Collection::empty(),
                events: Collection::empty(),
            }),
            rounds: AtomicU64::new(0),
        }
    }

    pub fn tasks(&self) -> Collection<Task> {
        self.collections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .tasks
            .clone()
    }

    pub fn events(&self) -> Collection<Event> {
        self.collections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .events
            .clone()
    }

    /// Number of refresh rounds that reached the backend
    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::SeqCst)
    }

    /// Refresh with whatever credential the store holds now
    pub async fn refresh_now(&self) -> Option<FetchReport> {
        self.refresh(&self.store.snapshot()).await
    }

    /// Refresh only if the store still holds credential `generation`
    async fn refresh_generation(&self, generation: u64) -> Option<FetchReport> {
        let current = self.store.snapshot();
        if !current.is_authenticated() || current.generation() != generation {
            debug!(
                expected = generation,
                current = current.generation(),
                state = %current.state(),
                "Credential changed before fetch, dropping round"
            );
            return None;
        }
        self.refresh(&current).await
    }

    /// Fetch both collections with the credential in `snapshot`.
    ///
    /// Returns `None` without any request when the snapshot is not
    /// authenticated.
    pub async fn refresh(&self, snapshot: &CredentialSnapshot) -> Option<FetchReport> {
        let Some(authorization) = snapshot.authorization() else {
            debug!(state = %snapshot.state(), "Not authenticated, skipping fetch");
            return None;
        };
        let generation = authorization.generation();
        self.rounds.fetch_add(1, Ordering::SeqCst);
        debug!(generation, "Fetching tasks and events");

        let (tasks, events) = futures::join!(
            self.backend.tasks(&authorization),
            self.backend.events(&authorization)
        );

        let tasks = self.apply(CollectionKind::Tasks, generation, tasks, |c| &mut c.tasks);
        let events = self.apply(CollectionKind::Events, generation, events, |c| &mut c.events);

        Some(FetchReport {
            generation,
            tasks,
            events,
        })
    }

    fn apply<T>(
        &self,
        kind: CollectionKind,
        issued: u64,
        result: anyhow::Result<Vec<T>>,
        slot: impl FnOnce(&mut Collections) -> &mut Collection<T>,
    ) -> FetchStatus {
        let mut collections = self
            .collections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let collection = slot(&mut *collections);

        let current = self.store.generation().max(collection.generation);
        if issued < current {
            drop(collections);
            debug!(collection = %kind, issued, current, "Discarding stale response");
            self.events.publish(DashboardEvent::StaleResponseDiscarded {
                collection: kind,
                issued_generation: issued,
                current_generation: current,
            });
            return FetchStatus::Stale {
                current_generation: current,
            };
        }

        match result {
            Ok(items) => {
                let count = items.len();
                *collection = Collection {
                    items: Arc::new(items),
                    generation: issued,
                    last_error: None,
                    updated_at: Some(Utc::now()),
                };
                drop(collections);
                info!(collection = %kind, count, generation = issued, "Collection updated");
                self.events.publish(DashboardEvent::CollectionUpdated {
                    collection: kind,
                    generation: issued,
                    count,
                });
                FetchStatus::Updated { count }
            }
            Err(e) => {
                let err = DashboardError::fetch(kind, format!("{:#}", e));
                collection.last_error = Some(err.clone());
                drop(collections);
                warn!(collection = %kind, generation = issued, error = %err, "Fetch failed, keeping previous data");
                self.events.publish(DashboardEvent::FetchFailed {
                    collection: kind,
                    generation: issued,
                    error: err.to_string(),
                });
                FetchStatus::Failed {
                    error: err.to_string(),
                }
            }
        }
    }

    /// Refresh on every new credential from now on.
    ///
    /// Each distinct token triggers at most one round. Queued notifications
    /// collapse to the newest, and every round re-reads the store so a
    /// superseded or cleared credential is never sent.
    pub fn attach(self: &Arc<Self>) -> OrchestratorHandle {
        let (tx, mut rx) = mpsc::unbounded_channel::<CredentialSnapshot>();

        let listener_tx = tx.clone();
        let listener = self.store.subscribe(move |snapshot| {
            if snapshot.token_changed() && snapshot.is_authenticated() {
                listener_tx
                    .send(snapshot)
                    .map_err(|_| anyhow!("data fetch worker has stopped"))?;
            }
            Ok(())
        });

        // Already signed in before attaching
        let current = self.store.snapshot();
        if current.is_authenticated() {
            let _ = tx.send(current);
        }
        drop(tx);

        let orchestrator = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut in_flight = JoinSet::new();
            let mut last_dispatched = 0u64;
            loop {
                tokio::select! {
                    next = rx.recv() => {
                        let Some(mut newest) = next else { break };
                        while let Ok(snapshot) = rx.try_recv() {
                            if snapshot.generation() > newest.generation() {
                                newest = snapshot;
                            }
                        }

                        // Notifications may lag the store; trust the store
                        let current = orchestrator.store.snapshot();
                        if !current.is_authenticated() || current.generation() <= last_dispatched {
                            debug!(
                                notified = newest.generation(),
                                current = current.generation(),
                                state = %current.state(),
                                "Skipping fetch for superseded credential"
                            );
                            continue;
                        }
                        last_dispatched = current.generation();
                        let generation = current.generation();
                        let orchestrator = Arc::clone(&orchestrator);
                        in_flight.spawn(async move {
                            orchestrator.refresh_generation(generation).await;
                        });
                    }
                    Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                }
            }
            while in_flight.join_next().await.is_some() {}
        });

        OrchestratorHandle {
            store: Arc::clone(&self.store),
            listener: Some(listener),
            task,
        }
    }
}

/// Keeps the orchestrator subscribed; dropping it detaches and cancels fetches
pub struct OrchestratorHandle {
    store: Arc<CredentialStore>,
    listener: Option<CallbackId>,
    task: JoinHandle<()>,
}

impl OrchestratorHandle {
    /// Stop reacting to credential changes
    pub fn detach(mut self) {
        self.unsubscribe();
    }

    fn unsubscribe(&mut self) {
        if let Some(id) = self.listener.take() {
            self.store.unsubscribe(id);
        }
        self.task.abort();
    }
}

impl Drop for OrchestratorHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
