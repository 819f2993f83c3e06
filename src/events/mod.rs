use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use crate::adapters::backend::CollectionKind;
use crate::auth::token::SessionState;

pub mod streams;
pub use streams::{EventStream, EventStreamStats, StreamItem, Subscriber};

// Event bus capacity constants
pub const EVENT_BUS_CAPACITY: usize = 256;
pub const EVENT_BUFFER_SIZE: usize = 64;

/// Things that happen during a dashboard session.
///
/// Presentation code subscribes to these instead of polling the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardEvent {
    SessionStateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// The provider wants the user sent to its login page
    LoginRequired { login_url: Option<String> },
    /// The identity provider handshake failed
    InitializationFailed { error: String },
    CredentialRenewed {
        generation: u64,
        expires_at: DateTime<Utc>,
    },
    RenewalFailed {
        consecutive_failures: u32,
        error: String,
    },
    /// Renewal gave up and the session ended
    SessionExpired { reason: String },
    CollectionUpdated {
        collection: CollectionKind,
        generation: u64,
        count: usize,
    },
    FetchFailed {
        collection: CollectionKind,
        generation: u64,
        error: String,
    },
    /// A response issued under a superseded credential arrived late
    StaleResponseDiscarded {
        collection: CollectionKind,
        issued_generation: u64,
        current_generation: u64,
    },
    DownloadCompleted {
        task_id: String,
        path: PathBuf,
        bytes: usize,
    },
    DownloadFailed { task_id: String, error: String },
}

impl DashboardEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DashboardEvent::SessionStateChanged { .. } => "session.state_changed",
            DashboardEvent::LoginRequired { .. } => "session.login_required",
            DashboardEvent::InitializationFailed { .. } => "session.initialization_failed",
            DashboardEvent::CredentialRenewed { .. } => "credential.renewed",
            DashboardEvent::RenewalFailed { .. } => "credential.renewal_failed",
            DashboardEvent::SessionExpired { .. } => "session.expired",
            DashboardEvent::CollectionUpdated { .. } => "collection.updated",
            DashboardEvent::FetchFailed { .. } => "collection.fetch_failed",
            DashboardEvent::StaleResponseDiscarded { .. } => "collection.stale_discarded",
            DashboardEvent::DownloadCompleted { .. } => "download.completed",
            DashboardEvent::DownloadFailed { .. } => "download.failed",
        }
    }
}

/// Event with the time it was published
#[derive(Debug, Clone, Serialize)]
pub struct StreamEvent {
    event: DashboardEvent,
    timestamp: DateTime<Utc>,
}

impl StreamEvent {
    pub fn new(event: DashboardEvent) -> Self {
        Self {
            event,
            timestamp: Utc::now(),
        }
    }

    pub fn event(&self) -> &DashboardEvent {
        &self.event
    }

    pub fn timestamp(&self) -> &DateTime<Utc> {
        &self.timestamp
    }
}

impl StreamItem for StreamEvent {
    fn kind(&self) -> &'static str {
        self.event.kind()
    }
}

/// Session-wide event bus
#[derive(Clone)]
pub struct EventBus {
    stream: Arc<EventStream<StreamEvent>>,
}

impl EventBus {
    /// Create a new event bus with the specified capacity
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        Self {
            stream: Arc::new(EventStream::new(capacity, buffer_size)),
        }
    }

    /// Get a subscriber to receive events
    pub fn subscribe(&self) -> Subscriber<StreamEvent> {
        self.stream.subscribe()
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: DashboardEvent) -> usize {
        self.stream.publish(StreamEvent::new(event))
    }

    /// Recently published events, oldest first
    pub fn recent(&self) -> Vec<DashboardEvent> {
        self.stream
            .subscribe()
            .replay_buffer()
            .into_iter()
            .map(|e| e.event)
            .collect()
    }

    /// Get current statistics
    pub fn get_stats(&self) -> EventStreamStats {
        self.stream.get_stats()
    }

    /// Reset statistics
    pub fn reset_stats(&self) {
        self.stream.reset_stats()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_BUS_CAPACITY, EVENT_BUFFER_SIZE)
    }
}
