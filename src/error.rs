use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::adapters::backend::CollectionKind;
use crate::auth::token::SessionState;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Internal,

    // Session lifecycle
    InitializationFailed,
    AuthenticationAbsent,
    InvalidSessionTransition,
    RenewalFailed,

    // Data access
    FetchFailed,
    DownloadFailed,

    // Configuration
    ConfigInvalid,
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    /// Expected condition, nothing to report to the user
    Info,
    /// Contained in the originating component, logged only
    Warning,
    /// Operation failed
    Error,
    /// Session cannot continue
    Critical,
}

/// Errors raised by the dashboard session core
#[derive(Error, Debug, Clone)]
pub enum DashboardError {
    /// The identity provider handshake failed (network error, misconfiguration)
    #[error("identity provider initialization failed: {0}")]
    Initialization(String),

    /// The handshake succeeded but the user is not signed in
    #[error("user is not authenticated")]
    AuthenticationAbsent {
        /// Where the user must be sent to sign in, if the provider supplied it
        login_url: Option<String>,
    },

    #[error("invalid session transition from {from} to {to}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("credential renewal failed: {0}")]
    Renewal(String),

    #[error("failed to fetch {collection}: {reason}")]
    Fetch {
        collection: CollectionKind,
        reason: String,
    },

    #[error("download of task '{task_id}' failed: {reason}")]
    Download { task_id: String, reason: String },

    #[error("invalid configuration for '{key}': {reason}")]
    Config { key: String, reason: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl DashboardError {
    pub fn fetch(collection: CollectionKind, reason: impl fmt::Display) -> Self {
        DashboardError::Fetch {
            collection,
            reason: reason.to_string(),
        }
    }

    pub fn download(task_id: impl Into<String>, reason: impl fmt::Display) -> Self {
        DashboardError::Download {
            task_id: task_id.into(),
            reason: reason.to_string(),
        }
    }

    pub fn config(key: impl Into<String>, reason: impl fmt::Display) -> Self {
        DashboardError::Config {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            DashboardError::Initialization(_) => ErrorCode::InitializationFailed,
            DashboardError::AuthenticationAbsent { .. } => ErrorCode::AuthenticationAbsent,
            DashboardError::InvalidTransition { .. } => ErrorCode::InvalidSessionTransition,
            DashboardError::Renewal(_) => ErrorCode::RenewalFailed,
            DashboardError::Fetch { .. } => ErrorCode::FetchFailed,
            DashboardError::Download { .. } => ErrorCode::DownloadFailed,
            DashboardError::Config { .. } => ErrorCode::ConfigInvalid,
            DashboardError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Severity used when logging or surfacing this error
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            DashboardError::Initialization(_) | DashboardError::Config { .. } => {
                ErrorSeverity::Critical
            }
            DashboardError::AuthenticationAbsent { .. } => ErrorSeverity::Info,
            DashboardError::Renewal(_) | DashboardError::Fetch { .. } => ErrorSeverity::Warning,
            DashboardError::Download { .. }
            | DashboardError::InvalidTransition { .. }
            | DashboardError::Internal(_) => ErrorSeverity::Error,
        }
    }

    /// Whether this error ends the session
    pub fn is_fatal(&self) -> bool {
        self.severity() == ErrorSeverity::Critical
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            ErrorCode::Internal => "internal",
            ErrorCode::InitializationFailed => "initialization_failed",
            ErrorCode::AuthenticationAbsent => "authentication_absent",
            ErrorCode::InvalidSessionTransition => "invalid_session_transition",
            ErrorCode::RenewalFailed => "renewal_failed",
            ErrorCode::FetchFailed => "fetch_failed",
            ErrorCode::DownloadFailed => "download_failed",
            ErrorCode::ConfigInvalid => "config_invalid",
        };
        write!(f, "{}", code)
    }
}

impl From<anyhow::Error> for DashboardError {
    fn from(err: anyhow::Error) -> Self {
        DashboardError::Internal(format!("{:#}", err))
    }
}

/// Result type for dashboard operations
pub type DashboardResult<T> = Result<T, DashboardError>;
