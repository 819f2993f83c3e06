use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use crate::auth::providers::LoginRequest;
use crate::auth::renewer::RenewalPolicy;
use crate::download::FilenamePolicy;
use crate::error::{DashboardError, DashboardResult};

// Default configuration values
const DEFAULT_KEYCLOAK_URL: &str = "http://localhost:8080";
const DEFAULT_KEYCLOAK_REALM: &str = "nica";
const DEFAULT_CLIENT_ID: &str = "tier1-frontend";
const DEFAULT_SCOPE: &str = "openid";
const DEFAULT_REDIRECT_URI: &str = "http://localhost:3000/";
const DEFAULT_API_URL: &str = "http://localhost:8000";
const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_RENEW_INTERVAL_SECONDS: u64 = 10;
const DEFAULT_RENEW_THRESHOLD_SECONDS: u64 = 30;
const DEFAULT_RENEW_MAX_FAILURES: u32 = 6;
const DEFAULT_DOWNLOAD_DIR: &str = "downloads";

/// Main configuration struct for the dashboard
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub renewal: RenewalConfig,
    #[serde(default)]
    pub download: DownloadConfig,
}

/// Identity provider (Keycloak) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_keycloak_url")]
    pub url: String,
    #[serde(default = "default_realm")]
    pub realm: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    /// Where the provider redirects after login
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
}

/// Backend API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_api_url")]
    pub url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

/// Credential renewal settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewalConfig {
    /// How often the credential is checked
    #[serde(default = "default_renew_interval")]
    pub interval_seconds: u64,
    /// Renew when less than this remains
    #[serde(default = "default_renew_threshold")]
    pub threshold_seconds: u64,
    /// End the session after this many failures in a row; 0 never does
    #[serde(default = "default_renew_max_failures")]
    pub max_consecutive_failures: u32,
}

/// Artifact download settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    #[serde(default = "default_download_dir")]
    pub directory: PathBuf,
    #[serde(default)]
    pub filename: FilenamePolicy,
}

// Default functions
fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|val| !val.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn default_keycloak_url() -> String {
    env_or("TIER1_KEYCLOAK_URL", DEFAULT_KEYCLOAK_URL)
}

fn default_realm() -> String {
    env_or("TIER1_KEYCLOAK_REALM", DEFAULT_KEYCLOAK_REALM)
}

fn default_client_id() -> String {
    env_or("TIER1_CLIENT_ID", DEFAULT_CLIENT_ID)
}

fn default_scope() -> String {
    env_or("TIER1_SCOPE", DEFAULT_SCOPE)
}

fn default_redirect_uri() -> String {
    env_or("TIER1_REDIRECT_URI", DEFAULT_REDIRECT_URI)
}

fn default_api_url() -> String {
    env_or("TIER1_API_URL", DEFAULT_API_URL)
}

fn default_request_timeout() -> u64 {
    std::env::var("TIER1_REQUEST_TIMEOUT_SECS")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECONDS)
}

fn default_renew_interval() -> u64 {
    std::env::var("TIER1_RENEW_INTERVAL_SECS")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(DEFAULT_RENEW_INTERVAL_SECONDS)
}

fn default_renew_threshold() -> u64 {
    std::env::var("TIER1_RENEW_THRESHOLD_SECS")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(DEFAULT_RENEW_THRESHOLD_SECONDS)
}

fn default_renew_max_failures() -> u32 {
    std::env::var("TIER1_RENEW_MAX_FAILURES")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(DEFAULT_RENEW_MAX_FAILURES)
}

fn default_download_dir() -> PathBuf {
    PathBuf::from(env_or("TIER1_DOWNLOAD_DIR", DEFAULT_DOWNLOAD_DIR))
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            url: default_keycloak_url(),
            realm: default_realm(),
            client_id: default_client_id(),
            scope: default_scope(),
            redirect_uri: default_redirect_uri(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_api_url(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_renew_interval(),
            threshold_seconds: default_renew_threshold(),
            max_consecutive_failures: default_renew_max_failures(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            directory: default_download_dir(),
            filename: FilenamePolicy::default(),
        }
    }
}

fn check_url(key: &str, value: &str) -> DashboardResult<()> {
    let url = Url::parse(value).map_err(|e| DashboardError::config(key, e))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(DashboardError::config(key, "must be an http(s) URL"));
    }
    Ok(())
}

impl Config {
    /// Reject settings the session cannot run with
    pub fn validate(&self) -> DashboardResult<()> {
        check_url("identity.url", &self.identity.url)?;
        check_url("identity.redirect_uri", &self.identity.redirect_uri)?;
        check_url("backend.url", &self.backend.url)?;
        for (key, value) in [
            ("identity.realm", &self.identity.realm),
            ("identity.client_id", &self.identity.client_id),
        ] {
            if value.trim().is_empty() {
                return Err(DashboardError::config(key, "must not be empty"));
            }
        }
        if self.backend.request_timeout_seconds == 0 {
            return Err(DashboardError::config(
                "backend.request_timeout_seconds",
                "must be positive",
            ));
        }
        self.renewal_policy()?;
        Ok(())
    }

    /// Parameters for the initial login check
    pub fn login_request(&self) -> LoginRequest {
        LoginRequest {
            endpoint: self.identity.url.clone(),
            realm: self.identity.realm.clone(),
            client_id: self.identity.client_id.clone(),
            scope: self.identity.scope.clone(),
            redirect_uri: self.identity.redirect_uri.clone(),
            callback_url: None,
        }
    }

    pub fn renewal_policy(&self) -> DashboardResult<RenewalPolicy> {
        RenewalPolicy::new(
            Duration::from_secs(self.renewal.interval_seconds),
            Duration::from_secs(self.renewal.threshold_seconds),
            self.renewal.max_consecutive_failures,
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.request_timeout_seconds)
    }
}

/// Load configuration, from `path` when given and present, else defaults
pub async fn load_config(path: Option<&Path>) -> DashboardResult<Config> {
    let config = match path {
        Some(path) if path.exists() => {
            let config_str = fs::read_to_string(path)
                .await
                .map_err(|e| DashboardError::config(path.display().to_string(), e))?;
            let config: Config = serde_json::from_str(&config_str)
                .map_err(|e| DashboardError::config(path.display().to_string(), e))?;
            info!("Loaded configuration from {}", path.display());
            config
        }
        Some(path) => {
            debug!("No configuration at {}, using defaults", path.display());
            Config::default()
        }
        None => Config::default(),
    };
    config.validate()?;
    Ok(config)
}
