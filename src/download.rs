//! Exchanges a task id and the live credential for the task's artifact

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapters::backend::{Artifact, BackendClient};
use crate::auth::store::CredentialStore;
use crate::auth::token::Authorization;
use crate::error::{DashboardError, DashboardResult};
use crate::events::{DashboardEvent, EventBus};
use crate::orchestrator::DataFetchOrchestrator;

/// Name every artifact is saved under with the default policy
pub const DEFAULT_ARTIFACT_NAME: &str = "task_data.bin";

/// How a delivered artifact is named
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilenamePolicy {
    /// Always the same name; a new download replaces the previous one
    Fixed { name: String },
    /// The task's own `filename`, falling back to its id
    TaskFilename,
}

impl Default for FilenamePolicy {
    fn default() -> Self {
        FilenamePolicy::Fixed {
            name: DEFAULT_ARTIFACT_NAME.to_string(),
        }
    }
}

/// Where downloaded artifacts end up
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    /// Store `bytes` under `filename`; nothing may be visible on failure
    async fn deliver(&self, filename: &str, bytes: Bytes) -> Result<PathBuf>;
}

/// Writes artifacts into a directory, atomically
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Keep only the last path component and strip leading dots
fn sanitize_filename(name: &str) -> Option<String> {
    let base = name.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or_default();
    let cleaned: String = base
        .trim_start_matches('.')
        .chars()
        .filter(|c| !c.is_control())
        .collect();
    let cleaned = cleaned.trim();
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

#[async_trait]
impl ArtifactSink for DirectorySink {
    async fn deliver(&self, filename: &str, bytes: Bytes) -> Result<PathBuf> {
        let name = sanitize_filename(filename)
            .with_context(|| format!("unusable artifact filename '{}'", filename))?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("cannot create {}", self.dir.display()))?;

        let target = self.dir.join(&name);
        let temp = self.dir.join(format!(".{}.{}.part", name, Uuid::new_v4().simple()));

        if let Err(e) = tokio::fs::write(&temp, &bytes).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e).with_context(|| format!("cannot write {}", temp.display()));
        }
        if let Err(e) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e).with_context(|| format!("cannot move artifact to {}", target.display()));
        }

        debug!(path = %target.display(), bytes = bytes.len(), "Artifact written");
        Ok(target)
    }
}

/// Result of a download request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// No credential; nothing was requested
    Skipped,
    Delivered {
        task_id: String,
        path: PathBuf,
        bytes: usize,
    },
}

/// Downloads task artifacts with the current credential
pub struct ArtifactDownloadGateway {
    backend: BackendClient,
    store: Arc<CredentialStore>,
    events: EventBus,
    sink: Arc<dyn ArtifactSink>,
    policy: FilenamePolicy,
    collections: Option<Arc<DataFetchOrchestrator>>,
}

impl ArtifactDownloadGateway {
    pub fn new(
        backend: BackendClient,
        store: Arc<CredentialStore>,
        events: EventBus,
        sink: Arc<dyn ArtifactSink>,
    ) -> Self {
        Self {
            backend,
            store,
            events,
            sink,
            policy: FilenamePolicy::default(),
            collections: None,
        }
    }

    pub fn with_policy(mut self, policy: FilenamePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Resolve task filenames from already fetched tasks first
    pub fn with_collections(mut self, orchestrator: Arc<DataFetchOrchestrator>) -> Self {
        self.collections = Some(orchestrator);
        self
    }

    pub fn policy(&self) -> &FilenamePolicy {
        &self.policy
    }

    /// Download the artifact of `task_id`.
    ///
    /// Issues a single `GET /data/{task_id}` and never retries. Returns
    /// [`DownloadOutcome::Skipped`] when there is no credential.
    pub async fn download(&self, task_id: &str) -> DashboardResult<DownloadOutcome> {
        let Some(authorization) = self.store.authorization() else {
            debug!(task_id, "No credential, download skipped");
            return Ok(DownloadOutcome::Skipped);
        };

        match self.fetch_and_deliver(task_id, &authorization).await {
            Ok((path, bytes)) => {
                info!(task_id, path = %path.display(), bytes, "Artifact downloaded");
                self.events.publish(DashboardEvent::DownloadCompleted {
                    task_id: task_id.to_string(),
                    path: path.clone(),
                    bytes,
                });
                Ok(DownloadOutcome::Delivered {
                    task_id: task_id.to_string(),
                    path,
                    bytes,
                })
            }
            Err(e) => {
                let err = DashboardError::download(task_id, format!("{:#}", e));
                error!(task_id, error = %err, "Download failed");
                self.events.publish(DashboardEvent::DownloadFailed {
                    task_id: task_id.to_string(),
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn fetch_and_deliver(
        &self,
        task_id: &str,
        authorization: &Authorization,
    ) -> Result<(PathBuf, usize)> {
        let bytes = match self.backend.artifact(task_id, authorization).await? {
            Artifact::Inline(bytes) => bytes,
            Artifact::Presigned(url) => {
                debug!(task_id, "Following presigned artifact URL");
                self.backend.fetch_presigned(&url).await?
            }
        };

        let filename = self.filename_for(task_id, authorization).await;
        let size = bytes.len();
        let path = self.sink.deliver(&filename, bytes).await?;
        Ok((path, size))
    }

    async fn filename_for(&self, task_id: &str, authorization: &Authorization) -> String {
        match &self.policy {
            FilenamePolicy::Fixed { name } => name.clone(),
            FilenamePolicy::TaskFilename => {
                let known = self.collections.as_ref().and_then(|orchestrator| {
                    orchestrator
                        .tasks()
                        .items()
                        .iter()
                        .find(|task| task.id == task_id)
                        .map(|task| task.filename.clone())
                });
                let filename = match known {
                    Some(filename) => filename,
                    None => match self.backend.task(task_id, authorization).await {
                        Ok(task) => task.filename,
                        Err(e) => {
                            warn!(task_id, error = %format!("{:#}", e), "Task lookup failed, naming artifact after its id");
                            task_id.to_string()
                        }
                    },
                };
                if sanitize_filename(&filename).is_some() {
                    return filename;
                }
                warn!(task_id, filename = %filename, "Task filename unusable, naming artifact after its id");
                if sanitize_filename(task_id).is_some() {
                    task_id.to_string()
                } else {
                    DEFAULT_ARTIFACT_NAME.to_string()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::http_client::mock::MockHttpClient;
    use crate::auth::token::Credential;
    use chrono::Utc;
    use tempfile::TempDir;

    struct Fixture {
        http: Arc<MockHttpClient>,
        store: Arc<CredentialStore>,
        events: EventBus,
        dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                http: Arc::new(MockHttpClient::new()),
                store: Arc::new(CredentialStore::new()),
                events: EventBus::default(),
                dir: TempDir::new().unwrap(),
            }
        }

        fn authenticate(&self) {
            self.store.begin_authentication().unwrap();
            self.store
                .set_credential(Credential::with_lifetime(
                    "token-a",
                    Utc::now(),
                    chrono::Duration::seconds(300),
                ))
                .unwrap();
        }

        fn gateway(&self) -> ArtifactDownloadGateway {
            let backend = BackendClient::new(self.http.clone(), "http://localhost:8000").unwrap();
            ArtifactDownloadGateway::new(
                backend,
                self.store.clone(),
                self.events.clone(),
                Arc::new(DirectorySink::new(self.dir.path())),
            )
        }

        fn files(&self) -> Vec<String> {
            let mut names: Vec<String> = std::fs::read_dir(self.dir.path())
                .unwrap()
                .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names
        }
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("run42.root").as_deref(), Some("run42.root"));
        assert_eq!(sanitize_filename("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(sanitize_filename("..\\evil.bin").as_deref(), Some("evil.bin"));
        assert_eq!(sanitize_filename(".hidden").as_deref(), Some("hidden"));
        assert_eq!(sanitize_filename("dir/"), None);
        assert_eq!(sanitize_filename(".."), None);
    }

    #[tokio::test]
    async fn test_skipped_without_credential() {
        let fixture = Fixture::new();
        let outcome = fixture.gateway().download("t1").await.unwrap();
        assert_eq!(outcome, DownloadOutcome::Skipped);
        assert!(fixture.http.get_requests().is_empty());
        assert!(fixture.files().is_empty());
    }

    #[tokio::test]
    async fn test_inline_artifact_uses_fixed_name() {
        let fixture = Fixture::new();
        fixture.authenticate();
        fixture
            .http
            .mock_response("http://localhost:8000/data/t1", 200, "artifact bytes");

        let outcome = fixture.gateway().download("t1").await.unwrap();
        let DownloadOutcome::Delivered { path, bytes, .. } = outcome else {
            panic!("expected delivery");
        };
        assert_eq!(bytes, 14);
        assert_eq!(path, fixture.dir.path().join(DEFAULT_ARTIFACT_NAME));
        assert_eq!(std::fs::read(&path).unwrap(), b"artifact bytes");
        assert_eq!(fixture.files(), vec![DEFAULT_ARTIFACT_NAME.to_string()]);
        assert_eq!(fixture.http.request_count("http://localhost:8000/data/t1"), 1);
    }

    #[tokio::test]
    async fn test_presigned_artifact_with_task_filename() {
        let fixture = Fixture::new();
        fixture.authenticate();
        fixture
            .http
            .mock_success_json(
                "http://localhost:8000/data/t2",
                &serde_json::json!({"url": "http://minio:9000/tasks/run42.root?X-Amz-Signature=abc"}),
            )
            .unwrap();
        fixture.http.mock_response(
            "http://minio:9000/tasks/run42.root?X-Amz-Signature=abc",
            200,
            "root data",
        );
        fixture
            .http
            .mock_success_json(
                "http://localhost:8000/tasks/t2",
                &serde_json::json!({
                    "id": "t2",
                    "name": "run 42",
                    "filename": "run42.root",
                    "size": 9,
                    "timestamp": "2025-01-01T00:00:00Z"
                }),
            )
            .unwrap();

        let gateway = fixture.gateway().with_policy(FilenamePolicy::TaskFilename);
        let outcome = gateway.download("t2").await.unwrap();
        assert!(matches!(outcome, DownloadOutcome::Delivered { bytes: 9, .. }));
        assert_eq!(fixture.files(), vec!["run42.root".to_string()]);
    }

    #[tokio::test]
    async fn test_unusable_task_filename_falls_back_to_task_id() {
        let fixture = Fixture::new();
        fixture.authenticate();
        for (task_id, filename) in [("t4", ".."), ("t5", "dir/")] {
            fixture
                .http
                .mock_response(format!("http://localhost:8000/data/{}", task_id), 200, "bytes");
            fixture
                .http
                .mock_success_json(
                    format!("http://localhost:8000/tasks/{}", task_id),
                    &serde_json::json!({
                        "id": task_id,
                        "name": "broken",
                        "filename": filename,
                        "size": 5,
                        "timestamp": "2025-01-01T00:00:00Z"
                    }),
                )
                .unwrap();
        }

        let gateway = fixture.gateway().with_policy(FilenamePolicy::TaskFilename);
        for task_id in ["t4", "t5"] {
            let outcome = gateway.download(task_id).await.unwrap();
            assert!(matches!(outcome, DownloadOutcome::Delivered { bytes: 5, .. }));
        }
        assert_eq!(fixture.files(), vec!["t4".to_string(), "t5".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_task_is_an_error_and_leaves_no_file() {
        let fixture = Fixture::new();
        fixture.authenticate();
        fixture
            .http
            .mock_error("http://localhost:8000/data/nope", 404, r#"{"detail":"Task not found"}"#);
        fixture
            .http
            .mock_error("http://localhost:8000/data/secret", 403, "forbidden");

        let gateway = fixture.gateway();
        for task_id in ["nope", "secret"] {
            let err = gateway.download(task_id).await.unwrap_err();
            assert!(matches!(err, DashboardError::Download { .. }));
        }
        assert!(fixture.files().is_empty());
        assert_eq!(fixture.http.request_count("http://localhost:8000/data/nope"), 1, "No retry");
        assert!(fixture
            .events
            .recent()
            .iter()
            .any(|e| matches!(e, DashboardEvent::DownloadFailed { .. })));
    }

    #[tokio::test]
    async fn test_failed_presigned_fetch_leaves_no_file() {
        let fixture = Fixture::new();
        fixture.authenticate();
        fixture
            .http
            .mock_success_json(
                "http://localhost:8000/data/t3",
                &serde_json::json!({"url": "http://minio:9000/tasks/t3"}),
            )
            .unwrap();
        fixture
            .http
            .mock_network_error("http://minio:9000/tasks/t3", "connection reset");

        assert!(fixture.gateway().download("t3").await.is_err());
        assert!(fixture.files().is_empty());
    }
}
