//! Client for the task backend API

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::adapters::http_client::{HttpClient, SimpleHttpResponse};
use crate::auth::token::Authorization;

/// The two collections the dashboard shows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    Tasks,
    Events,
}

impl CollectionKind {
    pub const ALL: [CollectionKind; 2] = [CollectionKind::Tasks, CollectionKind::Events];

    pub fn as_str(self) -> &'static str {
        match self {
            CollectionKind::Tasks => "tasks",
            CollectionKind::Events => "events",
        }
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ingested task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub filename: String,
    /// Size in bytes
    pub size: u64,
    pub timestamp: DateTime<Utc>,
}

/// Something that happened to a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub task_id: String,
    /// e.g. `INGESTED`
    pub event: String,
    pub timestamp: DateTime<Utc>,
}

/// Body of `GET /data/{id}`
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    /// The artifact itself
    Inline(Bytes),
    /// A presigned URL to fetch it from, without credentials
    Presigned(String),
}

#[derive(Deserialize)]
struct PresignedBody {
    url: String,
}

#[derive(Deserialize)]
struct HealthBody {
    status: String,
}

/// Typed access to the backend endpoints.
///
/// Every data call takes an [`Authorization`], which only an authenticated
/// credential store hands out.
#[derive(Clone)]
pub struct BackendClient {
    http: Arc<dyn HttpClient>,
    base_url: Url,
}

impl BackendClient {
    pub fn new(http: Arc<dyn HttpClient>, base_url: &str) -> Result<Self> {
        let base_url =
            Url::parse(base_url).with_context(|| format!("invalid backend URL '{}'", base_url))?;
        if base_url.cannot_be_a_base() {
            bail!("backend URL '{}' cannot be a base", base_url);
        }
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("backend URL cannot be a base"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn headers(authorization: &Authorization) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert(
            http::header::AUTHORIZATION.as_str().to_string(),
            authorization.header_value().to_string(),
        );
        headers.insert(
            http::header::ACCEPT.as_str().to_string(),
            "application/json".to_string(),
        );
        headers
    }

    async fn authorized_get(&self, url: &Url, authorization: &Authorization) -> Result<SimpleHttpResponse> {
        trace!(url = %url, generation = authorization.generation(), "GET");
        let response = self
            .http
            .get(url.as_str(), Self::headers(authorization))
            .await
            .with_context(|| format!("request to {} failed", url.path()))?;
        if !response.is_success() {
            bail!("{} returned HTTP {}", url.path(), response.status());
        }
        Ok(response)
    }

    /// Parse a JSON list where an empty body or `null` means no items
    fn parse_list<T: serde::de::DeserializeOwned>(response: &SimpleHttpResponse) -> Result<Vec<T>> {
        if response.body().iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        let items: Option<Vec<T>> = response.json().context("undecodable payload")?;
        Ok(items.unwrap_or_default())
    }

    /// `GET /tasks`
    pub async fn tasks(&self, authorization: &Authorization) -> Result<Vec<Task>> {
        let response = self
            .authorized_get(&self.endpoint(&["tasks"])?, authorization)
            .await?;
        let tasks = Self::parse_list(&response)?;
        debug!(count = tasks.len(), "Fetched tasks");
        Ok(tasks)
    }

    /// `GET /events`
    pub async fn events(&self, authorization: &Authorization) -> Result<Vec<Event>> {
        let response = self
            .authorized_get(&self.endpoint(&["events"])?, authorization)
            .await?;
        let events = Self::parse_list(&response)?;
        debug!(count = events.len(), "Fetched events");
        Ok(events)
    }

    /// `GET /tasks/{id}`
    pub async fn task(&self, task_id: &str, authorization: &Authorization) -> Result<Task> {
        let response = self
            .authorized_get(&self.endpoint(&["tasks", task_id])?, authorization)
            .await?;
        response.json().context("undecodable task")
    }

    /// `GET /tasks?q=<name>`
    pub async fn search_tasks(&self, query: &str, authorization: &Authorization) -> Result<Vec<Task>> {
        let mut url = self.endpoint(&["tasks"])?;
        url.query_pairs_mut().append_pair("q", query);
        let response = self.authorized_get(&url, authorization).await?;
        Self::parse_list(&response)
    }

    /// `GET /data/{id}`
    pub async fn artifact(&self, task_id: &str, authorization: &Authorization) -> Result<Artifact> {
        let response = self
            .authorized_get(&self.endpoint(&["data", task_id])?, authorization)
            .await?;
        if response.is_json() {
            let body: PresignedBody = response
                .json()
                .context("artifact response is JSON without a url")?;
            return Ok(Artifact::Presigned(body.url));
        }
        Ok(Artifact::Inline(response.into_bytes()))
    }

    /// Follow a presigned artifact URL. No bearer header is sent.
    pub async fn fetch_presigned(&self, url: &str) -> Result<Bytes> {
        let response = self
            .http
            .get(url, HashMap::new())
            .await
            .context("presigned download failed")?;
        if !response.is_success() {
            bail!("presigned URL returned HTTP {}", response.status());
        }
        Ok(response.into_bytes())
    }

    /// `GET /health`, unauthenticated
    pub async fn health(&self) -> Result<bool> {
        let url = self.endpoint(&["health"])?;
        let response = self.http.get(url.as_str(), HashMap::new()).await?;
        if !response.is_success() {
            return Ok(false);
        }
        let body: HealthBody = response.json().context("undecodable health response")?;
        Ok(body.status == "ok")
    }
}
