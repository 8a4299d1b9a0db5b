//! REST client for the task status endpoints.
//!
//! Wraps the batched status, single-task status and revoke endpoints
//! using [`reqwest`]. The session credential is read from the injected
//! [`CredentialStore`] on every request.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use opsdesk_core::{CredentialStore, StatusReport, TaskId};
use serde::Serialize;

use crate::source::{StatusError, StatusSource};

/// HTTP client for the task endpoints of one backend.
pub struct StatusApi {
    client: reqwest::Client,
    api_url: String,
    credentials: Arc<dyn CredentialStore>,
}

/// Body of the batched status request.
#[derive(Debug, Serialize)]
struct BatchStatusRequest<'a> {
    task_ids: &'a [TaskId],
}

impl StatusApi {
    /// Create a new API client.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8000/api`.
    pub fn new(api_url: String, credentials: Arc<dyn CredentialStore>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url, credentials)
    }

    /// Create an API client reusing an existing [`reqwest::Client`]
    /// (shares the connection pool with the collection client).
    pub fn with_client(
        client: reqwest::Client,
        api_url: String,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            credentials,
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Send `POST /tasks/status` for the given ids.
    pub async fn batch_status(
        &self,
        ids: &[TaskId],
    ) -> Result<HashMap<TaskId, StatusReport>, StatusError> {
        let token = self.token()?;
        let response = self
            .client
            .post(format!("{}/tasks/status", self.api_url))
            .bearer_auth(token)
            .json(&BatchStatusRequest { task_ids: ids })
            .send()
            .await?;

        let body: serde_json::Value = Self::parse_response(response).await?;
        parse_batch_response(body)
    }

    /// Send `GET /tasks/{id}/status`.
    pub async fn task_status(&self, id: &TaskId) -> Result<Option<StatusReport>, StatusError> {
        let token = self.token()?;
        let response = self
            .client
            .get(format!("{}/tasks/{}/status", self.api_url, id))
            .bearer_auth(token)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::parse_response(response).await.map(Some)
    }

    /// Send `POST /tasks/{id}/revoke`.
    pub async fn revoke_task(&self, id: &TaskId) -> Result<(), StatusError> {
        let token = self.token()?;
        let response = self
            .client
            .post(format!("{}/tasks/{}/revoke", self.api_url, id))
            .bearer_auth(token)
            .send()
            .await?;

        Self::check_status(response).await
    }

    // ---- private helpers ----

    fn token(&self) -> Result<String, StatusError> {
        self.credentials.token().ok_or(StatusError::MissingCredential)
    }

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`StatusError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, StatusError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(StatusError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, StatusError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    async fn check_status(response: reqwest::Response) -> Result<(), StatusError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

#[async_trait]
impl StatusSource for StatusApi {
    async fn fetch_batch(
        &self,
        ids: &[TaskId],
    ) -> Result<HashMap<TaskId, StatusReport>, StatusError> {
        self.batch_status(ids).await
    }

    async fn fetch_one(&self, id: &TaskId) -> Result<Option<StatusReport>, StatusError> {
        self.task_status(id).await
    }

    async fn revoke(&self, id: &TaskId) -> Result<(), StatusError> {
        self.revoke_task(id).await
    }
}

/// Decode the `{id: {status, result}}` mapping of the batch endpoint.
///
/// An entry whose status this client does not understand is dropped
/// with a warning, which the poller treats like an omitted id.
pub fn parse_batch_response(
    body: serde_json::Value,
) -> Result<HashMap<TaskId, StatusReport>, StatusError> {
    let entries: HashMap<String, serde_json::Value> = serde_json::from_value(body)?;
    let mut reports = HashMap::with_capacity(entries.len());

    for (id, entry) in entries {
        match serde_json::from_value::<StatusReport>(entry) {
            Ok(report) => {
                reports.insert(TaskId::new(id), report);
            }
            Err(e) => {
                tracing::warn!(task_id = %id, error = %e, "Skipping unreadable status entry");
            }
        }
    }

    Ok(reports)
}
