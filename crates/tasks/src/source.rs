//! Port to the backend task status endpoints.

use std::collections::HashMap;

use async_trait::async_trait;
use opsdesk_core::{StatusReport, TaskId};

/// Errors from the task status endpoints.
#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The backend returned a non-2xx status code.
    #[error("Task API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// No session credential to authenticate the request with.
    #[error("No session credential available")]
    MissingCredential,

    /// The response body did not have the expected shape.
    #[error("Malformed status response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Status-fetch collaborator of the poller.
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Batched status request. Ids absent from the returned map carry no
    /// new information.
    async fn fetch_batch(
        &self,
        ids: &[TaskId],
    ) -> Result<HashMap<TaskId, StatusReport>, StatusError>;

    /// Single-task status request. `Ok(None)` when the backend does not
    /// know the id.
    async fn fetch_one(&self, id: &TaskId) -> Result<Option<StatusReport>, StatusError>;

    /// Best-effort cancellation of the underlying job.
    async fn revoke(&self, id: &TaskId) -> Result<(), StatusError>;
}
