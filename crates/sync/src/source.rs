//! Port to the backend collection endpoints.

use async_trait::async_trait;
use opsdesk_core::Collection;

use crate::view::CollectionData;

/// Errors from the collection endpoints.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Collection API error ({status}): {body}")]
    ApiError { status: u16, body: String },

    #[error("No session credential available")]
    MissingCredential,

    #[error("Malformed collection response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Fetches the authoritative contents of a collection.
#[async_trait]
pub trait CollectionSource: Send + Sync {
    async fn fetch(&self, collection: Collection) -> Result<CollectionData, SourceError>;
}
