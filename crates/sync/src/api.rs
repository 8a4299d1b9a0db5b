//! REST client for the collection endpoints the view refreshes from.

use std::sync::Arc;

use async_trait::async_trait;
use opsdesk_core::types::DbId;
use opsdesk_core::{Alert, ChatMessage, Collection, CredentialStore};
use serde::de::DeserializeOwned;

use crate::source::{CollectionSource, SourceError};
use crate::view::CollectionData;

/// HTTP client for `GET /leads`, `/conversations`,
/// `/conversations/{id}/messages` and `/alerts`.
pub struct CollectionApi {
    client: reqwest::Client,
    api_url: String,
    credentials: Arc<dyn CredentialStore>,
}

impl CollectionApi {
    pub fn new(api_url: String, credentials: Arc<dyn CredentialStore>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url, credentials)
    }

    /// Share the connection pool with the task status client.
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

    pub async fn leads(&self) -> Result<Vec<serde_json::Value>, SourceError> {
        self.get("leads").await
    }

    pub async fn conversations(&self) -> Result<Vec<serde_json::Value>, SourceError> {
        self.get("conversations").await
    }

    pub async fn messages(&self, conversation_id: DbId) -> Result<Vec<ChatMessage>, SourceError> {
        self.get(&format!("conversations/{conversation_id}/messages")).await
    }

    pub async fn alerts(&self) -> Result<Vec<Alert>, SourceError> {
        self.get("alerts").await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, SourceError> {
        let token = self
            .credentials
            .token()
            .ok_or(SourceError::MissingCredential)?;

        let response = self
            .client
            .get(format!("{}/{path}", self.api_url))
            .bearer_auth(token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(SourceError::ApiError {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl CollectionSource for CollectionApi {
    async fn fetch(&self, collection: Collection) -> Result<CollectionData, SourceError> {
        Ok(match collection {
            Collection::Leads => CollectionData::Leads(self.leads().await?),
            Collection::Conversations => CollectionData::Conversations(self.conversations().await?),
            Collection::Messages(id) => CollectionData::Messages(id, self.messages(id).await?),
            Collection::Alerts => CollectionData::Alerts(self.alerts().await?),
        })
    }
}
