//! Wiring of one console session.
//!
//! Builds the credential store, REST clients, poller, push channel and
//! reconciler from a [`ConsoleConfig`], then follows the session until
//! the shutdown future resolves or the backend rejects the credential.

use std::future::Future;
use std::sync::Arc;

use opsdesk_core::{CredentialError, CredentialStore, FileCredentialStore, MemoryCredentialStore, PushEvent};
use opsdesk_push::{
    reconnect_with_backoff, ChannelConfig, ChannelError, ChannelState, CloseReason, LoginBoundary,
    PushChannel, ReconnectConfig, ReconnectOutcome, WsConnector,
};
use opsdesk_sync::{CollectionApi, Notification, NotificationDispatcher, Notifier, Reconciler};
use opsdesk_tasks::{BatchPoller, PollerConfig, StatusApi};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ConsoleConfig;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Credential store error: {0}")]
    Credentials(#[from] CredentialError),
}

/// Prints priority notifications to the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        tracing::warn!(
            lead_id = notification.target_id,
            score = ?notification.score,
            body = %notification.body,
            "[notification] {}",
            notification.title,
        );
    }
}

/// A headless console has no login screen; the session simply ends.
pub struct EndSessionOnLogin {
    session: CancellationToken,
}

impl LoginBoundary for EndSessionOnLogin {
    fn redirect_to_login(&self) {
        tracing::error!("Session credential rejected, log in again to continue");
        self.session.cancel();
    }
}

pub fn credential_store(config: &ConsoleConfig) -> Result<Arc<dyn CredentialStore>, SessionError> {
    let store: Arc<dyn CredentialStore> = match &config.credential_file {
        Some(path) => Arc::new(FileCredentialStore::new(path.clone())),
        None => Arc::new(MemoryCredentialStore::new()),
    };
    if let Some(token) = &config.token {
        store.set_token(token.clone())?;
    }
    Ok(store)
}

/// Run the session until `shutdown` resolves or the credential is
/// rejected.
pub async fn run(config: ConsoleConfig, shutdown: impl Future<Output = ()>) -> Result<(), SessionError> {
    let credentials = credential_store(&config)?;
    let session = CancellationToken::new();

    let client = reqwest::Client::new();
    let status_api = StatusApi::with_client(client.clone(), config.api_url.clone(), credentials.clone());
    let collection_api = CollectionApi::with_client(client, config.api_url.clone(), credentials.clone());

    let (poller, reports) = BatchPoller::new(
        Arc::new(status_api),
        PollerConfig {
            interval: config.poll_interval,
        },
    );
    let reconciler = Reconciler::new(
        poller.clone(),
        Arc::new(collection_api),
        NotificationDispatcher::new(Arc::new(LogNotifier)),
    );

    let channel = PushChannel::new(
        ChannelConfig::new(config.ws_url.clone()),
        Arc::new(WsConnector),
        credentials,
        Arc::new(EndSessionOnLogin {
            session: session.clone(),
        }),
    );

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let reconciler_task = tokio::spawn(reconciler.clone().run(events_rx, reports, session.child_token()));

    let generation = match channel.open(events_tx.clone()) {
        Ok(outcome) => Some(outcome.generation()),
        Err(ChannelError::MissingCredential) => {
            tracing::warn!("No session credential, following tasks without the push channel");
            None
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to open push channel");
            None
        }
    };

    if generation.is_some() {
        tokio::spawn(supervise_channel(channel.clone(), events_tx, session.clone()));
    }
    tokio::spawn(log_view_changes(reconciler.clone(), session.clone()));

    for id in &config.track_task_ids {
        reconciler.track(id.clone(), id.to_string(), None).await;
    }
    tracing::info!(
        tracked = config.track_task_ids.len(),
        api_url = %config.api_url,
        ws_url = %config.ws_url,
        "Console session started",
    );

    tokio::select! {
        _ = shutdown => tracing::info!("Shutdown requested"),
        _ = session.cancelled() => tracing::info!("Session ended"),
    }

    if let Some(generation) = generation {
        channel.release(generation);
    }
    channel.shutdown();
    poller.shutdown().await;
    session.cancel();

    if let Err(e) = reconciler_task.await {
        tracing::error!(error = %e, "Reconciler task failed");
    }

    for record in poller.records().await {
        tracing::info!(task_id = %record.id, status = %record.status(), "Final task status");
    }

    Ok(())
}

/// Reconnect after ordinary closures; end the session after an
/// authentication close.
async fn supervise_channel(
    channel: PushChannel,
    dispatch: mpsc::UnboundedSender<PushEvent>,
    session: CancellationToken,
) {
    let mut status = channel.subscribe();
    let config = ReconnectConfig::default();

    loop {
        tokio::select! {
            _ = session.cancelled() => return,
            changed = status.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }

        let current = status.borrow_and_update().clone();
        if current.state != ChannelState::Closed {
            continue;
        }

        match current.last_close {
            Some(CloseReason::Local) | None => continue,
            Some(CloseReason::AuthRejected(_)) => return,
            Some(reason) => {
                tracing::warn!(reason = ?reason, "Push channel lost, reconnecting");
            }
        }

        match reconnect_with_backoff(&channel, &dispatch, &config, &session).await {
            ReconnectOutcome::Connected => {}
            ReconnectOutcome::SessionEnded => {
                session.cancel();
                return;
            }
            ReconnectOutcome::Cancelled => return,
        }
        status.borrow_and_update();
    }
}

async fn log_view_changes(reconciler: Reconciler, session: CancellationToken) {
    let mut revisions = reconciler.subscribe();
    loop {
        tokio::select! {
            _ = session.cancelled() => return,
            changed = revisions.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }

        let view = reconciler.snapshot().await;
        let pending = view.tasks().filter(|t| !t.is_terminal()).count();
        tracing::debug!(
            tasks = view.tasks().count(),
            pending,
            conversations = view.conversations().len(),
            leads = view.leads().len(),
            alerts = view.alerts().len(),
            "View updated",
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn config() -> ConsoleConfig {
        ConsoleConfig::from_lookup(|_| None).unwrap()
    }

    #[test]
    fn token_seeds_memory_store() {
        let store = credential_store(&ConsoleConfig {
            token: Some("tok-1".into()),
            ..config()
        })
        .unwrap();
        assert_eq!(store.token().as_deref(), Some("tok-1"));
    }

    #[test]
    fn file_store_is_used_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        credential_store(&ConsoleConfig {
            token: Some("tok-2".into()),
            credential_file: Some(path.clone()),
            ..config()
        })
        .unwrap();

        // A second session without a token picks up the stored one.
        let store = credential_store(&ConsoleConfig {
            credential_file: Some(path),
            ..config()
        })
        .unwrap();
        assert_eq!(store.token().as_deref(), Some("tok-2"));
    }

    #[tokio::test]
    async fn session_without_credential_stops_on_shutdown() {
        let result = tokio::time::timeout(Duration::from_secs(5), run(config(), async {})).await;
        assert!(matches!(result, Ok(Ok(()))));
    }
}
