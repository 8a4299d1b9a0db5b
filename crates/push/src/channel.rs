//! The per-session push channel.
//!
//! At most one physical connection exists per [`PushChannel`]. Owners
//! that may mount twice (e.g. a screen re-initialised during a
//! development double-render) receive a generation number from
//! [`PushChannel::open`]; a stale owner's [`PushChannel::release`] is a
//! no-op once a later owner has opened.
//!
//! The channel never reconnects on its own. On an authentication close
//! it clears the stored credential and redirects to login exactly once;
//! on any other close it settles in [`ChannelState::Closed`] and leaves
//! recovery to the owner (see [`crate::reconnect`]).

use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::{SinkExt, StreamExt};
use opsdesk_core::{parse_event, CredentialStore, PushEvent};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::close_codes::{classify, CloseClass, AUTH_CLOSE_CODES};
use crate::connector::{CloseInfo, Connection, Connector, Frame};

/// Errors raised by the push channel and its transport.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ChannelError {
    /// No session credential is stored; the channel does not connect.
    #[error("No session credential available")]
    MissingCredential,

    /// The connection attempt failed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The transport failed after the connection was established.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Lifecycle of the physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Connecting,
    Open,
}

/// Why the channel last entered [`ChannelState::Closed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by this client.
    Local,
    /// The server rejected the credential.
    AuthRejected(CloseInfo),
    /// The server closed with any other code, or without one.
    Remote(Option<CloseInfo>),
    /// The connect attempt or the transport failed.
    Failed(String),
}

/// Snapshot published on every state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStatus {
    pub state: ChannelState,
    pub last_close: Option<CloseReason>,
}

/// Result of a successful [`PushChannel::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// A new connection attempt started.
    Opened { generation: u64 },
    /// A connection was already connecting or open; nothing changed
    /// except the owner generation.
    AlreadyActive { generation: u64 },
}

impl OpenOutcome {
    pub fn generation(&self) -> u64 {
        match self {
            Self::Opened { generation } | Self::AlreadyActive { generation } => *generation,
        }
    }
}

/// Navigation boundary invoked when the session credential is rejected.
pub trait LoginBoundary: Send + Sync {
    fn redirect_to_login(&self);
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Push endpoint, without the credential query.
    pub url: String,
    /// Close codes that mean the credential was rejected.
    pub auth_close_codes: RangeInclusive<u16>,
}

impl ChannelConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_close_codes: AUTH_CLOSE_CODES,
        }
    }
}

struct LiveConnection {
    id: u64,
    opened: bool,
    cancel: CancellationToken,
}

struct Slot {
    /// Generation of the most recent owner.
    generation: u64,
    next_connection_id: u64,
    connection: Option<LiveConnection>,
    shut_down: bool,
}

struct Inner {
    config: ChannelConfig,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialStore>,
    login: Arc<dyn LoginBoundary>,
    slot: Mutex<Slot>,
    status: watch::Sender<ChannelStatus>,
}

/// Handle to the session's push channel. Clones share one connection.
#[derive(Clone)]
pub struct PushChannel {
    inner: Arc<Inner>,
}

impl PushChannel {
    pub fn new(
        config: ChannelConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialStore>,
        login: Arc<dyn LoginBoundary>,
    ) -> Self {
        let (status, _) = watch::channel(ChannelStatus {
            state: ChannelState::Closed,
            last_close: None,
        });

        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                credentials,
                login,
                slot: Mutex::new(Slot {
                    generation: 0,
                    next_connection_id: 0,
                    connection: None,
                    shut_down: false,
                }),
                status,
            }),
        }
    }

    /// Open the channel, delivering parsed events to `dispatch` in
    /// arrival order.
    ///
    /// If a connection is already connecting or open this only records a
    /// new owner generation; the existing connection keeps its original
    /// dispatch sink. Fails fast with [`ChannelError::MissingCredential`]
    /// when no credential is stored.
    pub fn open(&self, dispatch: mpsc::UnboundedSender<PushEvent>) -> Result<OpenOutcome, ChannelError> {
        let mut slot = self.inner.lock_slot();
        if slot.shut_down {
            return Err(ChannelError::Connection("channel shut down".into()));
        }

        slot.generation += 1;
        let generation = slot.generation;

        if slot.connection.is_some() {
            tracing::debug!(generation, "Push channel already active");
            return Ok(OpenOutcome::AlreadyActive { generation });
        }

        let Some(token) = self.inner.credentials.token() else {
            tracing::warn!("No session credential, not opening push channel");
            return Err(ChannelError::MissingCredential);
        };

        let client_id = uuid::Uuid::new_v4();
        let url = connect_url(&self.inner.config.url, &token, &client_id.to_string());

        slot.next_connection_id += 1;
        let id = slot.next_connection_id;
        let cancel = CancellationToken::new();
        slot.connection = Some(LiveConnection {
            id,
            opened: false,
            cancel: cancel.clone(),
        });
        self.inner.publish(ChannelState::Connecting, None);
        drop(slot);

        tracing::info!(generation, connection_id = id, %client_id, "Opening push channel");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.run_connection(id, url, dispatch, cancel).await;
        });

        Ok(OpenOutcome::Opened { generation })
    }

    /// Explicit re-entry into `Connecting` after a close. Identical to
    /// [`open`](Self::open) once the channel is closed.
    pub fn reconnect(&self, dispatch: mpsc::UnboundedSender<PushEvent>) -> Result<OpenOutcome, ChannelError> {
        tracing::info!(state = ?self.state(), "Reconnecting push channel");
        self.open(dispatch)
    }

    /// Close the open connection.
    ///
    /// No-op when already closed, and while a connection is still being
    /// established (the attempt completes and the channel becomes open).
    pub fn close(&self) {
        let mut slot = self.inner.lock_slot();
        self.inner.close_locked(&mut slot);
    }

    /// Close on behalf of the owner that received `generation`.
    ///
    /// Returns `false` without touching the connection when a later
    /// owner has opened since.
    pub fn release(&self, generation: u64) -> bool {
        let mut slot = self.inner.lock_slot();
        if slot.generation != generation {
            tracing::debug!(
                generation,
                current = slot.generation,
                "Ignoring release from superseded owner",
            );
            return false;
        }
        self.inner.close_locked(&mut slot);
        true
    }

    /// Tear down unconditionally, including an in-flight connect. The
    /// channel cannot be opened again afterwards. Idempotent.
    pub fn shutdown(&self) {
        let mut slot = self.inner.lock_slot();
        if slot.shut_down {
            return;
        }
        slot.shut_down = true;
        if let Some(connection) = slot.connection.take() {
            connection.cancel.cancel();
            self.inner.publish(ChannelState::Closed, Some(CloseReason::Local));
        }
        tracing::info!("Push channel shut down");
    }

    pub fn state(&self) -> ChannelState {
        self.inner.status.borrow().state
    }

    pub fn status(&self) -> ChannelStatus {
        self.inner.status.borrow().clone()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ChannelStatus> {
        self.inner.status.subscribe()
    }
}

impl Inner {
    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, state: ChannelState, last_close: Option<CloseReason>) {
        self.status.send_modify(|status| {
            status.state = state;
            if last_close.is_some() {
                status.last_close = last_close;
            }
        });
    }

    fn close_locked(&self, slot: &mut Slot) {
        match &slot.connection {
            None => {
                tracing::debug!("Push channel already closed");
            }
            Some(connection) if !connection.opened => {
                tracing::debug!(
                    connection_id = connection.id,
                    "Push channel still connecting, leaving it",
                );
            }
            Some(_) => {
                if let Some(connection) = slot.connection.take() {
                    tracing::info!(connection_id = connection.id, "Closing push channel");
                    connection.cancel.cancel();
                    self.publish(ChannelState::Closed, Some(CloseReason::Local));
                }
            }
        }
    }

    /// Transition from `Connecting` to `Open`. Returns `false` when the
    /// connection was torn down while connecting.
    fn mark_open(&self, id: u64) -> bool {
        let mut slot = self.lock_slot();
        match slot.connection.as_mut() {
            Some(connection) if connection.id == id => {
                connection.opened = true;
                self.publish(ChannelState::Open, None);
                true
            }
            _ => false,
        }
    }

    /// Record that connection `id` ended. Returns `false` when it had
    /// already been detached by a local close.
    fn finish(&self, id: u64, reason: CloseReason) -> bool {
        let mut slot = self.lock_slot();
        if slot.connection.as_ref().map(|c| c.id) != Some(id) {
            return false;
        }
        slot.connection = None;
        self.publish(ChannelState::Closed, Some(reason));
        true
    }

    async fn run_connection(
        self: Arc<Self>,
        id: u64,
        url: String,
        dispatch: mpsc::UnboundedSender<PushEvent>,
        cancel: CancellationToken,
    ) {
        let connected = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(connection_id = id, "Connect attempt abandoned");
                return;
            }
            result = self.connector.connect(&url) => result,
        };

        let Connection { mut frames, mut sink } = match connected {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!(connection_id = id, error = %e, "Push channel connect failed");
                self.finish(id, CloseReason::Failed(e.to_string()));
                return;
            }
        };

        if !self.mark_open(id) {
            let _ = sink.send(Frame::Close(Some(CloseInfo::normal()))).await;
            return;
        }
        tracing::info!(connection_id = id, "Push channel open");

        let reason = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(e) = sink.send(Frame::Close(Some(CloseInfo::normal()))).await {
                        tracing::debug!(connection_id = id, error = %e, "Close handshake failed");
                    }
                    return;
                }
                next = frames.next() => match next {
                    Some(Ok(Frame::Text(text))) => dispatch_text(id, &text, &dispatch),
                    Some(Ok(Frame::Close(info))) => break self.classify_close(info),
                    Some(Err(e)) => {
                        tracing::warn!(connection_id = id, error = %e, "Push channel transport error");
                        break CloseReason::Failed(e.to_string());
                    }
                    None => break CloseReason::Remote(None),
                },
            }
        };

        tracing::info!(connection_id = id, reason = ?reason, "Push channel closed by server");

        if self.finish(id, reason.clone()) {
            if let CloseReason::AuthRejected(info) = reason {
                self.end_session(&info);
            }
        }
    }

    fn classify_close(&self, info: Option<CloseInfo>) -> CloseReason {
        match info {
            Some(info) if classify(info.code, &self.config.auth_close_codes) == CloseClass::AuthRejected => {
                CloseReason::AuthRejected(info)
            }
            other => CloseReason::Remote(other),
        }
    }

    fn end_session(&self, info: &CloseInfo) {
        tracing::warn!(
            code = info.code,
            reason = %info.reason,
            "Push channel credential rejected, ending session",
        );
        if let Err(e) = self.credentials.clear() {
            tracing::error!(error = %e, "Failed to clear session credential");
        }
        self.login.redirect_to_login();
    }
}

fn dispatch_text(id: u64, text: &str, dispatch: &mpsc::UnboundedSender<PushEvent>) {
    match parse_event(text) {
        Ok(event) => {
            tracing::debug!(connection_id = id, kind = event.kind(), target_id = event.target_id(), "Push event");
            if dispatch.send(event).is_err() {
                tracing::debug!(connection_id = id, "Push event dispatch receiver dropped");
            }
        }
        Err(e) => {
            tracing::warn!(connection_id = id, error = %e, raw = %text, "Skipping malformed push frame");
        }
    }
}

fn connect_url(base: &str, token: &str, client_id: &str) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    format!(
        "{base}{separator}token={}&clientId={}",
        urlencoding::encode(token),
        urlencoding::encode(client_id),
    )
}
