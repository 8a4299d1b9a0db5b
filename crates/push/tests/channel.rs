use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use opsdesk_core::{CredentialStore, MemoryCredentialStore, PushEvent};
use opsdesk_push::{
    reconnect_with_backoff, ChannelConfig, ChannelError, ChannelState, ChannelStatus, CloseInfo,
    CloseReason, Connection, Connector, Frame, LoginBoundary, OpenOutcome, PushChannel,
    ReconnectConfig, ReconnectOutcome,
};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const WS_URL: &str = "ws://test/ws";

struct ServerEnd {
    url: String,
    frames: fmpsc::UnboundedSender<Result<Frame, ChannelError>>,
    outbound: fmpsc::UnboundedReceiver<Frame>,
}

/// In-memory connector. Each successful connect hands the test the
/// server side of the connection.
struct FakeConnector {
    gate: Semaphore,
    failures: AtomicUsize,
    connects: AtomicUsize,
    attempted_at: Mutex<Vec<Instant>>,
    servers: Mutex<Vec<ServerEnd>>,
}

impl FakeConnector {
    fn open() -> Arc<Self> {
        Arc::new(Self::with_gate(Semaphore::MAX_PERMITS))
    }

    /// Connect attempts block until the test adds permits.
    fn held() -> Arc<Self> {
        Arc::new(Self::with_gate(0))
    }

    fn with_gate(permits: usize) -> Self {
        Self {
            gate: Semaphore::new(permits),
            failures: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            attempted_at: Mutex::new(Vec::new()),
            servers: Mutex::new(Vec::new()),
        }
    }

    fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Time between consecutive connect attempts.
    fn gaps(&self) -> Vec<Duration> {
        let at = self.attempted_at.lock().unwrap();
        at.windows(2).map(|w| w[1] - w[0]).collect()
    }

    fn take_server(&self) -> ServerEnd {
        self.servers.lock().unwrap().remove(0)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, url: &str) -> Result<Connection, ChannelError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.attempted_at.lock().unwrap().push(Instant::now());
        self.gate
            .acquire()
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?
            .forget();

        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ChannelError::Connection("connection refused".into()));
        }

        let (frames_tx, frames_rx) = fmpsc::unbounded();
        let (outbound_tx, outbound_rx) = fmpsc::unbounded();
        self.servers.lock().unwrap().push(ServerEnd {
            url: url.to_string(),
            frames: frames_tx,
            outbound: outbound_rx,
        });

        Ok(Connection {
            frames: frames_rx.boxed(),
            sink: Box::pin(outbound_tx.sink_map_err(|e| ChannelError::Protocol(e.to_string()))),
        })
    }
}

#[derive(Default)]
struct CountingLogin(AtomicUsize);

impl CountingLogin {
    fn redirects(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl LoginBoundary for CountingLogin {
    fn redirect_to_login(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    channel: PushChannel,
    connector: Arc<FakeConnector>,
    credentials: Arc<MemoryCredentialStore>,
    login: Arc<CountingLogin>,
}

fn harness(connector: Arc<FakeConnector>, token: Option<&str>) -> Harness {
    let credentials = Arc::new(match token {
        Some(token) => MemoryCredentialStore::with_token(token),
        None => MemoryCredentialStore::new(),
    });
    let login = Arc::new(CountingLogin::default());
    let channel = PushChannel::new(
        ChannelConfig::new(WS_URL),
        connector.clone(),
        credentials.clone(),
        login.clone(),
    );
    Harness {
        channel,
        connector,
        credentials,
        login,
    }
}

async fn wait_state(channel: &PushChannel, state: ChannelState) -> ChannelStatus {
    let mut status = channel.subscribe();
    let settled = tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.state == state))
        .await
        .expect("timed out waiting for channel state")
        .expect("status sender dropped")
        .clone();
    settled
}

fn sink() -> (mpsc::UnboundedSender<PushEvent>, mpsc::UnboundedReceiver<PushEvent>) {
    mpsc::unbounded_channel()
}

fn message_frame(conversation: i64, id: i64) -> Frame {
    Frame::Text(format!(
        r#"{{"type":"message_delivered","targetId":{conversation},"payload":{{"id":{id},"body":"hi","direction":"inbound","sentAt":"2024-05-01T10:00:00Z"}}}}"#
    ))
}

#[tokio::test(start_paused = true)]
async fn second_open_reuses_the_connection() {
    let h = harness(FakeConnector::open(), Some("tok-1"));
    let (tx, _rx) = sink();

    assert_eq!(h.channel.open(tx.clone()).unwrap(), OpenOutcome::Opened { generation: 1 });
    assert_eq!(
        h.channel.open(tx.clone()).unwrap(),
        OpenOutcome::AlreadyActive { generation: 2 }
    );

    wait_state(&h.channel, ChannelState::Open).await;
    assert_matches!(h.channel.open(tx), Ok(OpenOutcome::AlreadyActive { generation: 3 }));
    assert_eq!(h.connector.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn open_without_credential_fails_fast() {
    let h = harness(FakeConnector::open(), None);
    let (tx, _rx) = sink();

    assert_matches!(h.channel.open(tx), Err(ChannelError::MissingCredential));
    assert_eq!(h.channel.state(), ChannelState::Closed);

    tokio::task::yield_now().await;
    assert_eq!(h.connector.connects(), 0);
}

#[tokio::test(start_paused = true)]
async fn url_carries_token_and_client_id() {
    let h = harness(FakeConnector::open(), Some("tok-1"));
    let (tx, _rx) = sink();

    h.channel.open(tx).unwrap();
    wait_state(&h.channel, ChannelState::Open).await;

    let server = h.connector.take_server();
    assert!(server.url.starts_with("ws://test/ws?token=tok-1&clientId="), "{}", server.url);
    let client_id = server.url.rsplit("clientId=").next().unwrap();
    assert!(uuid_like(client_id), "{client_id}");
}

fn uuid_like(s: &str) -> bool {
    s.len() == 36 && s.chars().filter(|c| *c == '-').count() == 4
}

#[tokio::test(start_paused = true)]
async fn close_sends_handshake_and_is_idempotent() {
    let h = harness(FakeConnector::open(), Some("tok-1"));
    let (tx, _rx) = sink();

    h.channel.close();
    assert_eq!(h.channel.state(), ChannelState::Closed);

    h.channel.open(tx).unwrap();
    wait_state(&h.channel, ChannelState::Open).await;
    let mut server = h.connector.take_server();

    h.channel.close();
    let status = h.channel.status();
    assert_eq!(status.state, ChannelState::Closed);
    assert_eq!(status.last_close, Some(CloseReason::Local));

    h.channel.close();
    assert_eq!(h.channel.state(), ChannelState::Closed);

    let handshake = tokio::time::timeout(Duration::from_secs(5), server.outbound.next())
        .await
        .unwrap();
    assert_matches!(handshake, Some(Frame::Close(Some(CloseInfo { code: 1000, .. }))));
}

#[tokio::test(start_paused = true)]
async fn close_while_connecting_is_ignored() {
    let h = harness(FakeConnector::held(), Some("tok-1"));
    let (tx, _rx) = sink();

    h.channel.open(tx).unwrap();
    assert_eq!(h.channel.state(), ChannelState::Connecting);

    h.channel.close();
    assert_eq!(h.channel.state(), ChannelState::Connecting);

    h.connector.gate.add_permits(1);
    wait_state(&h.channel, ChannelState::Open).await;
    assert_eq!(h.connector.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn superseded_owner_cannot_close_the_channel() {
    let h = harness(FakeConnector::held(), Some("tok-1"));
    let (tx, _rx) = sink();

    // Mount, unmount while connecting, mount again.
    let first = h.channel.open(tx.clone()).unwrap().generation();
    h.channel.release(first);
    let second = h.channel.open(tx).unwrap();
    assert_matches!(second, OpenOutcome::AlreadyActive { .. });

    h.connector.gate.add_permits(1);
    wait_state(&h.channel, ChannelState::Open).await;

    assert!(!h.channel.release(first));
    assert_eq!(h.channel.state(), ChannelState::Open);

    assert!(h.channel.release(second.generation()));
    assert_eq!(h.channel.state(), ChannelState::Closed);
    assert_eq!(h.connector.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn events_are_dispatched_in_order_and_bad_frames_skipped() {
    let h = harness(FakeConnector::open(), Some("tok-1"));
    let (tx, mut rx) = sink();

    h.channel.open(tx).unwrap();
    wait_state(&h.channel, ChannelState::Open).await;
    let server = h.connector.take_server();

    server.frames.unbounded_send(Ok(message_frame(7, 1))).unwrap();
    server.frames.unbounded_send(Ok(Frame::Text("not json".into()))).unwrap();
    server
        .frames
        .unbounded_send(Ok(Frame::Text(r#"{"type":"typing","targetId":7}"#.into())))
        .unwrap();
    server
        .frames
        .unbounded_send(Ok(Frame::Text(
            r#"{"type":"high_intent_alert","targetId":3,"payload":{"title":"Ready to buy","score":0.93}}"#.into(),
        )))
        .unwrap();
    server.frames.unbounded_send(Ok(message_frame(7, 2))).unwrap();

    let first = rx.recv().await.unwrap();
    assert_matches!(first, PushEvent::MessageDelivered { target_id: 7, ref payload } if payload.id == 1);

    let second = rx.recv().await.unwrap();
    assert_matches!(second, PushEvent::HighIntentAlert { target_id: 3, ref payload } if payload.title == "Ready to buy");

    let third = rx.recv().await.unwrap();
    assert_matches!(third, PushEvent::MessageDelivered { target_id: 7, ref payload } if payload.id == 2);

    assert_eq!(h.channel.state(), ChannelState::Open);
}

#[tokio::test(start_paused = true)]
async fn auth_close_clears_credential_and_redirects_once() {
    let h = harness(FakeConnector::open(), Some("tok-1"));
    let (tx, _rx) = sink();

    h.channel.open(tx.clone()).unwrap();
    wait_state(&h.channel, ChannelState::Open).await;
    let server = h.connector.take_server();

    server
        .frames
        .unbounded_send(Ok(Frame::Close(Some(CloseInfo::new(4001, "token expired")))))
        .unwrap();

    let status = wait_state(&h.channel, ChannelState::Closed).await;
    assert_matches!(status.last_close, Some(CloseReason::AuthRejected(CloseInfo { code: 4001, .. })));
    assert_eq!(h.credentials.token(), None);
    assert_eq!(h.login.redirects(), 1);

    // No automatic retry, and an explicit one fails fast.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.connector.connects(), 1);
    assert_matches!(h.channel.reconnect(tx), Err(ChannelError::MissingCredential));
    assert_eq!(h.login.redirects(), 1);
}

#[tokio::test(start_paused = true)]
async fn ordinary_close_waits_for_owner_to_reconnect() {
    let h = harness(FakeConnector::open(), Some("tok-1"));
    let (tx, _rx) = sink();

    h.channel.open(tx.clone()).unwrap();
    wait_state(&h.channel, ChannelState::Open).await;
    let server = h.connector.take_server();

    server
        .frames
        .unbounded_send(Ok(Frame::Close(Some(CloseInfo::new(1011, "restarting")))))
        .unwrap();

    let status = wait_state(&h.channel, ChannelState::Closed).await;
    assert_eq!(
        status.last_close,
        Some(CloseReason::Remote(Some(CloseInfo::new(1011, "restarting"))))
    );
    assert_eq!(h.credentials.token().as_deref(), Some("tok-1"));
    assert_eq!(h.login.redirects(), 0);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.connector.connects(), 1);

    assert_matches!(h.channel.reconnect(tx), Ok(OpenOutcome::Opened { .. }));
    wait_state(&h.channel, ChannelState::Open).await;
    assert_eq!(h.connector.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn stream_end_is_a_remote_close() {
    let h = harness(FakeConnector::open(), Some("tok-1"));
    let (tx, _rx) = sink();

    h.channel.open(tx).unwrap();
    wait_state(&h.channel, ChannelState::Open).await;
    drop(h.connector.take_server());

    let status = wait_state(&h.channel, ChannelState::Closed).await;
    assert_eq!(status.last_close, Some(CloseReason::Remote(None)));
    assert_eq!(h.login.redirects(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_connect_settles_closed() {
    let connector = FakeConnector::open();
    connector.failures.store(1, Ordering::SeqCst);
    let h = harness(connector, Some("tok-1"));
    let (tx, _rx) = sink();

    h.channel.open(tx).unwrap();
    let status = wait_state(&h.channel, ChannelState::Closed).await;
    assert_matches!(status.last_close, Some(CloseReason::Failed(_)));
}

#[tokio::test(start_paused = true)]
async fn shutdown_abandons_connect_and_blocks_reopen() {
    let h = harness(FakeConnector::held(), Some("tok-1"));
    let (tx, _rx) = sink();

    h.channel.open(tx.clone()).unwrap();
    h.channel.shutdown();
    assert_eq!(h.channel.state(), ChannelState::Closed);

    h.connector.gate.add_permits(1);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.channel.state(), ChannelState::Closed);

    h.channel.shutdown();
    assert_matches!(h.channel.open(tx), Err(ChannelError::Connection(_)));
}

#[tokio::test(start_paused = true)]
async fn backoff_retries_until_open() {
    let connector = FakeConnector::open();
    connector.failures.store(3, Ordering::SeqCst);
    let h = harness(connector, Some("tok-1"));
    let (tx, _rx) = sink();

    let outcome = reconnect_with_backoff(
        &h.channel,
        &tx,
        &ReconnectConfig::default(),
        &CancellationToken::new(),
    )
    .await;

    assert_eq!(outcome, ReconnectOutcome::Connected);
    assert_eq!(h.connector.connects(), 4);
    assert_gaps(&h.connector.gaps(), &[1, 2, 4]);
    assert_eq!(h.channel.state(), ChannelState::Open);
}

#[tokio::test(start_paused = true)]
async fn backoff_wait_stops_growing_at_the_ceiling() {
    let connector = FakeConnector::open();
    connector.failures.store(4, Ordering::SeqCst);
    let h = harness(connector, Some("tok-1"));
    let (tx, _rx) = sink();
    let config = ReconnectConfig {
        first_retry: Duration::from_secs(2),
        retry_ceiling: Duration::from_secs(5),
    };

    let outcome = reconnect_with_backoff(&h.channel, &tx, &config, &CancellationToken::new()).await;

    assert_eq!(outcome, ReconnectOutcome::Connected);
    assert_gaps(&h.connector.gaps(), &[2, 4, 5, 5]);
}

/// Gaps match the expected whole seconds, allowing for timer rounding.
fn assert_gaps(gaps: &[Duration], expected_secs: &[u64]) {
    assert_eq!(gaps.len(), expected_secs.len(), "gaps: {gaps:?}");
    for (gap, secs) in gaps.iter().zip(expected_secs) {
        let expected = Duration::from_secs(*secs);
        assert!(
            *gap >= expected && *gap < expected + Duration::from_millis(50),
            "gap {gap:?}, expected {expected:?}",
        );
    }
}

#[tokio::test(start_paused = true)]
async fn backoff_gives_up_without_credential() {
    let h = harness(FakeConnector::open(), None);
    let (tx, _rx) = sink();

    let outcome = reconnect_with_backoff(
        &h.channel,
        &tx,
        &ReconnectConfig::default(),
        &CancellationToken::new(),
    )
    .await;

    assert_eq!(outcome, ReconnectOutcome::SessionEnded);
    assert_eq!(h.connector.connects(), 0);
}

#[tokio::test(start_paused = true)]
async fn backoff_honours_cancellation() {
    let connector = FakeConnector::open();
    connector.failures.store(usize::MAX, Ordering::SeqCst);
    let h = harness(connector, Some("tok-1"));
    let (tx, _rx) = sink();
    let cancel = CancellationToken::new();

    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        stopper.cancel();
    });

    let outcome = reconnect_with_backoff(&h.channel, &tx, &ReconnectConfig::default(), &cancel).await;
    assert_eq!(outcome, ReconnectOutcome::Cancelled);
}
