//! In-process fakes for the transport seam.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex, Notify};

use crate::{
    connection::{BackoffPolicy, ConnectionOptions, ConnectionState},
    transport::{Transport, TransportConnector, TransportError, TransportEvent, TransportSession},
};

pub(crate) const WAIT: Duration = Duration::from_secs(2);

#[derive(Default)]
pub(crate) struct FakeTransport {
    sent: Mutex<Vec<Vec<u8>>>,
    closed: AtomicBool,
    fail_sends: AtomicBool,
    /// Sends never complete while set.
    stall_sends: AtomicBool,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if self.stall_sends.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Send("transport closed".into()));
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Send("broken pipe".into()));
        }
        self.sent.lock().await.push(frame);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// The far end of one opened fake session.
#[derive(Clone)]
pub(crate) struct FakePeer {
    pub transport: Arc<FakeTransport>,
    inbound: mpsc::Sender<TransportEvent>,
}

impl FakePeer {
    pub async fn push_frame(&self, frame: impl Into<Vec<u8>>) {
        let _ = self.inbound.send(TransportEvent::Frame(frame.into())).await;
    }

    pub async fn close(&self, reason: &str) {
        let _ = self
            .inbound
            .send(TransportEvent::Closed {
                reason: reason.to_string(),
            })
            .await;
    }

    pub async fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.transport.sent.lock().await.clone()
    }

    pub fn fail_sends(&self, fail: bool) {
        self.transport.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn stall_sends(&self, stall: bool) {
        self.transport.stall_sends.store(stall, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.transport.closed.load(Ordering::SeqCst)
    }
}

pub(crate) enum OpenBehavior {
    Accept,
    /// Opens a session whose sends all fail.
    Broken,
    Fail(String),
    /// Waits for the gate before accepting.
    Gated(Arc<Notify>),
}

/// Accepts every open unless a scripted behavior says otherwise.
#[derive(Default)]
pub(crate) struct FakeConnector {
    script: std::sync::Mutex<VecDeque<OpenBehavior>>,
    peers: Mutex<Vec<FakePeer>>,
    opens: AtomicUsize,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn scripted(behaviors: impl IntoIterator<Item = OpenBehavior>) -> Arc<Self> {
        let connector = Self::default();
        connector
            .script
            .lock()
            .expect("script lock")
            .extend(behaviors);
        Arc::new(connector)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub async fn latest_peer(&self) -> FakePeer {
        self.peers
            .lock()
            .await
            .last()
            .cloned()
            .expect("no session was opened")
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }
}

#[async_trait]
impl TransportConnector for FakeConnector {
    async fn open(&self) -> Result<TransportSession, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or(OpenBehavior::Accept);
        let broken = matches!(behavior, OpenBehavior::Broken);
        match behavior {
            OpenBehavior::Accept | OpenBehavior::Broken => {}
            OpenBehavior::Fail(reason) => return Err(TransportError::Connect(reason)),
            OpenBehavior::Gated(gate) => gate.notified().await,
        }

        let transport = Arc::new(FakeTransport::default());
        transport.fail_sends.store(broken, Ordering::SeqCst);
        let (inbound, inbound_rx) = mpsc::channel(64);
        self.peers.lock().await.push(FakePeer {
            transport: Arc::clone(&transport),
            inbound,
        });
        Ok(TransportSession {
            transport,
            inbound: inbound_rx,
        })
    }
}

/// Short timeouts and a deterministic backoff for tests.
pub(crate) fn fast_options() -> ConnectionOptions {
    ConnectionOptions {
        connect_timeout: Duration::from_millis(500),
        send_timeout: Duration::from_millis(200),
        backoff: BackoffPolicy {
            base_delay: Duration::from_millis(20),
            multiplier: 2.0,
            max_delay: Duration::from_millis(100),
            jitter_ratio: 0.0,
            max_attempts: None,
        },
    }
}

pub(crate) async fn wait_for_state(
    rx: &mut watch::Receiver<ConnectionState>,
    predicate: impl FnMut(&ConnectionState) -> bool,
) -> ConnectionState {
    tokio::time::timeout(WAIT, rx.wait_for(predicate))
        .await
        .expect("timed out waiting for connection state")
        .expect("connection manager dropped")
        .clone()
}

/// Polls `check` until it holds or [`WAIT`] elapses.
pub(crate) async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
