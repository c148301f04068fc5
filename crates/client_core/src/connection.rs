use std::{fmt, sync::Arc, time::Duration};

use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::transport::{
    Transport, TransportConnector, TransportError, TransportEvent, TransportSession,
};

const STATE_BUFFER: usize = 64;
const INBOUND_BUFFER: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Fraction of the computed delay added as random jitter.
    pub jitter_ratio: f64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter_ratio: 0.25,
            max_attempts: None,
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect `attempt` (1-based). `jitter_unit` in `[0, 1]`
    /// picks the point inside the jitter window.
    pub fn delay_for(&self, attempt: u32, jitter_unit: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let max = self.max_delay.as_secs_f64();
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let capped = scaled.min(max);
        let jitter = capped * self.jitter_ratio.max(0.0) * jitter_unit.clamp(0.0, 1.0);
        Duration::from_secs_f64((capped + jitter).min(max).max(0.0))
    }

    fn next_delay(&self, attempt: u32) -> Duration {
        self.delay_for(attempt, rand::random::<f64>())
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub connect_timeout: Duration,
    /// Window for the transport to accept a frame before the connection is
    /// considered stale.
    pub send_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Default)]
struct ConnectionInner {
    transport: Option<Arc<dyn Transport>>,
    reader_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
    /// Bumped by every connect attempt and every teardown. Work started under
    /// an older generation must not touch state.
    generation: u64,
}

enum AttemptOutcome {
    Connected,
    Failed,
    Superseded,
    Skipped,
}

/// Owns at most one transport and publishes its lifecycle. Transport errors
/// never reach callers of `connect`/`disconnect`; they show up as
/// [`ConnectionState::Error`].
pub struct ConnectionManager {
    connector: Arc<dyn TransportConnector>,
    options: ConnectionOptions,
    state: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
    inbound: broadcast::Sender<Vec<u8>>,
    inner: Mutex<ConnectionInner>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn TransportConnector>, options: ConnectionOptions) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(STATE_BUFFER);
        let (inbound, _) = broadcast::channel(INBOUND_BUFFER);
        Arc::new(Self {
            connector,
            options,
            state,
            transitions,
            inbound,
            inner: Mutex::new(ConnectionInner::default()),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Current value plus change notifications; intermediate values may be
    /// coalesced.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Every transition, in order.
    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.transitions.subscribe()
    }

    /// Raw inbound frames of whichever transport is currently open.
    pub fn subscribe_inbound(&self) -> broadcast::Receiver<Vec<u8>> {
        self.inbound.subscribe()
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Opens the transport when `Disconnected` or in `Error`; a no-op otherwise.
    /// A failed attempt leaves `Error(reason)` and schedules a reconnect.
    pub async fn connect(self: &Arc<Self>) {
        self.attempt_connect(true).await;
    }

    /// Closes the transport and cancels any pending reconnect. Idempotent.
    pub async fn disconnect(&self) {
        let transport = {
            let mut inner = self.inner.lock().await;
            inner.generation += 1;
            if let Some(task) = inner.reconnect_task.take() {
                task.abort();
            }
            if let Some(task) = inner.reader_task.take() {
                task.abort();
            }
            self.publish(ConnectionState::Disconnected);
            inner.transport.take()
        };
        if let Some(transport) = transport {
            transport.close().await;
            info!("connection: disconnected");
        }
    }

    /// Hands one frame to the active transport. A timeout or transport error
    /// marks the connection stale, which moves it to `Error` and schedules a
    /// reconnect.
    pub async fn send(self: &Arc<Self>, frame: Vec<u8>) -> Result<(), TransportError> {
        let (transport, generation) = {
            let inner = self.inner.lock().await;
            match &inner.transport {
                Some(transport) if self.state.borrow().is_connected() => {
                    (Arc::clone(transport), inner.generation)
                }
                _ => return Err(TransportError::NotConnected),
            }
        };

        let result = match timeout(self.options.send_timeout, transport.send(frame)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };
        if let Err(err) = &result {
            self.handle_transport_loss(generation, format!("connection stale: {err}"), false)
                .await;
        }
        result
    }

    async fn attempt_connect(self: &Arc<Self>, manual: bool) -> AttemptOutcome {
        let generation = {
            let mut inner = self.inner.lock().await;
            if matches!(
                *self.state.borrow(),
                ConnectionState::Connected | ConnectionState::Connecting
            ) {
                return AttemptOutcome::Skipped;
            }
            if manual {
                if let Some(task) = inner.reconnect_task.take() {
                    task.abort();
                }
            }
            inner.generation += 1;
            self.publish(ConnectionState::Connecting);
            inner.generation
        };

        debug!(generation, "connection: opening transport");
        let opened = match timeout(self.options.connect_timeout, self.connector.open()).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Connect("connection timeout".to_string())),
        };

        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            drop(inner);
            if let Ok(session) = opened {
                session.transport.close().await;
            }
            debug!(generation, "connection: attempt superseded");
            return AttemptOutcome::Superseded;
        }

        match opened {
            Ok(TransportSession { transport, inbound }) => {
                inner.transport = Some(transport);
                inner.reader_task = Some(self.spawn_reader(generation, inbound));
                // A finished reconnect loop must not block the next one.
                inner.reconnect_task = None;
                self.publish(ConnectionState::Connected);
                info!(generation, "connection: connected");
                AttemptOutcome::Connected
            }
            Err(err) => {
                warn!(generation, error = %err, "connection: attempt failed");
                self.publish(ConnectionState::Error(err.to_string()));
                if manual {
                    self.schedule_reconnect(&mut inner);
                }
                AttemptOutcome::Failed
            }
        }
    }

    fn spawn_reader(
        self: &Arc<Self>,
        generation: u64,
        mut inbound: mpsc::Receiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let reason = loop {
                match inbound.recv().await {
                    Some(TransportEvent::Frame(frame)) => {
                        let _ = manager.inbound.send(frame);
                    }
                    Some(TransportEvent::Closed { reason }) => break reason,
                    None => break "transport stream ended".to_string(),
                }
            };
            manager.handle_transport_loss(generation, reason, true).await;
        })
    }

    async fn handle_transport_loss(
        self: &Arc<Self>,
        generation: u64,
        reason: String,
        from_reader: bool,
    ) {
        let transport = {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation || !self.state.borrow().is_connected() {
                return;
            }
            inner.generation += 1;
            if let Some(task) = inner.reader_task.take() {
                // The reader reports its own loss and finishes on its own.
                if !from_reader {
                    task.abort();
                }
            }
            warn!(%reason, "connection: transport lost");
            self.publish(ConnectionState::Error(reason));
            self.schedule_reconnect(&mut inner);
            inner.transport.take()
        };
        if let Some(transport) = transport {
            transport.close().await;
        }
    }

    /// Must run under the `inner` lock so a concurrent `disconnect` either
    /// happens before (and the task is never spawned) or after (and aborts it).
    fn schedule_reconnect(self: &Arc<Self>, inner: &mut ConnectionInner) {
        if inner
            .reconnect_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
        {
            return;
        }
        let manager = Arc::clone(self);
        inner.reconnect_task = Some(tokio::spawn(async move {
            manager.reconnect_loop().await;
        }));
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let policy = self.options.backoff.clone();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if policy.max_attempts.is_some_and(|max| attempt > max) {
                warn!(attempts = attempt - 1, "connection: giving up on reconnect");
                return;
            }
            let delay = policy.next_delay(attempt);
            info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "connection: reconnect scheduled"
            );
            tokio::time::sleep(delay).await;
            match self.attempt_connect(false).await {
                AttemptOutcome::Failed => continue,
                AttemptOutcome::Connected
                | AttemptOutcome::Superseded
                | AttemptOutcome::Skipped => return,
            }
        }
    }

    fn publish(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next.clone();
                true
            }
        });
        if changed {
            debug!(state = %next, "connection: state changed");
            let _ = self.transitions.send(next);
        }
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
