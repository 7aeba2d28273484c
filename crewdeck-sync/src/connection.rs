//! Connection manager: transport lifecycle for the sync WebSocket.
//!
//! One [`Connection`] per process, constructed once at app start and handed
//! to every consumer as an `Arc` — there is deliberately no global singleton.
//!
//! Provides:
//! - connect / authenticate / disconnect
//! - automatic reconnect with a bounded attempt count and a fixed delay
//!   (fixed, not exponential — preserved from the observed design; backoff
//!   growth would be a possible improvement)
//! - an outbound FIFO queue replayed in order on the next successful connect
//!
//! ```text
//! connect(token)                      transport failure
//!       │                                   │
//!       ▼                                   ▼
//! ┌───────────┐   established   ┌───────────────────┐
//! │ Connecting│ ──────────────► │     Connected      │
//! └───────────┘                 └─────────┬─────────┘
//!       ▲                                 │ drop / server close
//!       │ fresh token                     ▼
//! ┌───────────┐   attempts ≤ N  ┌───────────────────┐
//! │Disconnectd│ ◄────────────── │    Reconnecting    │
//! └───────────┘    exhausted    └───────────────────┘
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{ProtocolError, WireMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the connection manager.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Transport established, queue flushed — dependents may resync.
    Connected,
    /// Transport lost (a reconnect may already be underway).
    Disconnected,
    /// The bounded reconnect attempts were exhausted. Not fatal: a later
    /// `connect` with a fresh token starts over.
    RetriesExhausted,
    /// A decoded inbound message.
    Inbound(WireMessage),
}

/// Connection manager configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket endpoint, e.g. `ws://127.0.0.1:9090/sync`.
    pub server_url: String,
    /// Bounded automatic reconnect attempts after a transport failure.
    pub max_reconnect_attempts: u32,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Maximum number of outbound messages held while disconnected.
    pub outbound_queue_limit: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(2),
            outbound_queue_limit: 10_000,
        }
    }
}

/// Connection errors.
#[derive(Debug)]
pub enum ConnectionError {
    Transport(String),
    Protocol(ProtocolError),
    /// The offline queue hit its capacity bound.
    QueueFull,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::QueueFull => write!(f, "outbound queue full"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

/// FIFO queue of outbound messages held while disconnected.
///
/// Single-writer, single-reader, local to one client. Replayed in original
/// enqueue order on the next successful connect.
pub struct OutboundQueue {
    queue: VecDeque<WireMessage>,
    limit: usize,
    bytes: usize,
}

impl OutboundQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(limit.min(1024)),
            limit,
            bytes: 0,
        }
    }

    /// Enqueue for later replay. Returns `false` when full.
    pub fn enqueue(&mut self, msg: WireMessage) -> bool {
        if self.queue.len() >= self.limit {
            return false;
        }
        self.bytes += msg.encode().map(|b| b.len()).unwrap_or(0);
        self.queue.push_back(msg);
        true
    }

    /// Drain all queued messages in enqueue order.
    pub fn drain(&mut self) -> Vec<WireMessage> {
        self.bytes = 0;
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.bytes = 0;
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Total wire size of the queued messages.
    pub fn total_bytes(&self) -> usize {
        self.bytes
    }
}

/// Why the reader task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DropReason {
    /// Server sent a Close frame — reconnect immediately.
    ServerClose,
    /// Network-level failure — reconnect after the fixed delay.
    TransportLost,
}

struct ConnectionInner {
    user_id: Uuid,
    config: ConnectionConfig,
    state: RwLock<ConnectionState>,
    queue: Mutex<OutboundQueue>,
    outgoing: RwLock<Option<mpsc::Sender<Vec<u8>>>>,
    token: RwLock<Option<String>>,
    /// Transient per-connect identity; regenerated every time the transport
    /// is (re)established.
    socket_id: RwLock<Option<Uuid>>,
    event_tx: mpsc::Sender<ConnectionEvent>,
    /// Bumped on every deliberate teardown or fresh connect so that tasks
    /// belonging to an old transport generation become inert.
    epoch: AtomicU64,
    /// Wakes a reader task parked on the socket when `disconnect` tears the
    /// transport down.
    teardown: Notify,
}

/// The connection manager.
pub struct Connection {
    inner: Arc<ConnectionInner>,
    event_rx: Option<mpsc::Receiver<ConnectionEvent>>,
}

impl Connection {
    pub fn new(user_id: Uuid, config: ConnectionConfig) -> Self {
        let limit = config.outbound_queue_limit;
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            inner: Arc::new(ConnectionInner {
                user_id,
                config,
                state: RwLock::new(ConnectionState::Disconnected),
                queue: Mutex::new(OutboundQueue::new(limit)),
                outgoing: RwLock::new(None),
                token: RwLock::new(None),
                socket_id: RwLock::new(None),
                event_tx,
                epoch: AtomicU64::new(0),
                teardown: Notify::new(),
            }),
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ConnectionEvent>> {
        self.event_rx.take()
    }

    pub fn user_id(&self) -> Uuid {
        self.inner.user_id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        *self.inner.state.read().await == ConnectionState::Connected
    }

    /// Transient socket identity of the current transport, if connected.
    pub async fn socket_id(&self) -> Option<Uuid> {
        *self.inner.socket_id.read().await
    }

    pub async fn queued_len(&self) -> usize {
        self.inner.queue.lock().await.len()
    }

    /// Establish the transport, authenticated by `token`.
    ///
    /// A second call while already connected or connecting is a no-op. On
    /// success the outbound queue is flushed in FIFO order and
    /// [`ConnectionEvent::Connected`] is emitted.
    ///
    /// A failed initial connect is returned to the caller and not retried;
    /// the automatic reconnect loop only guards an established transport
    /// that drops later.
    pub async fn connect(&self, token: &str) -> Result<(), ConnectionError> {
        {
            let mut state = self.inner.state.write().await;
            match *state {
                ConnectionState::Connected | ConnectionState::Connecting => return Ok(()),
                _ => *state = ConnectionState::Connecting,
            }
        }
        *self.inner.token.write().await = Some(token.to_string());

        // Invalidate any reconnect loop still running for an old generation.
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        match Self::establish(&self.inner, epoch).await {
            Ok(()) => Ok(()),
            Err(e) => {
                *self.inner.state.write().await = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Tear down the transport, clear the outbound queue, suppress automatic
    /// reconnects. Idempotent.
    ///
    /// Dropping the outgoing sender ends the writer task, which sends a
    /// Close frame on its way out so the server sees the departure instead
    /// of a half-open socket.
    pub async fn disconnect(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.teardown.notify_one();
        *self.inner.state.write().await = ConnectionState::Disconnected;
        *self.inner.outgoing.write().await = None;
        *self.inner.socket_id.write().await = None;
        self.inner.queue.lock().await.clear();
    }

    /// Send immediately when connected, otherwise enqueue for replay.
    ///
    /// Sends hold the queue lock, so a fresh message can never reach the
    /// wire ahead of older messages still waiting to be replayed.
    pub async fn send(&self, msg: WireMessage) -> Result<(), ConnectionError> {
        let mut queue = self.inner.queue.lock().await;
        if queue.is_empty() && *self.inner.state.read().await == ConnectionState::Connected {
            let tx = self.inner.outgoing.read().await.clone();
            if let Some(tx) = tx {
                let encoded = msg.encode()?;
                if tx.send(encoded).await.is_ok() {
                    return Ok(());
                }
                // Writer went away under us; fall through to the queue.
            }
        }
        if !queue.enqueue(msg) {
            return Err(ConnectionError::QueueFull);
        }
        Ok(())
    }

    /// Send only when connected; silently dropped otherwise. For ephemeral
    /// traffic (awareness, typing, room leaves) that is pointless to replay.
    pub async fn send_volatile(&self, msg: WireMessage) -> Result<(), ConnectionError> {
        if *self.inner.state.read().await != ConnectionState::Connected {
            log::trace!("dropping volatile message while offline");
            return Ok(());
        }
        let tx = self.inner.outgoing.read().await.clone();
        if let Some(tx) = tx {
            let encoded = msg.encode()?;
            let _ = tx.send(encoded).await;
        }
        Ok(())
    }

    /// Open the WebSocket, authenticate, flush the queue, spawn the
    /// writer/reader tasks for generation `epoch`.
    async fn establish(inner: &Arc<ConnectionInner>, epoch: u64) -> Result<(), ConnectionError> {
        let url = inner.config.server_url.clone();
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
        if inner.epoch.load(Ordering::SeqCst) != epoch {
            // A newer connect or disconnect superseded this generation
            // while the handshake was in flight.
            return Err(ConnectionError::Transport("connection superseded".into()));
        }
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);

        // Writer task: forward the outgoing channel to the socket. When the
        // last sender is dropped (deliberate teardown) the server gets a
        // Close frame rather than a silently abandoned socket.
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        // Authenticate before anything queued goes out.
        let token = inner
            .token
            .read()
            .await
            .clone()
            .unwrap_or_default();
        let hello = WireMessage::Hello {
            token,
            user_id: inner.user_id,
        };
        out_tx
            .send(hello.encode()?)
            .await
            .map_err(|_| ConnectionError::Transport("writer task gone".into()))?;

        *inner.socket_id.write().await = Some(Uuid::new_v4());

        // Replay the offline queue in original enqueue order, then flip to
        // Connected while still holding the queue lock. send() takes the
        // same lock, so nothing can interleave between the replay and the
        // state change.
        {
            let mut queue = inner.queue.lock().await;
            let queued = queue.drain();
            if !queued.is_empty() {
                log::info!("replaying {} queued messages", queued.len());
                for msg in queued {
                    match msg.encode() {
                        Ok(encoded) => {
                            let _ = out_tx.send(encoded).await;
                        }
                        Err(e) => log::warn!("dropping unencodable queued message: {e}"),
                    }
                }
            }
            *inner.outgoing.write().await = Some(out_tx.clone());
            *inner.state.write().await = ConnectionState::Connected;
        }

        let _ = inner.event_tx.send(ConnectionEvent::Connected).await;

        // Reader task: decode inbound frames, detect transport loss, exit
        // on a deliberate teardown.
        let inner_task = inner.clone();
        tokio::spawn(async move {
            let mut reason = DropReason::TransportLost;
            loop {
                let frame = tokio::select! {
                    frame = ws_reader.next() => frame,
                    _ = inner_task.teardown.notified() => {
                        if inner_task.epoch.load(Ordering::SeqCst) == epoch {
                            // Stale permit from an earlier teardown.
                            continue;
                        }
                        break;
                    }
                };
                let Some(msg) = frame else { break };
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match WireMessage::decode(&bytes) {
                            Ok(WireMessage::Ping) => {
                                // Keepalive handled here, not surfaced.
                                if let Some(tx) = inner_task.outgoing.read().await.clone() {
                                    if let Ok(pong) = WireMessage::Pong.encode() {
                                        let _ = tx.send(pong).await;
                                    }
                                }
                            }
                            Ok(decoded) => {
                                let _ = inner_task
                                    .event_tx
                                    .send(ConnectionEvent::Inbound(decoded))
                                    .await;
                            }
                            Err(e) => log::warn!("undecodable inbound frame: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) => {
                        reason = DropReason::ServerClose;
                        break;
                    }
                    Err(e) => {
                        log::warn!("websocket read error: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            if inner_task.epoch.load(Ordering::SeqCst) != epoch {
                // Deliberate teardown (disconnect or fresh connect) — this
                // generation is already dead, nothing to report.
                return;
            }

            *inner_task.state.write().await = ConnectionState::Disconnected;
            *inner_task.outgoing.write().await = None;
            *inner_task.socket_id.write().await = None;
            let _ = inner_task.event_tx.send(ConnectionEvent::Disconnected).await;

            log::info!("connection lost ({reason:?}), starting reconnect");
            Self::reconnect_loop(inner_task, epoch, reason == DropReason::ServerClose).await;
        });

        Ok(())
    }

    /// Type-erased front for [`Self::establish`]. The reader task awaits
    /// the reconnect loop which awaits `establish` again; boxing this edge
    /// keeps the mutual recursion out of the spawned future's type.
    fn establish_boxed(
        inner: Arc<ConnectionInner>,
        epoch: u64,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConnectionError>> + Send>> {
        Box::pin(async move { Self::establish(&inner, epoch).await })
    }

    /// Bounded reconnect attempts with a fixed delay between them. A
    /// server-initiated close retries immediately on the first attempt.
    async fn reconnect_loop(inner: Arc<ConnectionInner>, epoch: u64, mut immediate: bool) {
        *inner.state.write().await = ConnectionState::Reconnecting;

        let max = inner.config.max_reconnect_attempts;
        for attempt in 1..=max {
            if !immediate {
                tokio::time::sleep(inner.config.reconnect_delay).await;
            }
            immediate = false;

            if inner.epoch.load(Ordering::SeqCst) != epoch {
                return;
            }

            match Self::establish_boxed(inner.clone(), epoch).await {
                Ok(()) => return,
                Err(e) => log::warn!("reconnect attempt {attempt}/{max} failed: {e}"),
            }
        }

        if inner.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        *inner.state.write().await = ConnectionState::Disconnected;
        let _ = inner.event_tx.send(ConnectionEvent::RetriesExhausted).await;
        log::warn!("reconnect attempts exhausted; waiting for a fresh connect()");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(i: u8) -> WireMessage {
        WireMessage::DocumentUpdate {
            document_id: Uuid::nil(),
            update: vec![i],
        }
    }

    #[test]
    fn test_config_default() {
        let config = ConnectionConfig::default();
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.reconnect_delay, Duration::from_secs(2));
        assert_eq!(config.outbound_queue_limit, 10_000);
    }

    #[test]
    fn test_outbound_queue_fifo() {
        let mut queue = OutboundQueue::new(100);
        assert!(queue.is_empty());

        queue.enqueue(msg(1));
        queue.enqueue(msg(2));
        queue.enqueue(msg(3));
        assert_eq!(queue.len(), 3);

        assert!(queue.total_bytes() > 0);
        let drained = queue.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(queue.total_bytes(), 0);
        for (i, m) in drained.iter().enumerate() {
            match m {
                WireMessage::DocumentUpdate { update, .. } => {
                    assert_eq!(update[0], (i + 1) as u8)
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_outbound_queue_capacity() {
        let mut queue = OutboundQueue::new(2);
        assert!(queue.enqueue(msg(1)));
        assert!(queue.enqueue(msg(2)));
        assert!(!queue.enqueue(msg(3)));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.limit(), 2);
    }

    #[test]
    fn test_outbound_queue_clear() {
        let mut queue = OutboundQueue::new(10);
        queue.enqueue(msg(1));
        queue.clear();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_initial_state() {
        let conn = Connection::new(Uuid::new_v4(), ConnectionConfig::default());
        assert_eq!(conn.state().await, ConnectionState::Disconnected);
        assert!(!conn.is_connected().await);
        assert!(conn.socket_id().await.is_none());
        assert_eq!(conn.queued_len().await, 0);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_queues_in_order() {
        let conn = Connection::new(Uuid::new_v4(), ConnectionConfig::default());
        conn.send(msg(1)).await.unwrap();
        conn.send(msg(2)).await.unwrap();
        conn.send(msg(3)).await.unwrap();
        assert_eq!(conn.queued_len().await, 3);
    }

    #[tokio::test]
    async fn test_send_volatile_dropped_while_disconnected() {
        let conn = Connection::new(Uuid::new_v4(), ConnectionConfig::default());
        conn.send_volatile(msg(1)).await.unwrap();
        assert_eq!(conn.queued_len().await, 0);
    }

    #[tokio::test]
    async fn test_queue_full_error() {
        let config = ConnectionConfig {
            outbound_queue_limit: 1,
            ..ConnectionConfig::default()
        };
        let conn = Connection::new(Uuid::new_v4(), config);
        conn.send(msg(1)).await.unwrap();
        match conn.send(msg(2)).await {
            Err(ConnectionError::QueueFull) => {}
            other => panic!("expected QueueFull, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_clears_queue() {
        let conn = Connection::new(Uuid::new_v4(), ConnectionConfig::default());
        conn.send(msg(1)).await.unwrap();
        conn.disconnect().await;
        conn.disconnect().await;
        assert_eq!(conn.state().await, ConnectionState::Disconnected);
        assert_eq!(conn.queued_len().await, 0);
    }

    #[tokio::test]
    async fn test_connect_refused_reports_transport_error() {
        // Nothing listens on the discard port.
        let config = ConnectionConfig {
            server_url: "ws://127.0.0.1:9".to_string(),
            ..ConnectionConfig::default()
        };
        let conn = Connection::new(Uuid::new_v4(), config);
        match conn.connect("token").await {
            Err(ConnectionError::Transport(_)) => {}
            other => panic!("expected Transport error, got {other:?}"),
        }
        assert_eq!(conn.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_take_event_rx_once() {
        let mut conn = Connection::new(Uuid::new_v4(), ConnectionConfig::default());
        assert!(conn.take_event_rx().is_some());
        assert!(conn.take_event_rx().is_none());
    }
}
