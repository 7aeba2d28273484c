//! Live editing session for one collaborative document.
//!
//! The replicated state is a yrs document with a single root text. Local
//! edits go through [`DocumentSession::insert`]/[`DocumentSession::delete`],
//! which produce incremental updates forwarded to the connection; inbound
//! snapshots and updates are merged in via [`DocumentSession::handle`].
//! Merge is commutative and idempotent, so the session never needs to
//! sequence concurrent edits itself.
//!
//! ```text
//!          local edit                      inbound DocumentUpdate
//!              │                                    │
//!              ▼                                    ▼
//!        ┌──────────┐  observe_update_v1    ┌──────────────┐
//!        │ yrs Doc  │ ────────────────────► │ update relay │──► Connection
//!        └──────────┘   (origin-gated)      └──────────────┘
//! ```
//!
//! The update observer fires for *every* transaction, including ones that
//! apply a remote update. The `applying_remote` flag marks those
//! transactions so their updates are not echoed back to the server.
//!
//! Session lifecycle: `Joining` until the room join is acknowledged,
//! `Syncing` until the server's one-shot snapshot lands, then `Ready`. A
//! reconnect starts the cycle over via [`DocumentSession::resync`] and waits
//! for a fresh snapshot; merging it is idempotent, so edits made while
//! offline survive.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use uuid::Uuid;

use yrs::updates::decoder::Decode;
use yrs::{
    Doc, GetString, ReadTxn, StateVector, Subscription, Text, TextRef, Transact, Update,
};

use crate::connection::{Connection, ConnectionError};
use crate::protocol::{AwarenessState, WireMessage};
use crate::rooms::RoomCoordinator;

/// Name of the root shared text inside the replicated document.
const ROOT_TEXT: &str = "content";

/// Lifecycle of a document session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Join sent, waiting for the initial snapshot.
    Joining,
    /// Reconnected, waiting for a fresh snapshot.
    Syncing,
    /// Snapshot applied; local editing enabled.
    Ready,
    /// Session closed; all further messages are ignored.
    Closed,
}

/// Session errors.
#[derive(Debug)]
pub enum SessionError {
    /// Local editing attempted before the snapshot landed (or after close).
    NotReady(SessionState),
    /// Index past the end of the text.
    OutOfRange { index: u32, len: u32 },
    /// Index inside a multi-byte character rather than on a boundary.
    NotCharBoundary { index: u32 },
    Crdt(String),
    Connection(ConnectionError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotReady(state) => write!(f, "session not ready for edits ({state:?})"),
            Self::OutOfRange { index, len } => {
                write!(f, "index {index} out of range (len {len})")
            }
            Self::NotCharBoundary { index } => {
                write!(f, "index {index} is not a character boundary")
            }
            Self::Crdt(e) => write!(f, "crdt error: {e}"),
            Self::Connection(e) => write!(f, "connection error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ConnectionError> for SessionError {
    fn from(e: ConnectionError) -> Self {
        SessionError::Connection(e)
    }
}

/// Session counters, read via [`DocumentSession::stats`].
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    /// Remote updates merged in (snapshots included).
    pub updates_applied: u64,
    /// Local updates shipped to the connection.
    pub updates_sent: u64,
    /// Inbound updates that failed to decode and were skipped.
    pub updates_rejected: u64,
}

struct AtomicSessionStats {
    updates_applied: AtomicU64,
    updates_sent: AtomicU64,
    updates_rejected: AtomicU64,
}

/// One client's handle on a live collaborative document.
pub struct DocumentSession {
    document_id: Uuid,
    workspace_id: Uuid,
    conn: Arc<Connection>,
    doc: Doc,
    text: TextRef,
    state: RwLock<SessionState>,
    /// One-shot guard: the initial snapshot is applied exactly once per
    /// (re)join, duplicates are logged and skipped.
    snapshot_applied: AtomicBool,
    /// Set for the duration of a transaction that applies a remote update,
    /// so the update observer does not echo it back.
    applying_remote: Arc<AtomicBool>,
    /// Last known cursor/selection per *remote* user.
    awareness: RwLock<HashMap<Uuid, AwarenessState>>,
    stats: Arc<AtomicSessionStats>,
    _update_sub: Subscription,
}

impl DocumentSession {
    /// Set up the replicated document and the outbound update relay.
    ///
    /// Joining the document room is the [`RoomCoordinator`]'s job; a typical
    /// caller creates the session and then calls
    /// [`RoomCoordinator::join_document`] with the same ids.
    pub fn new(
        conn: Arc<Connection>,
        document_id: Uuid,
        workspace_id: Uuid,
    ) -> Result<Self, SessionError> {
        let doc = Doc::new();
        let text = doc.get_or_insert_text(ROOT_TEXT);

        let applying_remote = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(AtomicSessionStats {
            updates_applied: AtomicU64::new(0),
            updates_sent: AtomicU64::new(0),
            updates_rejected: AtomicU64::new(0),
        });

        let (update_tx, mut update_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let observer_flag = applying_remote.clone();
        let update_sub = doc
            .observe_update_v1(move |_txn, event| {
                if !observer_flag.load(Ordering::SeqCst) {
                    let _ = update_tx.send(event.update.clone());
                }
            })
            .map_err(|e| SessionError::Crdt(e.to_string()))?;

        // Relay task: ship each local update as an incremental message.
        // While offline they land in the outbound queue and replay in order.
        let relay_conn = conn.clone();
        let relay_stats = stats.clone();
        tokio::spawn(async move {
            while let Some(update) = update_rx.recv().await {
                let msg = WireMessage::DocumentUpdate {
                    document_id,
                    update,
                };
                match relay_conn.send(msg).await {
                    Ok(()) => {
                        relay_stats.updates_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => log::warn!("failed to ship document update: {e}"),
                }
            }
        });

        Ok(Self {
            document_id,
            workspace_id,
            conn,
            doc,
            text,
            state: RwLock::new(SessionState::Joining),
            snapshot_applied: AtomicBool::new(false),
            applying_remote,
            awareness: RwLock::new(HashMap::new()),
            stats,
            _update_sub: update_sub,
        })
    }

    /// Create the session and join its document room in one step.
    pub async fn open(
        conn: Arc<Connection>,
        rooms: &RoomCoordinator,
        document_id: Uuid,
        workspace_id: Uuid,
    ) -> Result<Self, SessionError> {
        let session = Self::new(conn, document_id, workspace_id)?;
        rooms.join_document(document_id, workspace_id).await?;
        Ok(session)
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub fn workspace_id(&self) -> Uuid {
        self.workspace_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    fn set_state(&self, state: SessionState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Apply an inbound message addressed to this document. Returns `true`
    /// if it was consumed, `false` if it is not this session's business.
    pub fn handle(&self, msg: &WireMessage) -> bool {
        if self.state() == SessionState::Closed {
            return false;
        }
        match msg {
            // Join acknowledgment: the snapshot is on its way. The roster
            // itself belongs to the room coordinator, so this is observed
            // without being consumed.
            WireMessage::RoomMembers {
                room: crate::protocol::RoomId::Document(document_id),
                ..
            } if *document_id == self.document_id => {
                if self.state() == SessionState::Joining {
                    self.set_state(SessionState::Syncing);
                }
                false
            }
            WireMessage::DocumentSync {
                document_id,
                update,
            } if *document_id == self.document_id => {
                if self.snapshot_applied.swap(true, Ordering::SeqCst) {
                    log::warn!(
                        "duplicate snapshot for {} ignored",
                        self.document_id
                    );
                    return true;
                }
                self.apply_remote(update);
                self.set_state(SessionState::Ready);
                log::info!("document {} synced", self.document_id);
                true
            }
            WireMessage::DocumentUpdate {
                document_id,
                update,
            } if *document_id == self.document_id => {
                // Updates racing ahead of the snapshot are applied as they
                // arrive; merge idempotence makes the later snapshot safe.
                self.apply_remote(update);
                true
            }
            WireMessage::DocumentAwareness {
                document_id,
                user_id,
                state,
            } if *document_id == self.document_id => {
                if *user_id != self.conn.user_id() {
                    self.awareness
                        .write()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(*user_id, state.clone());
                }
                true
            }
            WireMessage::DocumentUserLeft {
                document_id,
                user_id,
            } if *document_id == self.document_id => {
                self.awareness
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(user_id);
                true
            }
            _ => false,
        }
    }

    /// Merge a remote binary update into the document. Malformed or
    /// unappliable updates are logged and skipped, never fatal.
    fn apply_remote(&self, bytes: &[u8]) {
        let update = match Update::decode_v1(bytes) {
            Ok(update) => update,
            Err(e) => {
                self.stats.updates_rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("malformed update for {}: {e}", self.document_id);
                return;
            }
        };
        self.applying_remote.store(true, Ordering::SeqCst);
        {
            let mut txn = self.doc.transact_mut();
            if let Err(e) = txn.apply_update(update) {
                self.stats.updates_rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("failed to apply update for {}: {e}", self.document_id);
            } else {
                self.stats.updates_applied.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.applying_remote.store(false, Ordering::SeqCst);
    }

    /// Offsets are byte positions into the UTF-8 text. An offset inside a
    /// multi-byte character would corrupt the shared buffer, so it is
    /// rejected before it reaches the document.
    fn check_offset(content: &str, index: u32) -> Result<(), SessionError> {
        let len = content.len() as u32;
        if index > len {
            return Err(SessionError::OutOfRange { index, len });
        }
        if !content.is_char_boundary(index as usize) {
            return Err(SessionError::NotCharBoundary { index });
        }
        Ok(())
    }

    /// Insert `chunk` at byte offset `index`, which must lie on a character
    /// boundary. Ready sessions only.
    pub fn insert(&self, index: u32, chunk: &str) -> Result<(), SessionError> {
        let state = self.state();
        if state != SessionState::Ready {
            return Err(SessionError::NotReady(state));
        }
        let mut txn = self.doc.transact_mut();
        let content = self.text.get_string(&txn);
        Self::check_offset(&content, index)?;
        self.text.insert(&mut txn, index, chunk);
        Ok(())
    }

    /// Delete the bytes from offset `index` to `index + len`, clamped to
    /// the end of the text. Both ends must lie on character boundaries.
    /// Ready sessions only.
    pub fn delete(&self, index: u32, len: u32) -> Result<(), SessionError> {
        let state = self.state();
        if state != SessionState::Ready {
            return Err(SessionError::NotReady(state));
        }
        let mut txn = self.doc.transact_mut();
        let content = self.text.get_string(&txn);
        Self::check_offset(&content, index)?;
        let end = index.saturating_add(len).min(content.len() as u32);
        Self::check_offset(&content, end)?;
        if end > index {
            self.text.remove_range(&mut txn, index, end - index);
        }
        Ok(())
    }

    /// Replace the bytes from offset `index` to `index + len` with `chunk`
    /// in one transaction, so remote peers never observe the intermediate
    /// deletion. Both ends must lie on character boundaries.
    pub fn replace(&self, index: u32, len: u32, chunk: &str) -> Result<(), SessionError> {
        let state = self.state();
        if state != SessionState::Ready {
            return Err(SessionError::NotReady(state));
        }
        let mut txn = self.doc.transact_mut();
        let content = self.text.get_string(&txn);
        Self::check_offset(&content, index)?;
        let end = index.saturating_add(len).min(content.len() as u32);
        Self::check_offset(&content, end)?;
        if end > index {
            self.text.remove_range(&mut txn, index, end - index);
        }
        self.text.insert(&mut txn, index, chunk);
        Ok(())
    }

    /// Current text content.
    pub fn content(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    /// Full document state as a single binary update (for persistence).
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Broadcast our cursor/selection. Volatile: dropped while offline,
    /// stale positions are worthless after a reconnect anyway.
    pub async fn update_awareness(&self, state: AwarenessState) -> Result<(), SessionError> {
        self.conn
            .send_volatile(WireMessage::DocumentAwareness {
                document_id: self.document_id,
                user_id: self.conn.user_id(),
                state,
            })
            .await?;
        Ok(())
    }

    /// Last known cursor/selection per remote user.
    pub fn awareness(&self) -> HashMap<Uuid, AwarenessState> {
        self.awareness
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Re-arm the session after a reconnect: back to `Joining`, expect a
    /// fresh snapshot, drop stale peer cursors. Call alongside
    /// [`RoomCoordinator::resync`], which re-sends the document join. Edits
    /// made while offline stay in the local document and survive the
    /// snapshot merge.
    pub fn resync(&self) {
        if self.state() == SessionState::Closed {
            return;
        }
        self.snapshot_applied.store(false, Ordering::SeqCst);
        self.set_state(SessionState::Joining);
        self.awareness
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Leave the document room and stop accepting messages and edits.
    pub async fn close(&self, rooms: &RoomCoordinator) -> Result<(), SessionError> {
        self.set_state(SessionState::Closed);
        self.awareness
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        rooms.leave_document(self.document_id).await?;
        Ok(())
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            updates_applied: self.stats.updates_applied.load(Ordering::Relaxed),
            updates_sent: self.stats.updates_sent.load(Ordering::Relaxed),
            updates_rejected: self.stats.updates_rejected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfig;
    use crate::protocol::UserBadge;
    use std::time::Duration;

    fn session() -> (DocumentSession, Arc<Connection>) {
        let conn = Arc::new(Connection::new(
            Uuid::new_v4(),
            ConnectionConfig::default(),
        ));
        let session =
            DocumentSession::new(conn.clone(), Uuid::new_v4(), Uuid::new_v4()).unwrap();
        (session, conn)
    }

    /// Encode `content` as a full-state update from a fresh peer document.
    fn snapshot_of(content: &str) -> Vec<u8> {
        let doc = Doc::new();
        let text = doc.get_or_insert_text(ROOT_TEXT);
        {
            let mut txn = doc.transact_mut();
            text.insert(&mut txn, 0, content);
        }
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    #[tokio::test]
    async fn test_starts_joining_and_empty() {
        let (session, _conn) = session();
        assert_eq!(session.state(), SessionState::Joining);
        assert!(!session.is_ready());
        assert_eq!(session.content(), "");
    }

    #[tokio::test]
    async fn test_snapshot_transitions_to_ready() {
        let (session, _conn) = session();
        let handled = session.handle(&WireMessage::DocumentSync {
            document_id: session.document_id(),
            update: snapshot_of("hello"),
        });
        assert!(handled);
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.content(), "hello");
    }

    #[tokio::test]
    async fn test_duplicate_snapshot_is_skipped() {
        let (session, _conn) = session();
        session.handle(&WireMessage::DocumentSync {
            document_id: session.document_id(),
            update: snapshot_of("first"),
        });
        session.handle(&WireMessage::DocumentSync {
            document_id: session.document_id(),
            update: snapshot_of("second"),
        });
        assert_eq!(session.content(), "first");
        assert_eq!(session.stats().updates_applied, 1);
    }

    #[tokio::test]
    async fn test_update_before_snapshot_is_applied() {
        let (session, _conn) = session();
        session.handle(&WireMessage::DocumentUpdate {
            document_id: session.document_id(),
            update: snapshot_of("early"),
        });
        // Still joining, but the state already merged.
        assert_eq!(session.state(), SessionState::Joining);
        assert_eq!(session.content(), "early");
    }

    #[tokio::test]
    async fn test_open_joins_the_room() {
        let conn = Arc::new(Connection::new(
            Uuid::new_v4(),
            ConnectionConfig::default(),
        ));
        let rooms = RoomCoordinator::new(
            conn.clone(),
            crate::protocol::MemberProfile::new("Alice", "alice@example.com"),
        );
        let doc = Uuid::new_v4();
        let session = DocumentSession::open(conn, &rooms, doc, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Joining);
        assert_eq!(rooms.current_document().await, Some(doc));
    }

    #[tokio::test]
    async fn test_join_ack_moves_to_syncing() {
        let (session, _conn) = session();
        let ack = WireMessage::RoomMembers {
            room: crate::protocol::RoomId::Document(session.document_id()),
            members: vec![],
        };
        // Observed but not consumed: the roster belongs to the coordinator.
        assert!(!session.handle(&ack));
        assert_eq!(session.state(), SessionState::Syncing);

        // A board roster leaves the state alone.
        let (other, _conn) = self::session();
        assert!(!other.handle(&WireMessage::RoomMembers {
            room: crate::protocol::RoomId::Board(Uuid::new_v4()),
            members: vec![],
        }));
        assert_eq!(other.state(), SessionState::Joining);
    }

    #[tokio::test]
    async fn test_replace_is_one_transaction() {
        let (session, _conn) = session();
        session.handle(&WireMessage::DocumentSync {
            document_id: session.document_id(),
            update: snapshot_of("hello world"),
        });

        session.replace(6, 5, "crew").unwrap();
        assert_eq!(session.content(), "hello crew");

        match session.replace(99, 1, "x") {
            Err(SessionError::OutOfRange { .. }) => {}
            other => panic!("expected OutOfRange, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_other_documents_are_ignored() {
        let (session, _conn) = session();
        let handled = session.handle(&WireMessage::DocumentSync {
            document_id: Uuid::new_v4(),
            update: snapshot_of("not ours"),
        });
        assert!(!handled);
        assert_eq!(session.content(), "");
    }

    #[tokio::test]
    async fn test_edits_gated_until_ready() {
        let (session, _conn) = session();
        match session.insert(0, "nope") {
            Err(SessionError::NotReady(SessionState::Joining)) => {}
            other => panic!("expected NotReady, got {other:?}"),
        }
        assert!(session.delete(0, 1).is_err());
    }

    #[tokio::test]
    async fn test_local_edits_after_ready() {
        let (session, _conn) = session();
        session.handle(&WireMessage::DocumentSync {
            document_id: session.document_id(),
            update: snapshot_of(""),
        });

        session.insert(0, "hello world").unwrap();
        session.delete(5, 6).unwrap();
        assert_eq!(session.content(), "hello");
    }

    #[tokio::test]
    async fn test_insert_out_of_range() {
        let (session, _conn) = session();
        session.handle(&WireMessage::DocumentSync {
            document_id: session.document_id(),
            update: snapshot_of("ab"),
        });
        match session.insert(10, "x") {
            Err(SessionError::OutOfRange { index: 10, len: 2 }) => {}
            other => panic!("expected OutOfRange, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_delete_clamps_length() {
        let (session, _conn) = session();
        session.handle(&WireMessage::DocumentSync {
            document_id: session.document_id(),
            update: snapshot_of("abc"),
        });
        session.delete(1, 99).unwrap();
        assert_eq!(session.content(), "a");
    }

    #[tokio::test]
    async fn test_multibyte_offsets_rejected_not_panicking() {
        let (session, _conn) = session();
        session.handle(&WireMessage::DocumentSync {
            document_id: session.document_id(),
            update: snapshot_of("héllo"),
        });

        // Offset 2 lands inside the two-byte "é".
        match session.insert(2, "x") {
            Err(SessionError::NotCharBoundary { index: 2 }) => {}
            other => panic!("expected NotCharBoundary, got {other:?}"),
        }
        match session.delete(1, 1) {
            Err(SessionError::NotCharBoundary { index: 2 }) => {}
            other => panic!("expected NotCharBoundary, got {other:?}"),
        }
        match session.replace(2, 1, "z") {
            Err(SessionError::NotCharBoundary { index: 2 }) => {}
            other => panic!("expected NotCharBoundary, got {other:?}"),
        }
        assert_eq!(session.content(), "héllo");

        // Whole-character edits on the same text work normally.
        session.insert(3, "y").unwrap();
        assert_eq!(session.content(), "héyllo");
        session.delete(1, 2).unwrap();
        assert_eq!(session.content(), "hyllo");
    }

    #[tokio::test]
    async fn test_local_edit_is_relayed_to_connection() {
        let (session, conn) = session();
        session.handle(&WireMessage::DocumentSync {
            document_id: session.document_id(),
            update: snapshot_of(""),
        });
        session.insert(0, "typed").unwrap();

        // Offline, so the relayed update lands in the outbound queue.
        let mut queued = false;
        for _ in 0..100 {
            if conn.queued_len().await >= 1 {
                queued = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(queued, "local update was never relayed");
    }

    #[tokio::test]
    async fn test_remote_update_is_not_echoed() {
        let (session, conn) = session();
        session.handle(&WireMessage::DocumentSync {
            document_id: session.document_id(),
            update: snapshot_of("remote text"),
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(conn.queued_len().await, 0);
        assert_eq!(session.stats().updates_sent, 0);
    }

    #[tokio::test]
    async fn test_awareness_tracks_remote_peers_only() {
        let (session, conn) = session();
        let peer = Uuid::new_v4();

        session.handle(&WireMessage::DocumentAwareness {
            document_id: session.document_id(),
            user_id: peer,
            state: AwarenessState {
                cursor: Some(4),
                selection: None,
                user: UserBadge::new(peer, "Bob"),
            },
        });
        // Our own echo must not appear in the peer map.
        session.handle(&WireMessage::DocumentAwareness {
            document_id: session.document_id(),
            user_id: conn.user_id(),
            state: AwarenessState::idle(UserBadge::new(conn.user_id(), "Me")),
        });

        let awareness = session.awareness();
        assert_eq!(awareness.len(), 1);
        assert_eq!(awareness[&peer].cursor, Some(4));

        session.handle(&WireMessage::DocumentUserLeft {
            document_id: session.document_id(),
            user_id: peer,
        });
        assert!(session.awareness().is_empty());
    }

    #[tokio::test]
    async fn test_resync_rearms_snapshot_and_clears_awareness() {
        let (session, _conn) = session();
        let peer = Uuid::new_v4();
        // Server state, unchanged across the reconnect.
        let server_snapshot = snapshot_of("shared");
        session.handle(&WireMessage::DocumentSync {
            document_id: session.document_id(),
            update: server_snapshot.clone(),
        });
        session.handle(&WireMessage::DocumentAwareness {
            document_id: session.document_id(),
            user_id: peer,
            state: AwarenessState::idle(UserBadge::new(peer, "Bob")),
        });
        session.insert(6, " offline").unwrap();

        session.resync();
        assert_eq!(session.state(), SessionState::Joining);
        assert!(session.awareness().is_empty());

        // The fresh snapshot merges idempotently; offline edits survive.
        session.handle(&WireMessage::DocumentSync {
            document_id: session.document_id(),
            update: server_snapshot,
        });
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.content(), "shared offline");
    }

    #[tokio::test]
    async fn test_closed_session_ignores_everything() {
        let (session, conn) = session();
        let rooms = RoomCoordinator::new(
            conn,
            crate::protocol::MemberProfile::new("Alice", "alice@example.com"),
        );
        session.close(&rooms).await.unwrap();

        assert!(!session.handle(&WireMessage::DocumentSync {
            document_id: session.document_id(),
            update: snapshot_of("late"),
        }));
        assert!(session.insert(0, "x").is_err());
    }

    #[tokio::test]
    async fn test_encode_state_roundtrip() {
        let (session, _conn) = session();
        session.handle(&WireMessage::DocumentSync {
            document_id: session.document_id(),
            update: snapshot_of("persist me"),
        });

        let state = session.encode_state();
        let doc = Doc::new();
        let text = doc.get_or_insert_text(ROOT_TEXT);
        {
            let mut txn = doc.transact_mut();
            txn.apply_update(Update::decode_v1(&state).unwrap()).unwrap();
        }
        let txn = doc.transact();
        assert_eq!(text.get_string(&txn), "persist me");
    }
}
