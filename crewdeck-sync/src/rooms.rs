//! Room membership and presence rosters.
//!
//! A room is one board or one document. The server is the source of truth
//! for membership: joins are acknowledged with a full [`WireMessage::RoomMembers`]
//! roster, after which incremental joined/left messages keep it current.
//!
//! The coordinator tracks *desired* membership separately from *confirmed*
//! rosters. Desired membership survives a reconnect (the server forgets the
//! socket's rooms when it drops) and is replayed by [`RoomCoordinator::resync`].
//!
//! A client participates in at most one document room at a time; joining a
//! second document implicitly leaves the first.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::connection::{Connection, ConnectionError};
use crate::protocol::{MemberProfile, RoomId, WireMessage};

/// Tracks joined rooms and their presence rosters for one client.
pub struct RoomCoordinator {
    conn: Arc<Connection>,
    local: MemberProfile,
    /// Boards we want to be in, replayed on reconnect.
    boards: RwLock<HashSet<Uuid>>,
    /// The single document room we are in, with its workspace.
    document: RwLock<Option<(Uuid, Uuid)>>,
    /// Server-confirmed rosters, keyed by room.
    rosters: RwLock<HashMap<RoomId, Vec<MemberProfile>>>,
}

impl RoomCoordinator {
    pub fn new(conn: Arc<Connection>, local: MemberProfile) -> Self {
        Self {
            conn,
            local,
            boards: RwLock::new(HashSet::new()),
            document: RwLock::new(None),
            rosters: RwLock::new(HashMap::new()),
        }
    }

    pub fn local_member(&self) -> &MemberProfile {
        &self.local
    }

    /// Join a board room. Queued for replay if currently offline.
    pub async fn join_board(&self, board_id: Uuid) -> Result<(), ConnectionError> {
        self.boards.write().await.insert(board_id);
        self.conn.send(WireMessage::JoinBoard { board_id }).await
    }

    /// Leave a board room. The leave itself is volatile: if we are offline
    /// the server has already dropped us from the room.
    pub async fn leave_board(&self, board_id: Uuid) -> Result<(), ConnectionError> {
        self.boards.write().await.remove(&board_id);
        self.rosters.write().await.remove(&RoomId::Board(board_id));
        self.conn
            .send_volatile(WireMessage::LeaveBoard { board_id })
            .await
    }

    /// Join a document room, leaving any previously joined document first.
    pub async fn join_document(
        &self,
        document_id: Uuid,
        workspace_id: Uuid,
    ) -> Result<(), ConnectionError> {
        let previous = {
            let mut current = self.document.write().await;
            let previous = current.take().map(|(doc, _)| doc);
            *current = Some((document_id, workspace_id));
            previous
        };
        if let Some(prev) = previous.filter(|prev| *prev != document_id) {
            self.rosters.write().await.remove(&RoomId::Document(prev));
            self.conn
                .send_volatile(WireMessage::DocumentLeave { document_id: prev })
                .await?;
        }
        self.conn
            .send(WireMessage::DocumentJoin {
                document_id,
                workspace_id,
            })
            .await
    }

    /// Leave the current document room, if it is `document_id`.
    pub async fn leave_document(&self, document_id: Uuid) -> Result<(), ConnectionError> {
        {
            let mut current = self.document.write().await;
            match *current {
                Some((doc, _)) if doc == document_id => *current = None,
                _ => return Ok(()),
            }
        }
        self.rosters
            .write()
            .await
            .remove(&RoomId::Document(document_id));
        self.conn
            .send_volatile(WireMessage::DocumentLeave { document_id })
            .await
    }

    /// Apply an inbound presence message. Returns `true` if it was a
    /// presence message (handled), `false` if it belongs to someone else.
    pub async fn handle(&self, msg: &WireMessage) -> bool {
        match msg {
            WireMessage::RoomMembers { room, members } => {
                log::debug!("roster for {room}: {} members", members.len());
                self.rosters.write().await.insert(*room, members.clone());
                true
            }
            WireMessage::MemberJoined { room, member } => {
                self.roster_add(*room, member.clone()).await;
                true
            }
            WireMessage::MemberLeft { room, user_id } => {
                self.roster_remove(*room, *user_id).await;
                true
            }
            WireMessage::DocumentUserJoined {
                document_id,
                member,
            } => {
                self.roster_add(RoomId::Document(*document_id), member.clone())
                    .await;
                true
            }
            WireMessage::DocumentUserLeft {
                document_id,
                user_id,
            } => {
                self.roster_remove(RoomId::Document(*document_id), *user_id)
                    .await;
                true
            }
            _ => false,
        }
    }

    async fn roster_add(&self, room: RoomId, mut member: MemberProfile) {
        member.touch();
        let mut rosters = self.rosters.write().await;
        let roster = rosters.entry(room).or_default();
        // Rejoin replaces the stale entry.
        roster.retain(|m| m.id != member.id);
        roster.push(member);
    }

    async fn roster_remove(&self, room: RoomId, user_id: Uuid) {
        if let Some(roster) = self.rosters.write().await.get_mut(&room) {
            roster.retain(|m| m.id != user_id);
        }
    }

    /// Confirmed roster for `room` (empty if unknown).
    pub async fn members(&self, room: RoomId) -> Vec<MemberProfile> {
        self.rosters
            .read()
            .await
            .get(&room)
            .cloned()
            .unwrap_or_default()
    }

    /// The document room we are currently in, if any.
    pub async fn current_document(&self) -> Option<Uuid> {
        self.document.read().await.map(|(doc, _)| doc)
    }

    /// Desired board memberships.
    pub async fn joined_boards(&self) -> Vec<Uuid> {
        self.boards.read().await.iter().copied().collect()
    }

    /// Every room we want to be in, boards and document alike.
    pub async fn joined_rooms(&self) -> Vec<RoomId> {
        let mut rooms: Vec<RoomId> = self
            .boards
            .read()
            .await
            .iter()
            .map(|id| RoomId::Board(*id))
            .collect();
        if let Some((doc, _)) = *self.document.read().await {
            rooms.push(RoomId::Document(doc));
        }
        rooms
    }

    /// Re-send every desired join after a reconnect. Confirmed rosters are
    /// dropped first; the server answers each join with a fresh roster.
    pub async fn resync(&self) -> Result<(), ConnectionError> {
        self.rosters.write().await.clear();

        let boards: Vec<Uuid> = self.boards.read().await.iter().copied().collect();
        for board_id in boards {
            self.conn.send(WireMessage::JoinBoard { board_id }).await?;
        }
        if let Some((document_id, workspace_id)) = *self.document.read().await {
            self.conn
                .send(WireMessage::DocumentJoin {
                    document_id,
                    workspace_id,
                })
                .await?;
        }
        Ok(())
    }
}
