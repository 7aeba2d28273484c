//! Typed domain-event bus with causal metadata.
//!
//! Inbound domain events (board/card/list/comment/… changes) are fanned out
//! to local subscribers over a tokio broadcast channel. Delivery order within
//! one room is whatever order the server assigned; consumers must be
//! idempotent under replays after a reconnect.
//!
//! Self-origin filtering is a *consumer* policy, not enforced by the bus:
//! a client that applied its own change optimistically must never apply the
//! echoed event a second time. The canonical origin identifier is
//! `meta.user_id` (`socket_id` is transient and reassigned on every
//! reconnect, so it is kept for diagnostics only). Use
//! [`EventBus::subscribe_filtered`] to get the policy applied for you.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::clock::{unix_millis, Causality, VectorClock};
use crate::protocol::PROTOCOL_VERSION;

/// Every domain event type the core understands, with its typed payload.
///
/// Closed union: unknown types coming off the wire from a newer peer arrive
/// as [`EventKind::Unknown`] and are passed through to subscribers untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    CardCreated {
        board_id: Uuid,
        list_id: Uuid,
        card_id: Uuid,
        title: String,
    },
    CardUpdated {
        board_id: Uuid,
        card_id: Uuid,
    },
    CardMoved {
        board_id: Uuid,
        card_id: Uuid,
        from_list: Uuid,
        to_list: Uuid,
        position: u32,
    },
    CardDeleted {
        board_id: Uuid,
        card_id: Uuid,
    },
    ListCreated {
        board_id: Uuid,
        list_id: Uuid,
        title: String,
    },
    ListUpdated {
        board_id: Uuid,
        list_id: Uuid,
    },
    ListDeleted {
        board_id: Uuid,
        list_id: Uuid,
    },
    BoardUpdated {
        board_id: Uuid,
    },
    CommentAdded {
        card_id: Uuid,
        comment_id: Uuid,
        body: String,
    },
    NotificationCreated {
        notification_id: Uuid,
        title: String,
    },
    WorkspaceUpdated {
        workspace_id: Uuid,
    },
    /// Forward-compatibility fallback: an event type this build doesn't know.
    Unknown {
        kind: String,
        payload: Vec<u8>,
    },
}

impl EventKind {
    /// Stable name for logging and projections.
    pub fn name(&self) -> &str {
        match self {
            EventKind::CardCreated { .. } => "card:created",
            EventKind::CardUpdated { .. } => "card:updated",
            EventKind::CardMoved { .. } => "card:moved",
            EventKind::CardDeleted { .. } => "card:deleted",
            EventKind::ListCreated { .. } => "list:created",
            EventKind::ListUpdated { .. } => "list:updated",
            EventKind::ListDeleted { .. } => "list:deleted",
            EventKind::BoardUpdated { .. } => "board:updated",
            EventKind::CommentAdded { .. } => "comment:added",
            EventKind::NotificationCreated { .. } => "notification:created",
            EventKind::WorkspaceUpdated { .. } => "workspace:updated",
            EventKind::Unknown { kind, .. } => kind,
        }
    }
}

/// Causal metadata stamped on every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    /// Originating user — the canonical origin identifier.
    pub user_id: Uuid,
    /// Unique per event.
    pub event_id: Uuid,
    /// Milliseconds since epoch at the origin.
    pub timestamp: u64,
    /// Envelope schema version.
    pub version: u32,
    /// Vector clock snapshot at the origin, for anomaly detection only.
    pub vector_clock: VectorClock,
    /// Transient socket identity of the origin connection. Diagnostics only;
    /// never use for self-filtering (it changes on every reconnect).
    pub socket_id: Option<Uuid>,
}

impl EventMeta {
    /// Fresh metadata for a locally produced event. The vector clock starts
    /// empty; [`EventBus::publish`] fills in the bus's current clock.
    pub fn stamp(user_id: Uuid, socket_id: Option<Uuid>) -> Self {
        Self {
            user_id,
            event_id: Uuid::new_v4(),
            timestamp: unix_millis(),
            version: PROTOCOL_VERSION,
            vector_clock: VectorClock::new(),
            socket_id,
        }
    }
}

/// Immutable domain-event envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub kind: EventKind,
    pub meta: EventMeta,
}

impl DomainEvent {
    /// Whether this event originated from `user`.
    pub fn origin_is(&self, user: Uuid) -> bool {
        self.meta.user_id == user
    }
}

/// Bus counters, read via [`EventBus::stats`].
#[derive(Debug, Clone, Default)]
pub struct BusStats {
    pub published: u64,
    pub dispatched: u64,
    /// Inbound events whose clock was causally behind what we had already
    /// observed (stale replays). Logged, never rejected.
    pub stale_events: u64,
}

struct AtomicBusStats {
    published: AtomicU64,
    dispatched: AtomicU64,
    stale_events: AtomicU64,
}

/// Local fan-out for domain events.
///
/// `publish` stamps and dispatches a locally originated event (and returns it
/// for the caller to ship as `WireMessage::Event`); `dispatch` feeds an
/// inbound event to subscribers. Subscriptions are scoped: dropping the
/// [`EventStream`] unregisters it deterministically.
pub struct EventBus {
    local_user: Uuid,
    sender: broadcast::Sender<DomainEvent>,
    /// The local actor's clock, ticked on publish, merged on dispatch.
    clock: Mutex<VectorClock>,
    stats: AtomicBusStats,
}

impl EventBus {
    /// Create a bus for the given local user with the default buffer.
    pub fn new(local_user: Uuid) -> Self {
        Self::with_capacity(local_user, 256)
    }

    /// `capacity` is the per-subscriber buffer; lagging subscribers drop the
    /// oldest events (and must cope, being idempotent).
    pub fn with_capacity(local_user: Uuid, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            local_user,
            sender,
            clock: Mutex::new(VectorClock::new()),
            stats: AtomicBusStats {
                published: AtomicU64::new(0),
                dispatched: AtomicU64::new(0),
                stale_events: AtomicU64::new(0),
            },
        }
    }

    pub fn local_user(&self) -> Uuid {
        self.local_user
    }

    /// Stamp `kind` with fresh causal metadata, dispatch it to local
    /// subscribers (optimistic application), and return the event for the
    /// caller to send over the connection.
    pub fn publish(&self, kind: EventKind, socket_id: Option<Uuid>) -> DomainEvent {
        let mut meta = EventMeta::stamp(self.local_user, socket_id);
        {
            let mut clock = self.clock.lock().unwrap_or_else(|e| e.into_inner());
            clock.tick(self.local_user);
            meta.vector_clock = clock.clone();
        }
        let event = DomainEvent { kind, meta };
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        let _ = self.sender.send(event.clone());
        event
    }

    /// Dispatch an inbound event to subscribers.
    ///
    /// Merges the event's clock into ours and logs (never rejects) events
    /// that arrive causally behind what we have already observed.
    pub fn dispatch(&self, event: DomainEvent) {
        {
            let mut clock = self.clock.lock().unwrap_or_else(|e| e.into_inner());
            match event.meta.vector_clock.compare(&clock) {
                Causality::Before => {
                    self.stats.stale_events.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "stale event {} ({}) from {} — replay after reconnect?",
                        event.meta.event_id,
                        event.kind.name(),
                        event.meta.user_id
                    );
                }
                _ => {}
            }
            clock.merge(&event.meta.vector_clock);
        }
        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events, own ones included.
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.sender.subscribe(),
            skip_origin: None,
        }
    }

    /// Subscribe with the self-origin filter applied: events whose
    /// `meta.user_id` equals the local user are silently skipped.
    pub fn subscribe_filtered(&self) -> EventStream {
        EventStream {
            rx: self.sender.subscribe(),
            skip_origin: Some(self.local_user),
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Snapshot of the bus's merged vector clock.
    pub fn clock(&self) -> VectorClock {
        self.clock.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.stats.published.load(Ordering::Relaxed),
            dispatched: self.stats.dispatched.load(Ordering::Relaxed),
            stale_events: self.stats.stale_events.load(Ordering::Relaxed),
        }
    }
}

/// Scoped subscription to the bus. Dropping it unregisters the listener.
pub struct EventStream {
    rx: broadcast::Receiver<DomainEvent>,
    skip_origin: Option<Uuid>,
}

impl EventStream {
    /// Next event, or `None` when the bus is gone.
    ///
    /// Lagged gaps are logged and skipped — consumers are idempotent by
    /// contract, so missing an already-applied echo is harmless.
    pub async fn recv(&mut self) -> Option<DomainEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if let Some(origin) = self.skip_origin {
                        if event.origin_is(origin) {
                            continue;
                        }
                    }
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("event subscriber lagged by {n} events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant: `None` when no event is currently buffered.
    pub fn try_recv(&mut self) -> Option<DomainEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    if let Some(origin) = self.skip_origin {
                        if event.origin_is(origin) {
                            continue;
                        }
                    }
                    return Some(event);
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    log::warn!("event subscriber lagged by {n} events");
                    continue;
                }
                Err(_) => return None,
            }
        }
    }
}
