//! # crewdeck-sync — Real-time synchronization core for Crewdeck
//!
//! Client-side engine behind live boards, collaborative documents, presence
//! and typing indicators. One persistent WebSocket per client carries all
//! rooms; replicated document state converges through CRDT merge while
//! domain events fan out to local subscribers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    WireMessage     ┌──────────────┐
//! │  Connection   │ ◄────────────────► │  Sync server  │
//! │ (per client)  │   (bincode, WS)    │  (authority)  │
//! └──────┬───────┘                    └──────────────┘
//!        │ inbound fan-out
//!   ┌────┼──────────┬─────────────┬────────────┐
//!   ▼    ▼          ▼             ▼            ▼
//! Rooms  EventBus  DocumentSession  TypingRoster
//!                      │
//!                      ▼
//!                  SaveBridge ──► SnapshotSink (REST persistence)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded WireMessage)
//! - [`connection`] — Connection manager with offline queue and reconnect
//! - [`rooms`] — Room membership and presence rosters
//! - [`events`] — Typed domain-event bus with vector-clock metadata
//! - [`clock`] — Vector clocks and wall-clock helpers
//! - [`session`] — CRDT document session (yrs-backed)
//! - [`autosave`] — Snapshot bridge to the persistence collaborator
//! - [`typing`] — Debounced typing signals and the typing roster
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Wire message encode | <1µs |
//! | Offline queue replay (1K msgs) | <50ms |
//! | Vector clock merge (100 actors) | <10µs |
//! | Memory per document session | <1MB |

pub mod autosave;
pub mod clock;
pub mod connection;
pub mod events;
pub mod protocol;
pub mod rooms;
pub mod session;
pub mod typing;

// Re-exports for convenience
pub use autosave::{SaveBridge, SaveError, SaveOutcome, SaveStats, SnapshotSink};
pub use clock::{unix_millis, Causality, VectorClock};
pub use connection::{
    Connection, ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionState,
    OutboundQueue,
};
pub use events::{BusStats, DomainEvent, EventBus, EventKind, EventMeta, EventStream};
pub use protocol::{
    AwarenessState, MemberProfile, ProtocolError, RoomId, UserBadge, WireMessage,
    PROTOCOL_VERSION,
};
pub use rooms::RoomCoordinator;
pub use session::{DocumentSession, SessionError, SessionState, SessionStats};
pub use typing::{
    DebouncedSignal, SignalEdge, TypingPublisher, TypingRoster, DEFAULT_TYPING_WINDOW,
};
