//! Auto-save bridge between a live document session and persistence.
//!
//! Persistence itself lives behind a REST collaborator; this module only
//! decides *when* to ship a snapshot and *what* to ship. Policy:
//!
//! | Situation                         | Behavior                        |
//! |-----------------------------------|---------------------------------|
//! | Snapshot identical to last saved  | Skip, no network call           |
//! | Save already in flight            | Coalesce into a no-op           |
//! | Sink failure                      | Log, swallow, retry next trigger|
//!
//! Snapshots are LZ4-compressed (size-prepended framing) before transport;
//! full-state updates of a long-lived document compress well since most of
//! the payload is repetitive structural metadata.
//!
//! Periodic/threshold scheduling is deliberately left to the caller side of
//! the [`SnapshotSink`]; the bridge only reacts to explicit triggers.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use lz4_flex::compress_prepend_size;
use uuid::Uuid;

use crate::session::DocumentSession;

/// Persistence collaborator boundary. Implemented over REST in production,
/// by an in-memory double in tests.
pub trait SnapshotSink: Send + Sync + 'static {
    /// Persist a compressed full-state snapshot of one document.
    fn put(
        &self,
        document_id: Uuid,
        workspace_id: Uuid,
        snapshot: Vec<u8>,
    ) -> impl Future<Output = Result<(), SaveError>> + Send;
}

/// Persistence errors, as reported by the sink.
#[derive(Debug, Clone)]
pub enum SaveError {
    /// The collaborator rejected the snapshot (auth, validation, conflict).
    Rejected(String),
    /// The collaborator was unreachable.
    Transport(String),
}

impl fmt::Display for SaveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(e) => write!(f, "snapshot rejected: {e}"),
            Self::Transport(e) => write!(f, "snapshot transport error: {e}"),
        }
    }
}

impl std::error::Error for SaveError {}

/// What a save trigger ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// Document bytes unchanged since the last successful save.
    SkippedUnchanged,
    /// Another save was in flight; this trigger folded into it.
    Coalesced,
    /// The sink failed; the snapshot stays dirty for the next trigger.
    Failed,
}

/// Bridge counters, read via [`SaveBridge::stats`].
#[derive(Debug, Clone, Default)]
pub struct SaveStats {
    pub saves: u64,
    pub skipped_unchanged: u64,
    pub coalesced: u64,
    pub failures: u64,
}

/// Ships document snapshots to a [`SnapshotSink`], with unchanged-skip and
/// in-flight coalescing.
pub struct SaveBridge<S: SnapshotSink> {
    sink: S,
    in_flight: AtomicBool,
    /// Uncompressed bytes of the last snapshot the sink accepted.
    last_saved: Mutex<Option<Vec<u8>>>,
    saves: AtomicU64,
    skipped_unchanged: AtomicU64,
    coalesced: AtomicU64,
    failures: AtomicU64,
}

impl<S: SnapshotSink> SaveBridge<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            in_flight: AtomicBool::new(false),
            last_saved: Mutex::new(None),
            saves: AtomicU64::new(0),
            skipped_unchanged: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Snapshot the session and ship it, subject to the bridge policy.
    ///
    /// Failures are logged and swallowed: the user keeps editing against the
    /// live replicated state, and the next trigger retries.
    pub async fn save_now(&self, session: &DocumentSession) -> SaveOutcome {
        let snapshot = session.encode_state();

        {
            let last = self.last_saved.lock().unwrap_or_else(|e| e.into_inner());
            if last.as_deref() == Some(snapshot.as_slice()) {
                self.skipped_unchanged.fetch_add(1, Ordering::Relaxed);
                return SaveOutcome::SkippedUnchanged;
            }
        }

        // One save at a time; the in-flight save carries the freshest state
        // it snapshotted, and anything newer stays dirty for the next trigger.
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            return SaveOutcome::Coalesced;
        }

        let compressed = compress_prepend_size(&snapshot);
        log::debug!(
            "saving document {} ({} bytes, {} compressed)",
            session.document_id(),
            snapshot.len(),
            compressed.len()
        );

        let result = self
            .sink
            .put(session.document_id(), session.workspace_id(), compressed)
            .await;
        self.in_flight.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                *self.last_saved.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot);
                self.saves.fetch_add(1, Ordering::Relaxed);
                SaveOutcome::Saved
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("auto-save of {} failed: {e}", session.document_id());
                SaveOutcome::Failed
            }
        }
    }

    /// Session-closing trigger: same policy as [`SaveBridge::save_now`],
    /// called before the session leaves its room.
    pub async fn flush_on_close(&self, session: &DocumentSession) -> SaveOutcome {
        self.save_now(session).await
    }

    pub fn stats(&self) -> SaveStats {
        SaveStats {
            saves: self.saves.load(Ordering::Relaxed),
            skipped_unchanged: self.skipped_unchanged.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}
