//! Ephemeral typing indicators for card comment threads.
//!
//! Typing state is edge-triggered on the wire: one `TypingStart` when the
//! user begins, one `TypingStop` when the debounce window expires or the
//! input is explicitly abandoned. Keystrokes inside the window only push the
//! deadline out, they never re-emit.
//!
//! [`DebouncedSignal`] is the pure primitive (time passed in, no timers of
//! its own, so the edge logic is testable without sleeping).
//! [`TypingPublisher`] drives one signal per card over the connection, and
//! [`TypingRoster`] is the receiving side.
//!
//! Everything here is volatile traffic: dropped while offline, never queued.
//! A typing flag that survives a reconnect would be a lie by the time it
//! arrives.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::connection::{Connection, ConnectionError};
use crate::protocol::WireMessage;

/// Default quiet period after the last keystroke before `Stop` fires.
pub const DEFAULT_TYPING_WINDOW: Duration = Duration::from_millis(500);

/// An emitted edge of the debounced boolean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEdge {
    Start,
    Stop,
}

/// Edge-triggered debounce over a boolean input stream.
///
/// Feed it `input(true, now)` on every keystroke and `input(false, now)` on
/// explicit inactivity (blur, submit); call `poll(now)` when the armed
/// deadline elapses. Only transitions produce an edge.
#[derive(Debug)]
pub struct DebouncedSignal {
    window: Duration,
    active: bool,
    deadline: Option<Instant>,
}

impl DebouncedSignal {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            active: false,
            deadline: None,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// The instant at which `poll` would emit `Stop`, if armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Feed one observation of the input. Rising edge emits `Start`; an
    /// active input pushes the deadline out; falling edge emits `Stop`
    /// immediately and disarms the deadline.
    pub fn input(&mut self, active: bool, now: Instant) -> Option<SignalEdge> {
        if active {
            self.deadline = Some(now + self.window);
            if self.active {
                None
            } else {
                self.active = true;
                Some(SignalEdge::Start)
            }
        } else {
            self.deadline = None;
            if self.active {
                self.active = false;
                Some(SignalEdge::Stop)
            } else {
                None
            }
        }
    }

    /// Check the armed deadline. Emits `Stop` once when it has passed.
    pub fn poll(&mut self, now: Instant) -> Option<SignalEdge> {
        match self.deadline {
            Some(deadline) if self.active && now >= deadline => {
                self.active = false;
                self.deadline = None;
                Some(SignalEdge::Stop)
            }
            _ => None,
        }
    }

    /// Force-stop regardless of the deadline.
    pub fn cancel(&mut self) -> Option<SignalEdge> {
        self.deadline = None;
        if self.active {
            self.active = false;
            Some(SignalEdge::Stop)
        } else {
            None
        }
    }
}

impl Default for DebouncedSignal {
    fn default() -> Self {
        Self::new(DEFAULT_TYPING_WINDOW)
    }
}

/// Publishes the local user's typing state for one card.
///
/// One publisher per focused comment box; drop it (or call
/// [`TypingPublisher::stop`]) when the box unmounts.
pub struct TypingPublisher {
    conn: Arc<Connection>,
    card_id: Uuid,
    signal: Arc<Mutex<DebouncedSignal>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl TypingPublisher {
    pub fn new(conn: Arc<Connection>, card_id: Uuid) -> Self {
        Self::with_window(conn, card_id, DEFAULT_TYPING_WINDOW)
    }

    pub fn with_window(conn: Arc<Connection>, card_id: Uuid, window: Duration) -> Self {
        Self {
            conn,
            card_id,
            signal: Arc::new(Mutex::new(DebouncedSignal::new(window))),
            timer: Mutex::new(None),
        }
    }

    pub fn card_id(&self) -> Uuid {
        self.card_id
    }

    /// Whether we are currently advertised as typing.
    pub fn is_typing(&self) -> bool {
        self.signal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_active()
    }

    /// Register a keystroke: emits `TypingStart` on the rising edge, then
    /// re-arms the stop timer for one debounce window.
    pub async fn keystroke(&self) -> Result<(), ConnectionError> {
        let edge = {
            let mut signal = self.signal.lock().unwrap_or_else(|e| e.into_inner());
            signal.input(true, Instant::now())
        };
        if edge == Some(SignalEdge::Start) {
            self.conn
                .send_volatile(WireMessage::TypingStart {
                    card_id: self.card_id,
                })
                .await?;
        }
        self.arm_timer();
        Ok(())
    }

    /// Explicit inactivity (blur, comment submitted): emits `TypingStop`
    /// immediately if we were typing.
    pub async fn stop(&self) -> Result<(), ConnectionError> {
        self.disarm_timer();
        let edge = {
            let mut signal = self.signal.lock().unwrap_or_else(|e| e.into_inner());
            signal.input(false, Instant::now())
        };
        if edge == Some(SignalEdge::Stop) {
            self.conn
                .send_volatile(WireMessage::TypingStop {
                    card_id: self.card_id,
                })
                .await?;
        }
        Ok(())
    }

    fn arm_timer(&self) {
        let window = self
            .signal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .window();
        let signal = self.signal.clone();
        let conn = self.conn.clone();
        let card_id = self.card_id;

        let task = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let edge = {
                let mut signal = signal.lock().unwrap_or_else(|e| e.into_inner());
                signal.poll(Instant::now())
            };
            if edge == Some(SignalEdge::Stop) {
                let _ = conn
                    .send_volatile(WireMessage::TypingStop { card_id })
                    .await;
            }
        });

        let mut timer = self.timer.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = timer.replace(task) {
            previous.abort();
        }
    }

    fn disarm_timer(&self) {
        if let Some(task) = self
            .timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

impl Drop for TypingPublisher {
    fn drop(&mut self) {
        self.disarm_timer();
        let edge = self
            .signal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
        if edge == Some(SignalEdge::Stop) {
            // Best effort; skipped when no runtime is around to carry it.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let conn = self.conn.clone();
                let card_id = self.card_id;
                handle.spawn(async move {
                    let _ = conn
                        .send_volatile(WireMessage::TypingStop { card_id })
                        .await;
                });
            }
        }
    }
}

/// Receiving side: who is typing on which card right now.
#[derive(Debug, Default)]
pub struct TypingRoster {
    typists: HashMap<Uuid, HashSet<Uuid>>,
    names: HashMap<Uuid, String>,
}

impl TypingRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an inbound typing message. Returns `true` when consumed.
    pub fn handle(&mut self, msg: &WireMessage) -> bool {
        match msg {
            WireMessage::TypingStarted {
                card_id,
                user_id,
                user_name,
            } => {
                self.typists.entry(*card_id).or_default().insert(*user_id);
                if let Some(name) = user_name {
                    self.names.insert(*user_id, name.clone());
                }
                true
            }
            WireMessage::TypingStopped { card_id, user_id } => {
                if let Some(set) = self.typists.get_mut(card_id) {
                    set.remove(user_id);
                    if set.is_empty() {
                        self.typists.remove(card_id);
                    }
                }
                true
            }
            _ => false,
        }
    }

    /// Users currently typing on `card_id`.
    pub fn typists(&self, card_id: Uuid) -> HashSet<Uuid> {
        self.typists.get(&card_id).cloned().unwrap_or_default()
    }

    pub fn is_typing(&self, card_id: Uuid, user_id: Uuid) -> bool {
        self.typists
            .get(&card_id)
            .map(|set| set.contains(&user_id))
            .unwrap_or(false)
    }

    /// Display name last seen for `user_id`, if any message carried one.
    pub fn name_of(&self, user_id: Uuid) -> Option<&str> {
        self.names.get(&user_id).map(String::as_str)
    }

    /// Reset one card's set (comment box unmounted).
    pub fn clear(&mut self, card_id: Uuid) {
        self.typists.remove(&card_id);
    }
}
