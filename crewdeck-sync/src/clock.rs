//! Vector clocks for causal event metadata.
//!
//! Every domain event carries a vector clock snapshot so that consumers can
//! *detect* causal anomalies (a stale replay, a gap after reconnect). The
//! clocks are never used to resolve conflicts — domain events are commutative
//! side-effects, and the replicated document state converges on its own.
//!
//! Reference: Kleppmann, Chapter 5 — Detecting Concurrent Writes

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Milliseconds since the Unix epoch. Used for event and presence timestamps.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Causal relation between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    /// Identical clocks.
    Equal,
    /// `self` happened strictly before `other`.
    Before,
    /// `self` happened strictly after `other`.
    After,
    /// Neither precedes the other.
    Concurrent,
}

/// Per-actor event counters.
///
/// Counters are monotonically non-decreasing per actor: `tick` increments
/// the local actor, `merge` takes the entrywise maximum with an observed
/// clock. Missing entries count as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    counters: HashMap<Uuid, u64>,
}

impl VectorClock {
    /// Create an empty clock (all actors at zero).
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment `actor`'s counter and return the new value.
    pub fn tick(&mut self, actor: Uuid) -> u64 {
        let entry = self.counters.entry(actor).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Current counter for `actor` (zero if never seen).
    pub fn get(&self, actor: Uuid) -> u64 {
        self.counters.get(&actor).copied().unwrap_or(0)
    }

    /// Entrywise maximum with `other`.
    pub fn merge(&mut self, other: &VectorClock) {
        for (actor, counter) in &other.counters {
            let entry = self.counters.entry(*actor).or_insert(0);
            if *counter > *entry {
                *entry = *counter;
            }
        }
    }

    /// Causal relation of `self` to `other`.
    pub fn compare(&self, other: &VectorClock) -> Causality {
        let mut less = false;
        let mut greater = false;

        for (actor, counter) in &self.counters {
            let theirs = other.get(*actor);
            if *counter < theirs {
                less = true;
            } else if *counter > theirs {
                greater = true;
            }
        }
        for (actor, counter) in &other.counters {
            if self.get(*actor) < *counter {
                less = true;
            }
        }

        match (less, greater) {
            (false, false) => Causality::Equal,
            (true, false) => Causality::Before,
            (false, true) => Causality::After,
            (true, true) => Causality::Concurrent,
        }
    }

    /// Number of actors with a non-zero counter.
    pub fn actor_count(&self) -> usize {
        self.counters.len()
    }

    /// Whether no actor has ticked yet.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_clock_is_empty() {
        let clock = VectorClock::new();
        assert!(clock.is_empty());
        assert_eq!(clock.actor_count(), 0);
        assert_eq!(clock.get(Uuid::new_v4()), 0);
    }

    #[test]
    fn test_tick_increments() {
        let actor = Uuid::new_v4();
        let mut clock = VectorClock::new();

        assert_eq!(clock.tick(actor), 1);
        assert_eq!(clock.tick(actor), 2);
        assert_eq!(clock.get(actor), 2);
        assert_eq!(clock.actor_count(), 1);
    }

    #[test]
    fn test_merge_takes_entrywise_max() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let mut left = VectorClock::new();
        left.tick(a);
        left.tick(a);
        left.tick(b);

        let mut right = VectorClock::new();
        right.tick(a);
        right.tick(b);
        right.tick(b);
        right.tick(b);

        left.merge(&right);
        assert_eq!(left.get(a), 2);
        assert_eq!(left.get(b), 3);
    }

    #[test]
    fn test_merge_is_monotonic() {
        let a = Uuid::new_v4();
        let mut clock = VectorClock::new();
        clock.tick(a);
        clock.tick(a);

        // Merging an older clock must not decrease any counter.
        let mut old = VectorClock::new();
        old.tick(a);
        clock.merge(&old);
        assert_eq!(clock.get(a), 2);
    }

    #[test]
    fn test_compare_equal() {
        let a = Uuid::new_v4();
        let mut x = VectorClock::new();
        x.tick(a);
        let y = x.clone();
        assert_eq!(x.compare(&y), Causality::Equal);

        let empty1 = VectorClock::new();
        let empty2 = VectorClock::new();
        assert_eq!(empty1.compare(&empty2), Causality::Equal);
    }

    #[test]
    fn test_compare_before_after() {
        let a = Uuid::new_v4();
        let mut x = VectorClock::new();
        x.tick(a);

        let mut y = x.clone();
        y.tick(a);

        assert_eq!(x.compare(&y), Causality::Before);
        assert_eq!(y.compare(&x), Causality::After);
    }

    #[test]
    fn test_compare_concurrent() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let mut x = VectorClock::new();
        x.tick(a);

        let mut y = VectorClock::new();
        y.tick(b);

        assert_eq!(x.compare(&y), Causality::Concurrent);
        assert_eq!(y.compare(&x), Causality::Concurrent);
    }

    #[test]
    fn test_missing_actor_counts_as_zero() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let mut x = VectorClock::new();
        x.tick(a);
        x.tick(b);

        let mut y = VectorClock::new();
        y.tick(a);
        // y has never seen b — it is strictly behind x.
        assert_eq!(y.compare(&x), Causality::Before);
    }

    #[test]
    fn test_serde_roundtrip() {
        let a = Uuid::new_v4();
        let mut clock = VectorClock::new();
        clock.tick(a);
        clock.tick(a);

        let encoded =
            bincode::serde::encode_to_vec(&clock, bincode::config::standard()).unwrap();
        let (decoded, _): (VectorClock, _) =
            bincode::serde::decode_from_slice(&encoded, bincode::config::standard()).unwrap();
        assert_eq!(clock, decoded);
    }

    #[test]
    fn test_unix_millis_is_sane() {
        let now = unix_millis();
        // After 2020-01-01 in milliseconds.
        assert!(now > 1_577_836_800_000);
    }
}
