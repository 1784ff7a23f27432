//! Duplicate suppression for re-read log entries.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::collector::QueryEvent;

/// Remembers `(second-precision timestamp, query)` pairs for `window`.
///
/// The same execution can be seen twice when a file is re-read after a
/// restart or appears in more than one log representation.
#[derive(Debug)]
pub struct Deduplicator {
    window: Duration,
    seen: HashMap<(i64, String), Instant>,
}

impl Deduplicator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    /// Records `event` and returns `true` if it is new, `false` if an event
    /// with the same key was recorded within the window.
    pub fn observe(&mut self, event: &QueryEvent, now: Instant) -> bool {
        let key = (event.timestamp.timestamp(), event.query.clone());
        match self.seen.get(&key) {
            Some(first) if now.saturating_duration_since(*first) < self.window => false,
            _ => {
                self.seen.insert(key, now);
                true
            }
        }
    }

    /// Forgets keys older than the window. Returns how many were removed.
    pub fn purge(&mut self, now: Instant) -> usize {
        let before = self.seen.len();
        let window = self.window;
        self.seen
            .retain(|_, first| now.saturating_duration_since(*first) < window);
        before - self.seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
