//! # Change-Notification Bus Module
//!
//! Fan-out of [`ChangeEvent`]s to in-process subscribers: one broadcast
//! group receiving every event, plus pattern groups receiving only events
//! whose key matches their pattern.
//!
//! ## Pattern grammar
//!
//! A pattern is a literal byte string, optionally ending in a single `*`:
//! `"user:*"` matches every key starting with `user:`, any other pattern
//! matches only the exact key.
//!
//! ## Delivery semantics
//!
//! Delivery is **best-effort**. Every subscriber owns a bounded channel;
//! [`ChangeBus::emit`] uses a non-blocking send and simply drops the event
//! for a subscriber whose queue is full. Slow consumers lose events —
//! they never block the write path. Subscribers that dropped their
//! receiver are pruned lazily on the next emit.
//!
//! Events are published post-acknowledgment by the facade, so a
//! subscriber observes a key's events in commit order (per-key; no
//! cross-key ordering is promised across subscribers).

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::sync::Mutex;

use crossbeam::channel::{Receiver, Sender, TrySendError, bounded};
use tracing::{debug, trace};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Queue depth of each subscriber channel.
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 1024;

// ------------------------------------------------------------------------------------------------
// Event types
// ------------------------------------------------------------------------------------------------

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// The key was written.
    Put,
    /// The key was deleted.
    Delete,
}

/// One committed change, as observed by subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Whether this was a write or a delete.
    pub kind: ChangeKind,

    /// The affected key.
    pub key: Vec<u8>,

    /// The written user value; `None` for deletes.
    pub value: Option<Vec<u8>>,

    /// Commit timestamp in milliseconds since the UNIX epoch.
    pub ts_ms: u64,
}

// ------------------------------------------------------------------------------------------------
// Pattern matching
// ------------------------------------------------------------------------------------------------

/// Compiled subscription pattern: a literal, or a literal prefix when the
/// source ended with `*`.
#[derive(Debug, Clone)]
struct Pattern {
    literal: Vec<u8>,
    prefix: bool,
}

impl Pattern {
    fn parse(source: &str) -> Self {
        match source.strip_suffix('*') {
            Some(prefix) => Self {
                literal: prefix.as_bytes().to_vec(),
                prefix: true,
            },
            None => Self {
                literal: source.as_bytes().to_vec(),
                prefix: false,
            },
        }
    }

    fn matches(&self, key: &[u8]) -> bool {
        if self.prefix {
            key.starts_with(&self.literal)
        } else {
            key == self.literal
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Bus core
// ------------------------------------------------------------------------------------------------

struct BusInner {
    /// Subscribers receiving every event.
    all: Vec<Sender<ChangeEvent>>,

    /// Subscribers receiving only matching events.
    patterns: Vec<(Pattern, Sender<ChangeEvent>)>,

    closed: bool,
}

/// In-process broadcast hub for committed changes.
pub struct ChangeBus {
    inner: Mutex<BusInner>,
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BusInner {
                all: Vec::new(),
                patterns: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Subscribes to every event.
    pub fn subscribe_all(&self) -> Receiver<ChangeEvent> {
        let (tx, rx) = bounded(SUBSCRIBER_QUEUE_DEPTH);
        let mut inner = self.lock();
        if !inner.closed {
            inner.all.push(tx);
        }
        // On a closed bus the sender is dropped right away, so the
        // receiver observes disconnection instead of silence.
        rx
    }

    /// Subscribes to events whose key matches `pattern` (literal, or
    /// literal prefix with one trailing `*`).
    pub fn subscribe_pattern(&self, pattern: &str) -> Receiver<ChangeEvent> {
        let (tx, rx) = bounded(SUBSCRIBER_QUEUE_DEPTH);
        let mut inner = self.lock();
        if !inner.closed {
            inner.patterns.push((Pattern::parse(pattern), tx));
        }
        rx
    }

    /// Fans an event out to the broadcast group and every matching
    /// pattern group. Never blocks: full queues drop the event, dead
    /// receivers are pruned.
    pub fn emit(&self, event: ChangeEvent) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }

        inner.all.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!("subscriber queue full, event dropped");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });

        let key = event.key.clone();
        inner.patterns.retain(|(pattern, tx)| {
            if !pattern.matches(&key) {
                return true;
            }
            match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    trace!("pattern subscriber queue full, event dropped");
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
    }

    /// Number of live subscribers across both groups.
    pub fn subscriber_count(&self) -> usize {
        let inner = self.lock();
        inner.all.len() + inner.patterns.len()
    }

    /// Disconnects every subscriber and rejects future events.
    pub fn close(&self) {
        let mut inner = self.lock();
        let dropped = inner.all.len() + inner.patterns.len();
        inner.all.clear();
        inner.patterns.clear();
        inner.closed = true;
        debug!(dropped, "change bus closed");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
