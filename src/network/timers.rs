//! Cancellable Scheduled Transitions
//!
//! Shield expiry, disconnect-grace and room-cleanup timers, keyed by
//! `(room code, kind)`. Scheduling replaces any pending timer under
//! the same key; cancelling an already-fired or already-cancelled
//! timer is a no-op. A fired task re-checks that it is still the
//! current registration before running its action, so a cancel racing
//! a fire can never run a stale action.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::game::state::PlayerSlot;

/// What a timer does when it fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimerKind {
    /// Clear a slot's shield after its fixed duration.
    ShieldExpiry(PlayerSlot),
    /// Treat a slot's disconnect as permanent after the grace window.
    DisconnectGrace(PlayerSlot),
    /// Delete an empty room after its grace window.
    RoomCleanup,
}

/// Timer key: one pending timer per room per kind.
pub type TimerKey = (String, TimerKind);

struct TimerEntry {
    token: u64,
    handle: JoinHandle<()>,
}

struct Inner {
    entries: Mutex<BTreeMap<TimerKey, TimerEntry>>,
    next_token: AtomicU64,
}

/// Table of pending timers across all rooms.
#[derive(Clone)]
pub struct TimerTable {
    inner: Arc<Inner>,
}

impl TimerTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(BTreeMap::new()),
                next_token: AtomicU64::new(1),
            }),
        }
    }

    /// Schedule `action` to run after `delay`, replacing any pending
    /// timer under the same key.
    pub async fn schedule<F>(&self, key: TimerKey, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.clone();
        let task_key = key.clone();

        // Register under the lock before the task can possibly fire,
        // so even a zero-delay timer finds its own entry.
        let mut entries = self.inner.entries.lock().await;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            // Only the current registration may act.
            let current = {
                let mut entries = inner.entries.lock().await;
                match entries.get(&task_key) {
                    Some(entry) if entry.token == token => {
                        entries.remove(&task_key);
                        true
                    }
                    _ => false,
                }
            };
            if current {
                action.await;
            }
        });
        if let Some(old) = entries.insert(key, TimerEntry { token, handle }) {
            old.handle.abort();
        }
    }

    /// Cancel a pending timer. No-op when the timer already fired or
    /// was never scheduled.
    pub async fn cancel(&self, key: &TimerKey) {
        let mut entries = self.inner.entries.lock().await;
        if let Some(entry) = entries.remove(key) {
            entry.handle.abort();
        }
    }

    /// Cancel and release every timer of a room. Called at room
    /// deletion so no task outlives its room.
    pub async fn cancel_room(&self, room_id: &str) {
        let mut entries = self.inner.entries.lock().await;
        let keys: Vec<TimerKey> = entries
            .keys()
            .filter(|(code, _)| code == room_id)
            .cloned()
            .collect();
        for key in keys {
            if let Some(entry) = entries.remove(&key) {
                entry.handle.abort();
            }
        }
    }

    /// Number of pending timers for a room.
    pub async fn pending_for(&self, room_id: &str) -> usize {
        let entries = self.inner.entries.lock().await;
        entries.keys().filter(|(code, _)| code == room_id).count()
    }

    /// Total number of pending timers.
    pub async fn len(&self) -> usize {
        self.inner.entries.lock().await.len()
    }

    /// Whether no timers are pending.
    pub async fn is_empty(&self) -> bool {
        self.inner.entries.lock().await.is_empty()
    }
}

impl Default for TimerTable {
    fn default() -> Self {
        Self::new()
    }
}
