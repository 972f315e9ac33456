//! Connection state and the broadcaster that fans transitions out to
//! listeners.
//!
//! Listeners run synchronously on the thread that made the transition, in
//! subscription order. Dispatch works over a snapshot of the listener list
//! and never holds the registry lock while a listener runs, so a listener may
//! subscribe, unsubscribe, or trigger further transitions. Transitions
//! published during a dispatch round are queued and delivered after it, in
//! the order they were published.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::{Deserialize, Serialize};

/// Lifecycle state of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The last connection attempt failed.
    Failed,
}

impl ConnectionState {
    /// Short display string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Listener = Arc<dyn Fn(ConnectionState) + Send + Sync>;

struct ListenerEntry {
    key: u64,
    /// Sequence number of the last transition this listener has already
    /// seen (through the immediate call made by `subscribe`).
    seen: u64,
    listener: Listener,
}

struct Registry {
    current: ConnectionState,
    seq: u64,
    listeners: Vec<ListenerEntry>,
    queue: VecDeque<(u64, ConnectionState)>,
    dispatching: bool,
    next_key: u64,
}

/// Publish/subscribe registry for connection-state transitions.
///
/// Cheap to clone; all clones share the same registry.
#[derive(Clone)]
pub struct StateBroadcaster {
    registry: Arc<Mutex<Registry>>,
}

impl StateBroadcaster {
    pub fn new(initial: ConnectionState) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                current: initial,
                seq: 0,
                listeners: Vec::new(),
                queue: VecDeque::new(),
                dispatching: false,
                next_key: 0,
            })),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        lock(&self.registry)
    }

    /// The state recorded by the most recent transition.
    pub fn current(&self) -> ConnectionState {
        self.registry().current
    }

    /// Add a listener and call it once, right away, with the current state.
    ///
    /// The listener stays registered until the returned [`Subscription`] is
    /// unsubscribed or dropped.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        let (key, current) = {
            let mut registry = self.registry();
            let key = registry.next_key;
            registry.next_key += 1;
            let seen = registry.seq;
            registry.listeners.push(ListenerEntry {
                key,
                seen,
                listener: Arc::clone(&listener),
            });
            (key, registry.current)
        };

        listener(current);

        Subscription {
            registry: Arc::downgrade(&self.registry),
            key,
        }
    }

    /// Record a transition without delivering it. Returns `false` (and
    /// records nothing) when `state` is already current.
    ///
    /// Callers that publish while holding their own lock call
    /// [`flush`](Self::flush) once that lock is released.
    pub fn publish(&self, state: ConnectionState) -> bool {
        let mut registry = self.registry();
        if registry.current == state {
            return false;
        }
        registry.current = state;
        registry.seq += 1;
        let seq = registry.seq;
        registry.queue.push_back((seq, state));
        true
    }

    /// Deliver every queued transition. A no-op when another flush is
    /// already delivering; that flush picks the queued transitions up.
    pub fn flush(&self) {
        {
            let mut registry = self.registry();
            if registry.dispatching {
                return;
            }
            registry.dispatching = true;
        }
        let mut guard = DispatchGuard {
            registry: &self.registry,
            active: true,
        };

        loop {
            let (seq, state, snapshot) = {
                let mut registry = self.registry();
                let Some((seq, state)) = registry.queue.pop_front() else {
                    // Cleared under the same lock that saw the empty queue,
                    // so a concurrent publish cannot be stranded.
                    registry.dispatching = false;
                    guard.active = false;
                    return;
                };
                let snapshot: Vec<(u64, Listener)> = registry
                    .listeners
                    .iter()
                    .filter(|entry| entry.seen < seq)
                    .map(|entry| (entry.key, Arc::clone(&entry.listener)))
                    .collect();
                (seq, state, snapshot)
            };

            for (key, listener) in snapshot {
                // Skip listeners removed earlier in this round.
                let still_subscribed = {
                    let mut registry = self.registry();
                    match registry.listeners.iter_mut().find(|entry| entry.key == key) {
                        Some(entry) => {
                            entry.seen = seq;
                            true
                        }
                        None => false,
                    }
                };
                if still_subscribed {
                    listener(state);
                }
            }
        }
    }

    /// Transition and deliver in one step. Returns `false` if `state` was
    /// already current (nothing is broadcast).
    pub fn set(&self, state: ConnectionState) -> bool {
        let changed = self.publish(state);
        self.flush();
        changed
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.registry().listeners.len()
    }
}

impl Default for StateBroadcaster {
    fn default() -> Self {
        Self::new(ConnectionState::Disconnected)
    }
}

/// Clears the dispatching flag if a listener panics.
struct DispatchGuard<'a> {
    registry: &'a Mutex<Registry>,
    active: bool,
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            lock(self.registry).dispatching = false;
        }
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle returned by [`StateBroadcaster::subscribe`].
///
/// Unsubscribes on drop. `unsubscribe` is idempotent and may be called from
/// inside a listener.
#[must_use = "dropping the subscription unsubscribes the listener"]
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    key: u64,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).listeners.retain(|entry| entry.key != self.key);
        }
    }

    /// Keep the listener registered for the broadcaster's lifetime.
    pub fn detach(self) {
        std::mem::forget(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("key", &self.key).finish()
    }
}
