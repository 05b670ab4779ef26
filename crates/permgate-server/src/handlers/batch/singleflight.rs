//! Singleflight implementation for deduplicating concurrent subject resolutions.

use dashmap::DashMap;
use tokio::sync::broadcast;

/// Result of trying to acquire a singleflight slot.
pub enum SingleflightSlot<V> {
    /// We won the race and should execute the operation.
    /// Contains the sender to broadcast results.
    Leader(broadcast::Sender<V>),
    /// Another task is executing; wait for its result.
    Follower(broadcast::Receiver<V>),
}

/// Deduplicates concurrent executions of the same keyed operation.
///
/// When several callers ask for the same key at once, only the first one
/// executes and every caller receives a clone of its result.
pub struct Singleflight<K, V>
where
    K: std::hash::Hash + Eq + Clone,
    V: Clone,
{
    in_flight: DashMap<K, broadcast::Sender<V>>,
}

impl<K, V> Singleflight<K, V>
where
    K: std::hash::Hash + Eq + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            in_flight: DashMap::new(),
        }
    }

    /// Atomically try to acquire a slot for this operation.
    ///
    /// Returns `Leader` if this caller should execute the operation,
    /// or `Follower` if another caller is already executing it.
    pub fn acquire(&self, key: K) -> SingleflightSlot<V> {
        use dashmap::mapref::entry::Entry;

        match self.in_flight.entry(key) {
            Entry::Occupied(entry) => SingleflightSlot::Follower(entry.get().subscribe()),
            Entry::Vacant(entry) => {
                let (tx, _rx) = broadcast::channel(1);
                entry.insert(tx.clone());
                SingleflightSlot::Leader(tx)
            }
        }
    }

    /// Remove a completed in-flight operation.
    pub fn complete(&self, key: &K) {
        self.in_flight.remove(key);
    }

    /// Number of operations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

impl<K, V> Default for Singleflight<K, V>
where
    K: std::hash::Hash + Eq + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that ensures singleflight cleanup on drop.
///
/// This prevents leaked slots if the leader is cancelled or panics.
pub struct SingleflightGuard<'a, K, V>
where
    K: std::hash::Hash + Eq + Clone,
    V: Clone,
{
    singleflight: &'a Singleflight<K, V>,
    key: K,
    completed: bool,
}

impl<'a, K, V> SingleflightGuard<'a, K, V>
where
    K: std::hash::Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(singleflight: &'a Singleflight<K, V>, key: K) -> Self {
        Self {
            singleflight,
            key,
            completed: false,
        }
    }

    /// Mark as completed (normal path).
    pub fn complete(mut self) {
        self.singleflight.complete(&self.key);
        self.completed = true;
    }
}

impl<K, V> Drop for SingleflightGuard<'_, K, V>
where
    K: std::hash::Hash + Eq + Clone,
    V: Clone,
{
    fn drop(&mut self) {
        if !self.completed {
            self.singleflight.complete(&self.key);
        }
    }
}
