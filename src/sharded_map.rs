//! A generic concurrent map with publish-once / await semantics.
//!
//! Every slot starts `Pending` (a list of wakers for tasks blocked on it)
//! and transitions exactly once to `Present(value)`; readers that arrive
//! before the value exists wait for it instead of observing a miss. This
//! is the shape the scheduler needs for "has this package finished
//! parsing yet" and "has this target finished building yet" without a
//! separate side channel per map.
//!
//! Sharded over a fixed number of `parking_lot` mutexes keyed by hash, the
//! same way a lock-striped cache would be, to keep contention local to
//! whichever shard a given key lands in.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

const DEFAULT_SHARD_COUNT: usize = 16;

enum Slot<V> {
    Pending(Arc<Notify>),
    Present(V),
}

/// A sharded, async-aware map where a write "publishes" a value that any
/// number of concurrent waiters can block on.
pub struct ShardedMap<K, V> {
    shards: Vec<Mutex<HashMap<K, Slot<V>>>>,
}

impl<K, V> ShardedMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARD_COUNT)
    }

    pub fn with_shards(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        let mut shards = Vec::with_capacity(shard_count);
        shards.resize_with(shard_count, || Mutex::new(HashMap::new()));
        Self { shards }
    }

    fn shard_for(&self, key: &K) -> &Mutex<HashMap<K, Slot<V>>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }

    /// Returns the value if already published, without waiting and
    /// without creating a pending slot as a side effect.
    pub fn get(&self, key: &K) -> Option<V> {
        let shard = self.shard_for(key).lock();
        match shard.get(key) {
            Some(Slot::Present(v)) => Some(v.clone()),
            _ => None,
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Blocks until `key` is published, registering a waiter if it is
    /// not yet present. Returns immediately if already published.
    pub async fn wait(&self, key: &K) -> V {
        loop {
            let notify = {
                let mut shard = self.shard_for(key).lock();
                match shard.get(key) {
                    Some(Slot::Present(v)) => return v.clone(),
                    Some(Slot::Pending(notify)) => Arc::clone(notify),
                    None => {
                        let notify = Arc::new(Notify::new());
                        shard.insert(key.clone(), Slot::Pending(Arc::clone(&notify)));
                        notify
                    }
                }
            };
            notify.notified().await;
        }
    }

    /// Publishes `value` for `key`, waking any waiters. Returns the
    /// previous value if one was already published (callers that expect
    /// publish-once semantics should treat a `Some` return as a bug).
    pub fn publish(&self, key: K, value: V) -> Option<V> {
        let mut shard = self.shard_for(&key).lock();
        let previous = shard.insert(key, Slot::Present(value));
        match previous {
            Some(Slot::Present(old)) => Some(old),
            Some(Slot::Pending(notify)) => {
                notify.notify_waiters();
                None
            }
            None => None,
        }
    }

    /// Registers `key` as pending without a value, so that concurrent
    /// `wait` calls block rather than racing to create the slot. A no-op
    /// if the key already has a slot (pending or present).
    pub fn mark_pending(&self, key: K) {
        let mut shard = self.shard_for(&key).lock();
        shard
            .entry(key)
            .or_insert_with(|| Slot::Pending(Arc::new(Notify::new())));
    }

    /// Atomically checks whether `key` already has a slot and, if not,
    /// publishes `value` in the same lock acquisition. Returns `true`
    /// only for the caller that installed the slot, so concurrent
    /// callers racing to claim the same key can tell who won without a
    /// separate check-then-act pair.
    pub fn claim(&self, key: K, value: V) -> bool {
        let mut shard = self.shard_for(&key).lock();
        if shard.contains_key(&key) {
            false
        } else {
            shard.insert(key, Slot::Present(value));
            true
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every key with a published value. Pending-only keys
    /// are omitted.
    pub fn present_keys(&self) -> Vec<K> {
        self.shards
            .iter()
            .flat_map(|s| {
                s.lock()
                    .iter()
                    .filter_map(|(k, slot)| matches!(slot, Slot::Present(_)).then(|| k.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

impl<K, V> Default for ShardedMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread")]
    async fn wait_blocks_until_publish() {
        let map: Arc<ShardedMap<String, i32>> = Arc::new(ShardedMap::new());
        let reader_map = Arc::clone(&map);
        let reader = tokio::spawn(async move { reader_map.wait(&"k".to_string()).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        map.publish("k".to_string(), 42);
        let value = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("reader timed out")
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn get_does_not_block() {
        let map: ShardedMap<&str, i32> = ShardedMap::new();
        assert_eq!(map.get(&"missing"), None);
        map.publish("k", 1);
        assert_eq!(map.get(&"k"), Some(1));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn many_waiters_all_observe_publish() {
        let map: Arc<ShardedMap<&str, i32>> = Arc::new(ShardedMap::new());
        let mut waiters = Vec::new();
        for _ in 0..32 {
            let map = Arc::clone(&map);
            waiters.push(tokio::spawn(async move { map.wait(&"k").await }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        map.publish("k", 7);
        for w in waiters {
            assert_eq!(w.await.unwrap(), 7);
        }
    }

    #[test]
    fn present_keys_excludes_pending() {
        let map: ShardedMap<&str, i32> = ShardedMap::new();
        map.mark_pending("pending");
        map.publish("present", 1);
        assert_eq!(map.present_keys(), vec!["present"]);
    }

    #[test]
    fn only_one_claimant_wins() {
        let map: ShardedMap<&str, i32> = ShardedMap::new();
        assert!(map.claim("k", 1));
        assert!(!map.claim("k", 2));
        assert_eq!(map.get(&"k"), Some(1));
    }
}
