//! Sharded LRU cache with a high-priority pool.
//!
//! Values are handed out as `Arc`s; an entry whose value is still held by a
//! reader is pinned and skipped by eviction. Each shard keeps two recency
//! lists keyed by an access tick: high-priority entries (index and filter
//! blocks) live in their own pool and are demoted into the low-priority list
//! once the pool exceeds its share of the shard capacity.

use std::collections::{BTreeMap, HashMap};
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Low,
}

struct Node<V> {
    value: Arc<V>,
    charge: usize,
    priority: Priority,
    tick: u64,
    in_high_pool: bool,
}

struct Shard<K, V> {
    capacity: usize,
    high_pri_capacity: usize,
    usage: usize,
    high_pri_usage: usize,
    tick: u64,
    entries: HashMap<K, Node<V>>,
    low: BTreeMap<u64, K>,
    high: BTreeMap<u64, K>,
}

impl<K, V> Shard<K, V>
where
    K: Eq + Hash + Clone,
{
    fn new(capacity: usize, high_pri_ratio: f64) -> Self {
        Self {
            capacity,
            high_pri_capacity: (capacity as f64 * high_pri_ratio) as usize,
            usage: 0,
            high_pri_usage: 0,
            tick: 0,
            entries: HashMap::new(),
            low: BTreeMap::new(),
            high: BTreeMap::new(),
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn unlink(&mut self, node_tick: u64, in_high_pool: bool) {
        if in_high_pool {
            self.high.remove(&node_tick);
        } else {
            self.low.remove(&node_tick);
        }
    }

    fn link(&mut self, key: &K) {
        let tick = self.next_tick();
        let Some(node) = self.entries.get_mut(key) else {
            return;
        };
        node.tick = tick;
        node.in_high_pool = node.priority == Priority::High;
        if node.in_high_pool {
            self.high.insert(tick, key.clone());
        } else {
            self.low.insert(tick, key.clone());
        }
    }

    fn touch(&mut self, key: &K) -> Option<Arc<V>> {
        let (old_tick, in_high_pool, value) = {
            let node = self.entries.get(key)?;
            (node.tick, node.in_high_pool, Arc::clone(&node.value))
        };
        self.unlink(old_tick, in_high_pool);
        if in_high_pool {
            if let Some(node) = self.entries.get(key) {
                self.high_pri_usage -= node.charge;
            }
        }
        self.link(key);
        if let Some(node) = self.entries.get(key) {
            if node.in_high_pool {
                self.high_pri_usage += node.charge;
            }
        }
        self.maintain_pool();
        Some(value)
    }

    /// Demotes the oldest high-priority entries while the pool is over budget.
    fn maintain_pool(&mut self) {
        while self.high_pri_usage > self.high_pri_capacity {
            let Some((&tick, _)) = self.high.iter().next() else {
                break;
            };
            let Some(key) = self.high.remove(&tick) else {
                break;
            };
            if let Some(node) = self.entries.get_mut(&key) {
                node.in_high_pool = false;
                self.high_pri_usage -= node.charge;
            }
            self.low.insert(tick, key);
        }
    }

    fn remove_entry(&mut self, key: &K) -> Option<Node<V>> {
        let node = self.entries.remove(key)?;
        self.unlink(node.tick, node.in_high_pool);
        self.usage -= node.charge;
        if node.in_high_pool {
            self.high_pri_usage -= node.charge;
        }
        Some(node)
    }

    /// Evicts unreferenced entries, oldest low-priority first, until
    /// `needed` more bytes fit. Returns the number evicted.
    fn make_room(&mut self, needed: usize) -> usize {
        let mut evicted = 0;
        while self.usage + needed > self.capacity {
            let victim = self
                .low
                .values()
                .chain(self.high.values())
                .find(|key| {
                    self.entries
                        .get(*key)
                        .map_or(false, |node| Arc::strong_count(&node.value) == 1)
                })
                .cloned();
            match victim {
                Some(key) => {
                    self.remove_entry(&key);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }
}

#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    insert_failures: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn inserts(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }

    pub fn insert_failures(&self) -> u64 {
        self.insert_failures.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

pub struct Cache<K, V> {
    shards: Vec<Mutex<Shard<K, V>>>,
    hasher: std::collections::hash_map::RandomState,
    capacity: usize,
    strict_capacity: bool,
    next_id: AtomicU64,
    usage: AtomicUsize,
    stats: CacheStats,
}

impl<K, V> std::fmt::Debug for Cache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("shards", &self.shards.len())
            .field("capacity", &self.capacity)
            .field("usage", &self.usage.load(Ordering::Relaxed))
            .finish()
    }
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(capacity: usize, shard_bits: u32, high_pri_ratio: f64, strict_capacity: bool) -> Self {
        let num_shards = 1usize << shard_bits.min(12);
        let per_shard = capacity.div_ceil(num_shards);
        let ratio = high_pri_ratio.clamp(0.0, 1.0);
        Self {
            shards: (0..num_shards)
                .map(|_| Mutex::new(Shard::new(per_shard, ratio)))
                .collect(),
            hasher: Default::default(),
            capacity,
            strict_capacity,
            next_id: AtomicU64::new(1),
            usage: AtomicUsize::new(0),
            stats: CacheStats::default(),
        }
    }

    fn shard(&self, key: &K) -> &Mutex<Shard<K, V>> {
        let hash = self.hasher.hash_one(key);
        &self.shards[(hash as usize) & (self.shards.len() - 1)]
    }

    /// Unique prefix for keys owned by one client of the cache.
    pub fn new_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn usage(&self) -> usize {
        self.usage.load(Ordering::Relaxed)
    }

    /// Bytes held by entries a reader still references.
    pub fn pinned_usage(&self) -> usize {
        self.shards
            .iter()
            .filter_map(|s| s.lock().ok())
            .map(|shard| {
                shard
                    .entries
                    .values()
                    .filter(|n| Arc::strong_count(&n.value) > 1)
                    .map(|n| n.charge)
                    .sum::<usize>()
            })
            .sum()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let found = self.shard(key).lock().ok()?.touch(key);
        match found {
            Some(_) => self.stats.hits.fetch_add(1, Ordering::Relaxed),
            None => self.stats.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Inserts `value` charging `charge` bytes. In strict mode the insert
    /// fails with `Incomplete` when pinned entries leave no room.
    pub fn insert(&self, key: K, value: Arc<V>, charge: usize, priority: Priority) -> Result<()> {
        let mut shard = self.shard(&key).lock()?;
        let before = shard.usage;
        shard.remove_entry(&key);
        let evicted = shard.make_room(charge);
        if shard.usage + charge > shard.capacity && self.strict_capacity {
            self.usage
                .fetch_sub(before - shard.usage, Ordering::Relaxed);
            self.stats.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            self.stats.insert_failures.fetch_add(1, Ordering::Relaxed);
            return Err(Error::Incomplete("insert into full cache".into()));
        }

        shard.entries.insert(
            key.clone(),
            Node {
                value,
                charge,
                priority,
                tick: 0,
                in_high_pool: false,
            },
        );
        shard.link(&key);
        shard.usage += charge;
        if priority == Priority::High {
            shard.high_pri_usage += charge;
            shard.maintain_pool();
        }
        let after = shard.usage;
        drop(shard);

        if after >= before {
            self.usage.fetch_add(after - before, Ordering::Relaxed);
        } else {
            self.usage.fetch_sub(before - after, Ordering::Relaxed);
        }
        self.stats.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn erase(&self, key: &K) {
        if let Ok(mut shard) = self.shard(key).lock() {
            if let Some(node) = shard.remove_entry(key) {
                self.usage.fetch_sub(node.charge, Ordering::Relaxed);
            }
        }
    }

    /// Drops every entry matching `pred`, used when a table is deleted.
    pub fn erase_if(&self, pred: impl Fn(&K) -> bool) {
        for shard in &self.shards {
            let Ok(mut shard) = shard.lock() else { continue };
            let victims: Vec<K> = shard.entries.keys().filter(|k| pred(k)).cloned().collect();
            for key in victims {
                if let Some(node) = shard.remove_entry(&key) {
                    self.usage.fetch_sub(node.charge, Ordering::Relaxed);
                }
            }
        }
    }
}
