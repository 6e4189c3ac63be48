//! # Hash Dictionary
//!
//! The primary associative container of the storage core: a chained hash
//! table over power-of-two bucket arrays that grows and shrinks by
//! **incremental rehashing**, so resizing never blocks the request path.
//!
//! ## Design Invariants
//!
//! - Two bucket tables. When no rehash is in progress the second table is
//!   unallocated and holds zero entries; the rehash cursor is −1.
//! - While rehashing, every bucket of the old table below the cursor is
//!   empty: its entries have already migrated to the new table.
//! - Lookups consult both tables; inserts always target the new table
//!   while a rehash is active, so the old table only ever drains.
//! - `used(T0) + used(T1)` equals the logical element count at all times.
//!
//! ## Incremental rehash
//!
//! A rehash migrates a bounded number of buckets per step, with the scan
//! over empty buckets capped at ten times the requested step count.
//! Steps are piggybacked on lookups, inserts, and removals, and can also
//! be driven in bulk with a wall-clock budget ([`Dict::rehash_for`]).
//! Safe iterators suspend stepping for their lifetime.
//!
//! ## Iteration
//!
//! Three traversal primitives with different contracts:
//!
//! - [`Dict::iter`] — borrowed iteration; the shared borrow freezes the
//!   dictionary, making it trivially consistent. Used by the snapshot
//!   writer.
//! - [`Dict::safe_iter`] — handle-based iteration that suspends
//!   incremental rehash; the caller may mutate the dictionary between
//!   [`Dict::next_entry`] calls (deleting the just-yielded entry is
//!   supported; positions are tracked from the chain tail so the delete
//!   neither skips nor repeats an entry).
//! - [`Dict::fast_iter`] — handle-based iteration that forbids mutation:
//!   a fingerprint of both tables is captured at creation and verified
//!   at release; any observed change is a contract violation and panics.
//!
//! [`Dict::scan`] is the fourth primitive: a stateless reverse-bit
//! cursor that visits every bucket exactly once per traversal and
//! tolerates power-of-two resizes between calls (entries present for the
//! whole traversal are yielded at least once, possibly more than once).
//!
//! ## Snapshots (copy-on-write)
//!
//! Chain nodes are reference-counted and every mutation path unshares
//! only the nodes it touches. Cloning the dictionary therefore copies
//! the bucket arrays (pointer copies and reference-count bumps, nothing
//! per-entry) and yields a frozen point-in-time view; the live side
//! keeps mutating at its usual bounded per-operation cost, copying a
//! chain node the first time it touches one the snapshot still shares.
//! This is what lets a background save hand a consistent keyspace to a
//! writer thread without a bulk copy on the request path.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tracing::{debug, trace};
use xxhash_rust::xxh3::xxh3_64_with_seed;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Size of a freshly allocated bucket table.
pub const INITIAL_SIZE: usize = 4;

/// Load factor above which growth happens even when resizing is
/// disabled (during a background save, for instance).
const FORCE_RESIZE_RATIO: usize = 5;

/// Buckets migrated per chunk by [`Dict::rehash_for`].
const REHASH_CHUNK: usize = 100;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by dictionary operations.
///
/// These are structural outcomes, not failures: inserting a present key
/// or removing an absent one is answered with a distinct code and never
/// aborts.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DictError {
    /// The key is already present.
    #[error("key already present")]
    KeyExists,

    /// The key is not present.
    #[error("key not found")]
    NotFound,

    /// A resize was requested while a rehash is already migrating.
    #[error("rehash already in progress")]
    RehashInProgress,

    /// The requested table cannot hold the current entries.
    #[error("target size {requested} cannot hold {used} entries")]
    TargetTooSmall { requested: usize, used: usize },

    /// The table is already at the requested size.
    #[error("table already sized {0}")]
    SameSize(usize),

    /// Automatic resizing is disabled.
    #[error("resizing is disabled")]
    ResizeDisabled,
}

// ------------------------------------------------------------------------------------------------
// Policy
// ------------------------------------------------------------------------------------------------

/// Per-dictionary capability interface: seeded hash computation and key
/// equality.
///
/// Different stores (key table, expire table, caches) share the
/// container with different key semantics, so both operations dispatch
/// through the policy value supplied at creation. Key and value
/// duplication and destruction map to `Clone` and `Drop`.
pub trait DictPolicy<K> {
    /// Hash of `key` under this policy's seed.
    fn hash(&self, key: &K) -> u64;

    /// Whether two keys are equal under this policy.
    fn eq(&self, a: &K, b: &K) -> bool;
}

/// The default policy for byte-string keys: seeded xxh3 hashing and
/// byte-wise equality.
///
/// The seed is supplied at construction ([`BytesPolicy::new`]) or drawn
/// from the thread RNG ([`BytesPolicy::random`]), keeping bucket
/// distribution unpredictable across processes.
#[derive(Debug, Clone, Copy)]
pub struct BytesPolicy {
    seed: u64,
}

impl BytesPolicy {
    /// Policy with an explicit seed (tests, replicated deployments).
    pub fn new(seed: u64) -> Self {
        BytesPolicy { seed }
    }

    /// Policy with a process-random seed.
    pub fn random() -> Self {
        BytesPolicy {
            seed: rand::rng().random(),
        }
    }

    /// The seed in use.
    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl<K: AsRef<[u8]>> DictPolicy<K> for BytesPolicy {
    #[inline]
    fn hash(&self, key: &K) -> u64 {
        xxh3_64_with_seed(key.as_ref(), self.seed)
    }

    #[inline]
    fn eq(&self, a: &K, b: &K) -> bool {
        a.as_ref() == b.as_ref()
    }
}

// ------------------------------------------------------------------------------------------------
// Entries and tables
// ------------------------------------------------------------------------------------------------

type Link<K, V> = Option<Arc<Entry<K, V>>>;

/// One key/value record. Chain links are reference-counted so a cloned
/// dictionary shares every chain with the original; mutations unshare
/// (copy) only the nodes on the path they touch. A node's destructor
/// runs when its last owner lets go.
#[derive(Clone)]
struct Entry<K, V> {
    key: K,
    value: V,
    next: Link<K, V>,
}

/// One power-of-two bucket array. `used` counts the entries reachable
/// from the heads.
#[derive(Clone)]
struct Table<K, V> {
    buckets: Vec<Link<K, V>>,
    used: usize,
}

impl<K, V> Table<K, V> {
    fn unallocated() -> Self {
        Table {
            buckets: Vec::new(),
            used: 0,
        }
    }

    fn with_size(size: usize) -> Self {
        debug_assert!(size.is_power_of_two());
        let mut buckets = Vec::with_capacity(size);
        buckets.resize_with(size, || None);
        Table { buckets, used: 0 }
    }

    #[inline]
    fn size(&self) -> usize {
        self.buckets.len()
    }

    /// Bit mask reducing a hash to a bucket index. Only meaningful on an
    /// allocated table.
    #[inline]
    fn mask(&self) -> u64 {
        debug_assert!(!self.buckets.is_empty());
        (self.buckets.len() - 1) as u64
    }
}

/// Removes the first chain entry matching `matches`, relinking around
/// it. Nodes on the path that a snapshot still shares are unshared
/// (copied) as the cursor passes them.
fn take_from_chain<K, V, F>(head: &mut Link<K, V>, mut matches: F) -> Option<Entry<K, V>>
where
    K: Clone,
    V: Clone,
    F: FnMut(&K) -> bool,
{
    let mut cur = head;
    loop {
        let hit = match cur.as_deref() {
            Some(entry) => matches(&entry.key),
            None => return None,
        };
        if hit {
            let shared = cur.take()?;
            let mut entry = Arc::unwrap_or_clone(shared);
            *cur = entry.next.take();
            return Some(entry);
        }
        match cur {
            Some(arc) => cur = &mut Arc::make_mut(arc).next,
            None => return None,
        }
    }
}

/// Mutable walk to the first chain entry matching `matches`, unsharing
/// the path as it goes.
fn find_in_chain_mut<K, V, F>(head: &mut Link<K, V>, mut matches: F) -> Option<&mut Entry<K, V>>
where
    K: Clone,
    V: Clone,
    F: FnMut(&K) -> bool,
{
    let mut cur = head;
    loop {
        let hit = match cur.as_deref() {
            Some(entry) => matches(&entry.key),
            None => return None,
        };
        if hit {
            return cur.as_mut().map(Arc::make_mut);
        }
        match cur {
            Some(arc) => cur = &mut Arc::make_mut(arc).next,
            None => return None,
        }
    }
}

fn chain_len<K, V>(head: &Link<K, V>) -> usize {
    let mut n = 0;
    let mut cur = head.as_deref();
    while let Some(entry) = cur {
        n += 1;
        cur = entry.next.as_deref();
    }
    n
}

fn nth_entry<K, V>(head: &Link<K, V>, index: usize) -> Option<&Entry<K, V>> {
    let mut cur = head.as_deref();
    let mut i = 0;
    while let Some(entry) = cur {
        if i == index {
            return Some(entry);
        }
        i += 1;
        cur = entry.next.as_deref();
    }
    None
}

// ------------------------------------------------------------------------------------------------
// Dictionary
// ------------------------------------------------------------------------------------------------

/// Counters snapshot returned by [`Dict::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DictStats {
    pub main_size: usize,
    pub main_used: usize,
    pub rehash_size: usize,
    pub rehash_used: usize,
    /// −1 when no rehash is in progress.
    pub rehash_cursor: i64,
    /// Live safe iterators currently suspending the rehash.
    pub paused: u32,
}

/// A chained hash table with incremental rehashing.
///
/// Single-writer by construction: every mutating operation takes
/// `&mut self`, and there is no interior mutability on the tables, so
/// the container upholds its invariants without locks. Keys and values
/// are `Clone` so chain nodes can be shared copy-on-write between the
/// live table and point-in-time clones (see the module docs).
pub struct Dict<K, V, P = BytesPolicy> {
    policy: P,
    tables: [Table<K, V>; 2],
    /// Next bucket of the old table awaiting migration; −1 when idle.
    rehash_idx: i64,
    /// While non-zero, incremental rehash steps are suppressed.
    pause_rehash: u32,
    resize_enabled: bool,
}

impl<K, V, P: Clone> Clone for Dict<K, V, P>
where
    K: Clone,
    V: Clone,
{
    /// Point-in-time snapshot: copies the bucket arrays and bumps the
    /// chain reference counts — no entry data is touched. The copy and
    /// the original diverge node-by-node as either side mutates.
    fn clone(&self) -> Self {
        Dict {
            policy: self.policy.clone(),
            tables: self.tables.clone(),
            rehash_idx: self.rehash_idx,
            // Iterator registrations do not travel with a copy.
            pause_rehash: 0,
            resize_enabled: self.resize_enabled,
        }
    }
}

impl<K, V, P> std::fmt::Debug for Dict<K, V, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dict")
            .field("len", &(self.tables[0].used + self.tables[1].used))
            .field("main_size", &self.tables[0].size())
            .field("rehash_cursor", &self.rehash_idx)
            .finish_non_exhaustive()
    }
}

impl<K: Clone, V: Clone, P: DictPolicy<K>> Dict<K, V, P> {
    /// Creates an empty dictionary. The first table is allocated lazily
    /// on the first insert.
    pub fn new(policy: P) -> Self {
        Dict {
            policy,
            tables: [Table::unallocated(), Table::unallocated()],
            rehash_idx: -1,
            pause_rehash: 0,
            resize_enabled: true,
        }
    }

    /// Creates a dictionary pre-sized to hold at least `capacity`
    /// entries without growing.
    pub fn with_capacity(policy: P, capacity: usize) -> Self {
        let mut dict = Self::new(policy);
        if capacity > 0 {
            dict.grow_table(capacity);
        }
        dict
    }

    // --------------------------------------------------------------------------------------------
    // Counters
    // --------------------------------------------------------------------------------------------

    /// Logical number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.tables[0].used + self.tables[1].used
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the main bucket table (0 before the first insert).
    pub fn main_size(&self) -> usize {
        self.tables[0].size()
    }

    /// True while entries are migrating between the two tables.
    #[inline]
    pub fn is_rehashing(&self) -> bool {
        self.rehash_idx != -1
    }

    pub fn stats(&self) -> DictStats {
        DictStats {
            main_size: self.tables[0].size(),
            main_used: self.tables[0].used,
            rehash_size: self.tables[1].size(),
            rehash_used: self.tables[1].used,
            rehash_cursor: self.rehash_idx,
            paused: self.pause_rehash,
        }
    }

    /// Enables or disables automatic resizing. While disabled, growth
    /// still happens when the load factor exceeds the forced ratio.
    pub fn set_resize(&mut self, enabled: bool) {
        self.resize_enabled = enabled;
    }

    // --------------------------------------------------------------------------------------------
    // Sizing
    // --------------------------------------------------------------------------------------------

    /// Grows the dictionary so the main table holds at least `size`
    /// buckets (rounded up to a power of two).
    ///
    /// Fails if a rehash is already migrating, if the target cannot hold
    /// the current entries, or if the table is already that size.
    pub fn expand(&mut self, size: usize) -> Result<(), DictError> {
        if self.is_rehashing() {
            return Err(DictError::RehashInProgress);
        }
        if size <= self.tables[0].used {
            return Err(DictError::TargetTooSmall {
                requested: size,
                used: self.tables[0].used,
            });
        }
        let realsize = next_power(size);
        if realsize == self.tables[0].size() {
            return Err(DictError::SameSize(realsize));
        }
        self.install_table(realsize);
        Ok(())
    }

    /// Shrinks (or grows) the table to the smallest power of two that
    /// keeps the load ratio at or below one.
    ///
    /// Fails while a rehash is migrating or when resizing is disabled.
    pub fn resize_to_fit(&mut self) -> Result<(), DictError> {
        if !self.resize_enabled {
            return Err(DictError::ResizeDisabled);
        }
        if self.is_rehashing() {
            return Err(DictError::RehashInProgress);
        }
        let minimal = self.tables[0].used.max(INITIAL_SIZE);
        let realsize = next_power(minimal);
        if realsize == self.tables[0].size() {
            return Err(DictError::SameSize(realsize));
        }
        self.install_table(realsize);
        Ok(())
    }

    /// Pre-sizes the table for at least `n` entries without reporting
    /// structural errors. Used when replaying resize hints from a
    /// snapshot; a no-op while rehashing or when already large enough.
    pub fn reserve(&mut self, n: usize) {
        if n == 0 || self.is_rehashing() {
            return;
        }
        if next_power(n.max(INITIAL_SIZE)) > self.tables[0].size() {
            self.grow_table(n);
        }
    }

    /// Allocates a table of exactly `realsize` buckets, either as the
    /// first table or as the rehash target.
    fn install_table(&mut self, realsize: usize) {
        if self.tables[0].size() == 0 {
            self.tables[0] = Table::with_size(realsize);
            debug!(size = realsize, "bucket table allocated");
        } else {
            self.tables[1] = Table::with_size(realsize);
            self.rehash_idx = 0;
            debug!(
                from = self.tables[0].size(),
                to = realsize,
                "incremental rehash started"
            );
        }
    }

    fn grow_table(&mut self, target: usize) {
        let realsize = next_power(target.max(INITIAL_SIZE));
        if realsize == self.tables[0].size() {
            return;
        }
        self.install_table(realsize);
    }

    /// Auto-expand check run before every insert's index computation.
    fn expand_if_needed(&mut self) {
        if self.is_rehashing() {
            return;
        }
        if self.tables[0].size() == 0 {
            self.grow_table(INITIAL_SIZE);
            return;
        }
        let used = self.tables[0].used;
        let size = self.tables[0].size();
        if used >= size && (self.resize_enabled || used / size > FORCE_RESIZE_RATIO) {
            self.grow_table(used * 2);
        }
    }

    // --------------------------------------------------------------------------------------------
    // Incremental rehash
    // --------------------------------------------------------------------------------------------

    /// Migrates up to `n` buckets from the old table to the new one.
    ///
    /// The scan over empty buckets is bounded at `10 × n` probes per
    /// call so a single step cannot stall on a sparse table. Returns
    /// `true` while more migration work remains. Suppressed (returning
    /// `true`) while a safe iterator holds the dictionary.
    pub fn rehash(&mut self, n: usize) -> bool {
        if !self.is_rehashing() {
            return false;
        }
        if self.pause_rehash > 0 {
            return true;
        }
        let mut empty_visits = n.saturating_mul(10);
        let mut remaining = n;
        while remaining > 0 && self.tables[0].used > 0 {
            remaining -= 1;
            let policy = &self.policy;
            let [t0, t1] = &mut self.tables;
            debug_assert!((self.rehash_idx as usize) < t0.size());

            let mut idx = self.rehash_idx as usize;
            while t0.buckets[idx].is_none() {
                idx += 1;
                self.rehash_idx = idx as i64;
                empty_visits -= 1;
                if empty_visits == 0 {
                    return true;
                }
            }

            // Move every entry of this bucket to its slot in the
            // target, unsharing nodes a snapshot still holds.
            let mut chain = t0.buckets[idx].take();
            while let Some(mut arc) = chain {
                let entry = Arc::make_mut(&mut arc);
                chain = entry.next.take();
                let h = policy.hash(&entry.key);
                let di = (h & t1.mask()) as usize;
                entry.next = t1.buckets[di].take();
                t1.buckets[di] = Some(arc);
                t0.used -= 1;
                t1.used += 1;
            }
            self.rehash_idx = (idx + 1) as i64;
        }

        if self.tables[0].used == 0 {
            // Old table drained: release it and promote the new one.
            self.tables.swap(0, 1);
            self.tables[1] = Table::unallocated();
            self.rehash_idx = -1;
            trace!(size = self.tables[0].size(), "incremental rehash finished");
            return false;
        }
        true
    }

    /// Piggybacked single-step rehash, run by lookups, inserts, and
    /// removals while no safe iterator is live.
    #[inline]
    fn rehash_step(&mut self) {
        if self.pause_rehash == 0 {
            self.rehash(1);
        }
    }

    /// Migrates in chunks of 100 buckets until the wall-clock budget
    /// elapses or the rehash completes. Returns the number of chunks
    /// performed. Does nothing while a safe iterator is live.
    pub fn rehash_for(&mut self, budget: Duration) -> usize {
        if self.pause_rehash > 0 {
            return 0;
        }
        let start = Instant::now();
        let mut chunks = 0;
        while self.rehash(REHASH_CHUNK) {
            chunks += 1;
            if start.elapsed() >= budget {
                break;
            }
        }
        chunks
    }

    // --------------------------------------------------------------------------------------------
    // Lookup
    // --------------------------------------------------------------------------------------------

    fn lookup_entry(&self, key: &K) -> Option<&Entry<K, V>> {
        if self.len() == 0 {
            return None;
        }
        let h = self.policy.hash(key);
        for table in &self.tables {
            if table.size() == 0 {
                continue;
            }
            let idx = (h & table.mask()) as usize;
            let mut cur = table.buckets[idx].as_deref();
            while let Some(entry) = cur {
                if self.policy.eq(&entry.key, key) {
                    return Some(entry);
                }
                cur = entry.next.as_deref();
            }
        }
        None
    }

    fn lookup_entry_mut(&mut self, key: &K) -> Option<&mut Entry<K, V>> {
        if self.len() == 0 {
            return None;
        }
        let h = self.policy.hash(key);
        // Locate the owning table with a shared walk first, so a miss
        // never unshares any snapshot-held node.
        let mut owner = None;
        for (t, table) in self.tables.iter().enumerate() {
            if table.size() == 0 {
                continue;
            }
            let idx = (h & table.mask()) as usize;
            let mut cur = table.buckets[idx].as_deref();
            while let Some(entry) = cur {
                if self.policy.eq(&entry.key, key) {
                    owner = Some(t);
                    break;
                }
                cur = entry.next.as_deref();
            }
            if owner.is_some() {
                break;
            }
        }
        let t = owner?;
        let idx = (h & self.tables[t].mask()) as usize;
        let policy = &self.policy;
        find_in_chain_mut(&mut self.tables[t].buckets[idx], |k| policy.eq(k, key))
    }

    /// Looks up a key, advancing the rehash by one step when active.
    pub fn find(&mut self, key: &K) -> Option<&V> {
        if self.is_rehashing() {
            self.rehash_step();
        }
        self.lookup_entry(key).map(|e| &e.value)
    }

    /// Mutable lookup, advancing the rehash by one step when active.
    pub fn find_mut(&mut self, key: &K) -> Option<&mut V> {
        if self.is_rehashing() {
            self.rehash_step();
        }
        self.lookup_entry_mut(key).map(|e| &mut e.value)
    }

    /// Read-only lookup that never advances the rehash.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.lookup_entry(key).map(|e| &e.value)
    }

    /// Whether the key is present.
    pub fn contains(&self, key: &K) -> bool {
        self.lookup_entry(key).is_some()
    }

    // --------------------------------------------------------------------------------------------
    // Insertion
    // --------------------------------------------------------------------------------------------

    /// Prepends a new entry into its bucket of the target table.
    fn push_front(&mut self, hash: u64, key: K, value: V) {
        let t = if self.is_rehashing() { 1 } else { 0 };
        let table = &mut self.tables[t];
        let idx = (hash & table.mask()) as usize;
        let next = table.buckets[idx].take();
        table.buckets[idx] = Some(Arc::new(Entry { key, value, next }));
        table.used += 1;
    }

    /// Inserts a new key. Fails with [`DictError::KeyExists`] when the
    /// key is already present.
    pub fn insert(&mut self, key: K, value: V) -> Result<(), DictError> {
        if self.is_rehashing() {
            self.rehash_step();
        }
        self.expand_if_needed();
        if self.lookup_entry(&key).is_some() {
            return Err(DictError::KeyExists);
        }
        let h = self.policy.hash(&key);
        self.push_front(h, key, value);
        Ok(())
    }

    /// Returns the value for `key`, inserting `default()` first when the
    /// key is absent. The boolean is `true` when an insert happened.
    pub fn find_or_insert_with<F>(&mut self, key: K, default: F) -> (&mut V, bool)
    where
        F: FnOnce() -> V,
    {
        if self.is_rehashing() {
            self.rehash_step();
        }
        self.expand_if_needed();
        if self.lookup_entry(&key).is_some() {
            let entry = self
                .lookup_entry_mut(&key)
                .expect("entry vanished between lookups");
            return (&mut entry.value, false);
        }
        let h = self.policy.hash(&key);
        let t = if self.is_rehashing() { 1 } else { 0 };
        let idx = (h & self.tables[t].mask()) as usize;
        let table = &mut self.tables[t];
        let next = table.buckets[idx].take();
        table.buckets[idx] = Some(Arc::new(Entry {
            key,
            value: default(),
            next,
        }));
        table.used += 1;
        let entry = self.tables[t].buckets[idx]
            .as_mut()
            .map(Arc::make_mut)
            .expect("entry just inserted");
        (&mut entry.value, true)
    }

    /// Inserts or overwrites. Returns `true` when the key was added,
    /// `false` when an existing value was replaced. On replacement the
    /// new value is installed before the old one is destroyed.
    pub fn replace(&mut self, key: K, value: V) -> bool {
        if self.is_rehashing() {
            self.rehash_step();
        }
        if self.contains(&key) {
            if let Some(entry) = self.lookup_entry_mut(&key) {
                let old = std::mem::replace(&mut entry.value, value);
                drop(old);
            }
            return false;
        }
        self.expand_if_needed();
        let h = self.policy.hash(&key);
        self.push_front(h, key, value);
        true
    }

    // --------------------------------------------------------------------------------------------
    // Removal
    // --------------------------------------------------------------------------------------------

    /// Detaches an entry, returning the owned key and value. Dropping
    /// the pair runs the destructors; handing it elsewhere (a
    /// background free queue) defers them. An entry still shared with a
    /// point-in-time clone is copied out; the clone keeps its view.
    pub fn unlink(&mut self, key: &K) -> Option<(K, V)> {
        if self.len() == 0 {
            return None;
        }
        if self.is_rehashing() {
            self.rehash_step();
        }
        let h = self.policy.hash(key);
        let policy = &self.policy;
        for table in &mut self.tables {
            if table.size() == 0 {
                continue;
            }
            let idx = (h & table.mask()) as usize;
            if let Some(entry) = take_from_chain(&mut table.buckets[idx], |k| policy.eq(k, key)) {
                table.used -= 1;
                let Entry { key, value, .. } = entry;
                return Some((key, value));
            }
        }
        None
    }

    /// Removes a key, destroying its entry. Fails with
    /// [`DictError::NotFound`] when the key is absent.
    pub fn remove(&mut self, key: &K) -> Result<(), DictError> {
        match self.unlink(key) {
            Some(_) => Ok(()),
            None => Err(DictError::NotFound),
        }
    }

    /// Drops every entry and releases both tables.
    pub fn clear(&mut self) {
        self.tables = [Table::unallocated(), Table::unallocated()];
        self.rehash_idx = -1;
        debug!("dictionary cleared");
    }

    // --------------------------------------------------------------------------------------------
    // Random access
    // --------------------------------------------------------------------------------------------

    /// Picks one entry approximately uniformly: a random non-empty
    /// bucket first, then a uniform position within its chain. An entry
    /// sharing a crowded bucket is individually a little less likely
    /// than one alone in its bucket (bucket bias).
    pub fn random_entry<'a, R: Rng + ?Sized>(&'a mut self, rng: &mut R) -> Option<(&'a K, &'a V)> {
        if self.len() == 0 {
            return None;
        }
        if self.is_rehashing() {
            self.rehash_step();
        }

        let head = if self.is_rehashing() {
            let s0 = self.tables[0].size() as u64;
            let s1 = self.tables[1].size() as u64;
            // Buckets below the cursor are known empty, skip them.
            let start = self.rehash_idx as u64;
            loop {
                let h = start + rng.random_range(0..(s0 + s1 - start));
                let bucket = if h >= s0 {
                    &self.tables[1].buckets[(h - s0) as usize]
                } else {
                    &self.tables[0].buckets[h as usize]
                };
                if let Some(entry) = bucket.as_deref() {
                    break entry;
                }
            }
        } else {
            let size = self.tables[0].size() as u64;
            loop {
                let idx = rng.random_range(0..size) as usize;
                if let Some(entry) = self.tables[0].buckets[idx].as_deref() {
                    break entry;
                }
            }
        };

        // Second stage: uniform within the chain.
        let mut len = 1;
        let mut cur = head.next.as_deref();
        while let Some(entry) = cur {
            len += 1;
            cur = entry.next.as_deref();
        }
        let mut entry = head;
        for _ in 0..rng.random_range(0..len) {
            entry = entry.next.as_deref().expect("chain shorter than counted");
        }
        Some((&entry.key, &entry.value))
    }

    /// Collects up to `count` entries with bounded effort: consecutive
    /// buckets from a random start, re-randomizing after sustained
    /// emptiness, with total probes capped at `10 × count`. May return
    /// fewer entries than requested; intended for approximation
    /// algorithms such as eviction sampling, not for fair selection.
    pub fn sample<'a, R: Rng + ?Sized>(
        &'a mut self,
        rng: &mut R,
        count: usize,
    ) -> Vec<(&'a K, &'a V)> {
        let count = count.min(self.len());
        if count == 0 {
            return Vec::new();
        }

        let mut steps = count;
        while steps > 0 && self.is_rehashing() && self.pause_rehash == 0 {
            self.rehash(1);
            steps -= 1;
        }

        let tables = if self.is_rehashing() { 2 } else { 1 };
        let mut maxmask = self.tables[0].mask();
        if tables == 2 {
            maxmask = maxmask.max(self.tables[1].mask());
        }

        let mut i = rng.random::<u64>() & maxmask;
        let mut empty_run = 0usize;
        let mut max_probes = count.saturating_mul(10);
        let mut out: Vec<(&K, &V)> = Vec::with_capacity(count);

        while out.len() < count && max_probes > 0 {
            max_probes -= 1;
            for t in 0..tables {
                // Buckets of the old table below the cursor are empty;
                // redirect or skip depending on the new table's span.
                if tables == 2 && t == 0 && i < self.rehash_idx as u64 {
                    if i >= self.tables[1].size() as u64 {
                        i = self.rehash_idx as u64;
                    } else {
                        continue;
                    }
                }
                if i >= self.tables[t].size() as u64 {
                    continue;
                }
                match self.tables[t].buckets[i as usize].as_deref() {
                    None => {
                        empty_run += 1;
                        if empty_run >= 5 && empty_run > count {
                            i = rng.random::<u64>() & maxmask;
                            empty_run = 0;
                        }
                    }
                    Some(head) => {
                        empty_run = 0;
                        let mut cur = Some(head);
                        while let Some(entry) = cur {
                            out.push((&entry.key, &entry.value));
                            if out.len() == count {
                                return out;
                            }
                            cur = entry.next.as_deref();
                        }
                    }
                }
            }
            i = (i + 1) & maxmask;
        }
        out
    }

    // --------------------------------------------------------------------------------------------
    // Scan
    // --------------------------------------------------------------------------------------------

    /// Stateless traversal step: visits the bucket(s) selected by
    /// `cursor` and returns the next cursor, `0` when the traversal is
    /// complete.
    ///
    /// Start at cursor `0` and repeat until `0` comes back. The cursor
    /// construction — reverse the bit order within the current mask,
    /// increment, reverse again — guarantees that every bucket the
    /// dictionary had during the whole traversal is visited, even across
    /// power-of-two resizes between calls. Entries may be yielded more
    /// than once; entries present for the entire traversal are yielded
    /// at least once.
    ///
    /// While a rehash is active both tables are visited: the smaller
    /// table once, and for its position every corresponding larger-table
    /// bucket (the higher-bit expansions).
    pub fn scan<F>(&self, cursor: u64, mut visit: F) -> u64
    where
        F: FnMut(&K, &V),
    {
        if self.len() == 0 {
            return 0;
        }
        let mut v = cursor;
        if !self.is_rehashing() {
            let t0 = &self.tables[0];
            let m0 = t0.mask();
            scan_bucket(&t0.buckets[(v & m0) as usize], &mut visit);
            v |= !m0;
            v = v.reverse_bits().wrapping_add(1).reverse_bits();
        } else {
            let (small, large) = if self.tables[0].size() <= self.tables[1].size() {
                (&self.tables[0], &self.tables[1])
            } else {
                (&self.tables[1], &self.tables[0])
            };
            let m0 = small.mask();
            let m1 = large.mask();
            scan_bucket(&small.buckets[(v & m0) as usize], &mut visit);
            loop {
                scan_bucket(&large.buckets[(v & m1) as usize], &mut visit);
                v |= !m1;
                v = v.reverse_bits().wrapping_add(1).reverse_bits();
                if v & (m0 ^ m1) == 0 {
                    break;
                }
            }
        }
        v
    }

    // --------------------------------------------------------------------------------------------
    // Iteration
    // --------------------------------------------------------------------------------------------

    /// Borrowed iteration over every entry. The shared borrow freezes
    /// the dictionary for the iterator's lifetime, so no rehash step can
    /// run and no entry can move; this is the traversal the snapshot
    /// writer uses.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            tables: [&self.tables[0], &self.tables[1]],
            table: 0,
            bucket: 0,
            cur: None,
        }
    }

    /// Starts a safe iteration and suspends incremental rehash until the
    /// handle is released. The caller may mutate the dictionary between
    /// [`Dict::next_entry`] calls; deleting the entry most recently
    /// yielded is fully supported. Entries inserted during the iteration
    /// may or may not be yielded.
    pub fn safe_iter(&mut self) -> SafeIter {
        self.pause_rehash += 1;
        SafeIter {
            pos: IterPos::start(),
        }
    }

    /// Yields the next entry of a safe iteration.
    pub fn next_entry<'a>(&'a self, it: &mut SafeIter) -> Option<(&'a K, &'a V)> {
        self.advance(&mut it.pos)
    }

    /// Ends a safe iteration, resuming incremental rehash once the last
    /// outstanding safe iterator is gone.
    pub fn release_safe_iter(&mut self, it: SafeIter) {
        drop(it);
        debug_assert!(self.pause_rehash > 0, "release without a live safe iterator");
        self.pause_rehash = self.pause_rehash.saturating_sub(1);
    }

    /// Starts a fast iteration. No rehash suspension: instead a
    /// fingerprint of both tables is captured now and verified at
    /// [`Dict::release_fast_iter`]; the caller promises not to mutate.
    pub fn fast_iter(&self) -> FastIter {
        FastIter {
            pos: IterPos::start(),
            fingerprint: self.fingerprint(),
        }
    }

    /// Yields the next entry of a fast iteration.
    pub fn next_entry_fast<'a>(&'a self, it: &mut FastIter) -> Option<(&'a K, &'a V)> {
        self.advance(&mut it.pos)
    }

    /// Ends a fast iteration.
    ///
    /// # Panics
    ///
    /// Panics when the dictionary was mutated during the iteration — a
    /// contract violation, detected by fingerprint comparison.
    pub fn release_fast_iter(&self, it: FastIter) {
        let now = self.fingerprint();
        assert_eq!(
            it.fingerprint, now,
            "dictionary mutated during fast iteration ({:#018x} -> {now:#018x})",
            it.fingerprint
        );
    }

    /// A 64-bit digest of both table pointers, sizes, and used counts.
    /// Any insert, removal, or resize changes it.
    pub fn fingerprint(&self) -> u64 {
        let integers = [
            self.tables[0].buckets.as_ptr() as usize as u64,
            self.tables[0].size() as u64,
            self.tables[0].used as u64,
            self.tables[1].buckets.as_ptr() as usize as u64,
            self.tables[1].size() as u64,
            self.tables[1].used as u64,
        ];
        let mut hash: u64 = 0;
        for v in integers {
            hash = hash.wrapping_add(v);
            // 64-bit integer finalizer (Wang).
            hash = (!hash).wrapping_add(hash << 21);
            hash ^= hash >> 24;
            hash = hash.wrapping_add(hash << 3).wrapping_add(hash << 8);
            hash ^= hash >> 14;
            hash = hash.wrapping_add(hash << 2).wrapping_add(hash << 4);
            hash ^= hash >> 28;
            hash = hash.wrapping_add(hash << 31);
        }
        hash
    }

    /// Shared walk for the handle-based iterators.
    ///
    /// Positions are tracked as (table, bucket, entries-left counted
    /// from the chain tail). New entries prepend at the head, so both a
    /// prepend and a delete of an already-yielded entry leave the
    /// remaining tail positions unchanged.
    fn advance<'a>(&'a self, pos: &mut IterPos) -> Option<(&'a K, &'a V)> {
        if pos.finished {
            return None;
        }
        loop {
            let table = &self.tables[pos.table];
            if pos.bucket >= table.size() {
                if pos.table == 0 && self.is_rehashing() {
                    pos.table = 1;
                    pos.bucket = 0;
                    pos.remaining = None;
                    continue;
                }
                pos.finished = true;
                return None;
            }
            let len = chain_len(&table.buckets[pos.bucket]);
            let rem = match pos.remaining {
                None => len,
                Some(r) => r.min(len),
            };
            if rem == 0 {
                pos.bucket += 1;
                pos.remaining = None;
                continue;
            }
            pos.remaining = Some(rem - 1);
            match nth_entry(&table.buckets[pos.bucket], len - rem) {
                Some(entry) => return Some((&entry.key, &entry.value)),
                None => {
                    pos.bucket += 1;
                    pos.remaining = None;
                }
            }
        }
    }
}

/// Smallest power of two greater than or equal to `target`.
fn next_power(target: usize) -> usize {
    target
        .checked_next_power_of_two()
        .unwrap_or(1 << (usize::BITS - 1))
}

fn scan_bucket<K, V, F: FnMut(&K, &V)>(head: &Link<K, V>, visit: &mut F) {
    let mut cur = head.as_deref();
    while let Some(entry) = cur {
        visit(&entry.key, &entry.value);
        cur = entry.next.as_deref();
    }
}

// ------------------------------------------------------------------------------------------------
// Iterator types
// ------------------------------------------------------------------------------------------------

/// Borrowed iterator over `(&K, &V)`, both tables in bucket order.
pub struct Iter<'a, K, V> {
    tables: [&'a Table<K, V>; 2],
    table: usize,
    bucket: usize,
    cur: Option<&'a Entry<K, V>>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.cur {
                self.cur = entry.next.as_deref();
                return Some((&entry.key, &entry.value));
            }
            let table = self.tables[self.table];
            if self.bucket >= table.size() {
                if self.table == 0 {
                    self.table = 1;
                    self.bucket = 0;
                    continue;
                }
                return None;
            }
            self.cur = table.buckets[self.bucket].as_deref();
            self.bucket += 1;
        }
    }
}

/// Walk position shared by the handle-based iterators.
#[derive(Debug, Clone, Copy)]
struct IterPos {
    table: usize,
    bucket: usize,
    /// Entries still to yield in the current bucket, counted from the
    /// chain tail; `None` until the bucket is entered.
    remaining: Option<usize>,
    finished: bool,
}

impl IterPos {
    fn start() -> Self {
        IterPos {
            table: 0,
            bucket: 0,
            remaining: None,
            finished: false,
        }
    }
}

/// Handle for a mutation-tolerant iteration; holds no borrow of the
/// dictionary. Must be returned through [`Dict::release_safe_iter`].
#[derive(Debug)]
pub struct SafeIter {
    pos: IterPos,
}

/// Handle for a read-only iteration verified by fingerprint at release.
#[derive(Debug)]
pub struct FastIter {
    pos: IterPos,
    fingerprint: u64,
}
