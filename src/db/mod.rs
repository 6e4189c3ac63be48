//! # Keyspace
//!
//! Numbered databases over the hash dictionary, and the [`Store`] that
//! owns them.
//!
//! ## Design Invariants
//!
//! - Each [`Database`] is a pair of dictionaries sharing one hash seed:
//!   the **main** dictionary maps keys to [`Object`]s, the **expires**
//!   dictionary maps the same keys to absolute expiry times in
//!   milliseconds. An expires entry without a main entry never exists.
//! - The [`Store`] is single-writer: every mutating operation takes
//!   `&mut self`, mirroring the dictionary's contract.
//! - `dirty` counts mutations since the last completed snapshot save; a
//!   background save captures it at start and subtracts that amount on
//!   success, so writes landing mid-save stay counted.
//!
//! ## Deferred deletion
//!
//! Removing a large aggregate on the request path would stall it for
//! the duration of the destructor. [`Store::remove_async`] unlinks the
//! entry immediately and, when the value's
//! [`free_effort`](Value::free_effort) exceeds the configured
//! threshold, ships it to the lazy-free worker;
//! [`Store::flush_db_async`] swaps out the whole dictionary pair and
//! frees it in the background.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::time::SystemTime;

use thiserror::Error;
use tracing::{debug, trace};

use crate::background::{BackgroundError, BackgroundWorkers, FreePayload, Job};
use crate::dict::{BytesPolicy, Dict};
use crate::object::{Bytes, Object, Value};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by keyspace operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// Database index beyond the configured count.
    #[error("database index {0} out of range")]
    BadIndex(usize),

    /// The key the operation requires is absent.
    #[error("no such key")]
    NoSuchKey,

    /// Error from the background work queue.
    #[error("background queue error: {0}")]
    Background(#[from] BackgroundError),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Keyspace configuration, passed to [`Store::new`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Number of numbered databases.
    pub databases: usize,

    /// Free-effort threshold above which an asynchronous delete defers
    /// the destructor to the lazy-free worker.
    pub lazyfree_threshold: usize,

    /// Hash seed shared by every dictionary; `None` draws a random one.
    pub hash_seed: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            databases: 16,
            lazyfree_threshold: 64,
            hash_seed: None,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Database
// ------------------------------------------------------------------------------------------------

/// One numbered database: the main dictionary plus expiry metadata.
#[derive(Clone)]
pub struct Database {
    index: usize,
    policy: BytesPolicy,
    dict: Dict<Bytes, Object>,
    expires: Dict<Bytes, u64>,
}

impl Database {
    pub(crate) fn new(index: usize, policy: BytesPolicy) -> Self {
        Database {
            index,
            policy,
            dict: Dict::new(policy),
            expires: Dict::new(policy),
        }
    }

    /// Database number.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.dict.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dict.len() == 0
    }

    /// Number of keys carrying an expiry.
    pub fn expires_len(&self) -> usize {
        self.expires.len()
    }

    /// Bucket-array size of the main dictionary (stats and tests).
    pub fn main_table_size(&self) -> usize {
        self.dict.main_size()
    }

    /// Stores `value` under `key`, overwriting any previous object and
    /// clearing any previous expiry. Returns `true` when the key is new.
    pub fn set(&mut self, key: &[u8], value: Value) -> bool {
        let key = Bytes::from_slice(key);
        self.expires.unlink(&key);
        let added = self.dict.replace(key, Object::new(value));
        trace!(db = self.index, added, "key set");
        added
    }

    /// Installs a fully-formed object, optionally with an expiry.
    /// Used when replaying a snapshot; keeps existing semantics of
    /// [`Database::set`] otherwise.
    pub fn install(&mut self, key: Bytes, object: Object, expire_at_ms: Option<u64>) {
        if let Some(at) = expire_at_ms {
            self.expires.replace(key.clone(), at);
        } else {
            self.expires.unlink(&key);
        }
        self.dict.replace(key, object);
    }

    /// Looks up a value, advancing the dictionary rehash by one step.
    pub fn get(&mut self, key: &[u8]) -> Option<&Value> {
        let key = Bytes::from_slice(key);
        self.dict.find(&key).map(|obj| &obj.value)
    }

    /// Read-only object lookup (no rehash step).
    pub fn object(&self, key: &[u8]) -> Option<&Object> {
        self.dict.get(&Bytes::from_slice(key))
    }

    /// Mutable object lookup, for touching access metadata.
    pub fn object_mut(&mut self, key: &[u8]) -> Option<&mut Object> {
        self.dict.find_mut(&Bytes::from_slice(key))
    }

    /// Synchronous removal. Returns `true` when the key existed; its
    /// destructors run on the calling thread.
    pub fn remove(&mut self, key: &[u8]) -> bool {
        let key = Bytes::from_slice(key);
        self.expires.unlink(&key);
        self.dict.unlink(&key).is_some()
    }

    /// Removal with a deferred destructor: the entry is unlinked
    /// immediately, and the object is shipped to the lazy-free worker
    /// when destroying it would exceed `threshold` effort.
    pub fn remove_async(
        &mut self,
        key: &[u8],
        threshold: usize,
        workers: &BackgroundWorkers,
    ) -> Result<bool, DbError> {
        let key = Bytes::from_slice(key);
        self.expires.unlink(&key);
        match self.dict.unlink(&key) {
            None => Ok(false),
            Some((_key, object)) => {
                let effort = object.value.free_effort();
                if effort > threshold {
                    debug!(db = self.index, effort, "value freed in background");
                    workers.submit(Job::Free(FreePayload::Value(Box::new(object))))?;
                } else {
                    drop(object);
                }
                Ok(true)
            }
        }
    }

    /// Sets an absolute expiry (Unix milliseconds) on an existing key.
    pub fn set_expire(&mut self, key: &[u8], at_ms: u64) -> Result<(), DbError> {
        let key = Bytes::from_slice(key);
        if !self.dict.contains(&key) {
            return Err(DbError::NoSuchKey);
        }
        self.expires.replace(key, at_ms);
        Ok(())
    }

    /// Clears a key's expiry. Returns `true` when one was present.
    pub fn remove_expire(&mut self, key: &[u8]) -> bool {
        self.expires.unlink(&Bytes::from_slice(key)).is_some()
    }

    /// The key's absolute expiry in Unix milliseconds, if any.
    pub fn expire_of(&self, key: &[u8]) -> Option<u64> {
        self.expires.get(&Bytes::from_slice(key)).copied()
    }

    /// Expiry lookup by an already-built key, used by the snapshot
    /// writer while iterating the main dictionary.
    pub(crate) fn expire_of_key(&self, key: &Bytes) -> Option<u64> {
        self.expires.get(key).copied()
    }

    /// Iterates every `(key, object)` pair. The shared borrow freezes
    /// both dictionaries, so this is safe-iteration by construction.
    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &Object)> {
        self.dict.iter()
    }

    /// Pre-sizes both dictionaries (snapshot resize hints).
    pub fn reserve(&mut self, main: usize, expires: usize) {
        self.dict.reserve(main);
        self.expires.reserve(expires);
    }

    /// Shrinks both dictionaries to fit their contents.
    pub fn resize_to_fit(&mut self) {
        let _ = self.dict.resize_to_fit();
        let _ = self.expires.resize_to_fit();
    }

    /// Enables or disables automatic resizing on both dictionaries.
    pub fn set_resize(&mut self, enabled: bool) {
        self.dict.set_resize(enabled);
        self.expires.set_resize(enabled);
    }

    /// Drops every key synchronously.
    pub fn clear(&mut self) -> usize {
        let removed = self.dict.len();
        self.dict.clear();
        self.expires.clear();
        removed
    }

    /// Swaps both dictionaries out, leaving the database empty, and
    /// returns the detached pair for deferred destruction.
    pub(crate) fn take_contents(&mut self) -> (Dict<Bytes, Object>, Dict<Bytes, u64>) {
        (
            std::mem::replace(&mut self.dict, Dict::new(self.policy)),
            std::mem::replace(&mut self.expires, Dict::new(self.policy)),
        )
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("index", &self.index)
            .field("keys", &self.dict.len())
            .field("expires", &self.expires.len())
            .finish()
    }
}

// ------------------------------------------------------------------------------------------------
// Store
// ------------------------------------------------------------------------------------------------

/// The whole keyspace: numbered databases plus save bookkeeping.
pub struct Store {
    databases: Vec<Database>,
    config: StoreConfig,
    /// Mutations since the last completed snapshot save.
    dirty: u64,
    last_save: Option<SystemTime>,
}

impl Store {
    /// Creates an empty keyspace with `config.databases` databases, all
    /// sharing one hash seed.
    pub fn new(config: StoreConfig) -> Self {
        let seed = config.hash_seed.unwrap_or_else(rand::random);
        let policy = BytesPolicy::new(seed);
        let databases = (0..config.databases)
            .map(|index| Database::new(index, policy))
            .collect();
        Store {
            databases,
            config,
            dirty: 0,
            last_save: None,
        }
    }

    pub fn database_count(&self) -> usize {
        self.databases.len()
    }

    /// All databases, for the snapshot writer.
    pub fn databases(&self) -> &[Database] {
        &self.databases
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn db(&self, index: usize) -> Result<&Database, DbError> {
        self.databases.get(index).ok_or(DbError::BadIndex(index))
    }

    pub fn db_mut(&mut self, index: usize) -> Result<&mut Database, DbError> {
        self.databases
            .get_mut(index)
            .ok_or(DbError::BadIndex(index))
    }

    // --------------------------------------------------------------------------------------------
    // Keyed operations (dirty-tracked)
    // --------------------------------------------------------------------------------------------

    /// Stores a value. Returns `true` when the key is new.
    pub fn set(&mut self, db: usize, key: &[u8], value: Value) -> Result<bool, DbError> {
        let added = self.db_mut(db)?.set(key, value);
        self.dirty += 1;
        Ok(added)
    }

    /// Looks up a value.
    pub fn get(&mut self, db: usize, key: &[u8]) -> Result<Option<&Value>, DbError> {
        Ok(self.db_mut(db)?.get(key))
    }

    /// Synchronous removal.
    pub fn remove(&mut self, db: usize, key: &[u8]) -> Result<bool, DbError> {
        let removed = self.db_mut(db)?.remove(key);
        if removed {
            self.dirty += 1;
        }
        Ok(removed)
    }

    /// Removal with the destructor routed through the lazy-free worker
    /// when the value is expensive to destroy.
    pub fn remove_async(
        &mut self,
        db: usize,
        key: &[u8],
        workers: &BackgroundWorkers,
    ) -> Result<bool, DbError> {
        let threshold = self.config.lazyfree_threshold;
        let removed = self.db_mut(db)?.remove_async(key, threshold, workers)?;
        if removed {
            self.dirty += 1;
        }
        Ok(removed)
    }

    /// Sets an absolute expiry (Unix milliseconds) on an existing key.
    pub fn set_expire(&mut self, db: usize, key: &[u8], at_ms: u64) -> Result<(), DbError> {
        self.db_mut(db)?.set_expire(key, at_ms)?;
        self.dirty += 1;
        Ok(())
    }

    /// The key's absolute expiry, if any.
    pub fn expire_of(&self, db: usize, key: &[u8]) -> Result<Option<u64>, DbError> {
        Ok(self.db(db)?.expire_of(key))
    }

    /// Drops every key of one database synchronously.
    pub fn flush_db(&mut self, db: usize) -> Result<usize, DbError> {
        let removed = self.db_mut(db)?.clear();
        self.dirty += removed as u64;
        debug!(db, removed, "database flushed");
        Ok(removed)
    }

    /// Drops every key of one database with destruction deferred to the
    /// lazy-free worker: the dictionary pair is swapped out immediately.
    pub fn flush_db_async(
        &mut self,
        db: usize,
        workers: &BackgroundWorkers,
    ) -> Result<usize, DbError> {
        let database = self.db_mut(db)?;
        let removed = database.len();
        let (main, expires) = database.take_contents();
        workers.submit(Job::Free(FreePayload::Database { main, expires }))?;
        self.dirty += removed as u64;
        debug!(db, removed, "database flushed in background");
        Ok(removed)
    }

    // --------------------------------------------------------------------------------------------
    // Save bookkeeping
    // --------------------------------------------------------------------------------------------

    /// Mutations since the last completed save.
    pub fn dirty(&self) -> u64 {
        self.dirty
    }

    /// Counts additional out-of-band mutations.
    pub fn mark_dirty(&mut self, n: u64) {
        self.dirty += n;
    }

    /// Timestamp of the last successful save.
    pub fn last_save(&self) -> Option<SystemTime> {
        self.last_save
    }

    /// Records a completed save: clears the dirty counter by the value
    /// captured when the save began (writes landing mid-save stay
    /// counted) and stamps the success time.
    pub fn note_save_complete(&mut self, dirty_at_start: u64) {
        self.dirty = self.dirty.saturating_sub(dirty_at_start);
        self.last_save = Some(SystemTime::now());
    }

    /// Point-in-time snapshot of every database, handed to the
    /// background save thread. Dictionary chains are copy-on-write, so
    /// this copies bucket arrays (pointer copies and reference-count
    /// bumps), never entry data; the live keyspace unshares nodes
    /// lazily as later writes touch them.
    pub fn clone_databases(&self) -> Vec<Database> {
        self.databases.clone()
    }

    /// Toggles automatic dictionary resizing across the keyspace.
    /// Disabled while a background save is running: a rehash would walk
    /// every shared chain node and force it to be copied, defeating the
    /// point of the copy-on-write snapshot.
    pub fn set_resize_enabled(&mut self, enabled: bool) {
        for db in &mut self.databases {
            db.set_resize(enabled);
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("databases", &self.databases.len())
            .field("keys", &self.databases.iter().map(Database::len).sum::<usize>())
            .field("dirty", &self.dirty)
            .finish()
    }
}
