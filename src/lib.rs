//! # CelerisDB
//!
//! An embeddable, **in-memory** key-value storage core: the hash-table
//! engine that holds every key and value, the snapshot serializer that
//! persists the whole keyspace to a single binary file, and the deferred
//! work subsystem that keeps slow destructors off the request-serving path.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                       Store                           │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐   │
//! │  │ Database 0  │  │ Database 1  │  │ Database N  │   │
//! │  │ dict+expires│  │ dict+expires│  │ dict+expires│   │
//! │  └──────┬──────┘  └─────────────┘  └─────────────┘   │
//! │         │ safe iteration                              │
//! │         ▼                                             │
//! │  ┌──────────────────────────┐   ┌──────────────────┐  │
//! │  │   Snapshot serializer    │   │ Background queues │  │
//! │  │  (save / load / fan-out) │──►│ close/sync/free   │  │
//! │  └──────────────────────────┘   └──────────────────┘  │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`dict`] | Chained hash table with incremental rehash, scan cursor, iterators, sampling |
//! | [`object`] | Compact byte strings and the heterogeneous value model |
//! | [`db`] | Numbered databases, expiry metadata, dirty tracking, lazy deletion |
//! | [`snapshot`] | Binary snapshot writer/loader, background save, socket fan-out |
//! | [`background`] | Per-kind FIFO worker queues for deferred work |
//! | [`mem`] | Counting allocator with a used-memory gauge and OOM hook |
//!
//! ## Key properties
//!
//! - **Non-blocking growth** — resizing the dictionary never stalls the
//!   request path; buckets migrate a bounded step at a time, piggybacked
//!   on ordinary lookups, inserts, and removals.
//! - **Self-describing snapshots** — length-prefixed, type-tagged entries
//!   with integer and LZF string encodings and a CRC-64 trailer; the
//!   loader verifies magic, version, and checksum before serving.
//! - **Strict FIFO deferred work** — one worker per job kind; completion
//!   order equals submission order, observable via `pending`/`wait_one`.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use celerisdb::db::{Store, StoreConfig};
//! use celerisdb::object::Value;
//! use celerisdb::snapshot::{self, SaveOptions};
//!
//! let mut store = Store::new(StoreConfig::default());
//! store.set(0, b"greeting", Value::Str(b"hello".as_slice().into())).unwrap();
//!
//! snapshot::save_to_file("dump.rdb", store.databases(), &SaveOptions::default()).unwrap();
//! let loaded = snapshot::load_from_file("dump.rdb", StoreConfig::default()).unwrap();
//! assert_eq!(loaded.store.database_count(), 16);
//! ```

pub mod background;
pub mod db;
pub mod dict;
pub mod mem;
pub mod object;
pub mod snapshot;

// The whole test suite runs under the counting allocator so the
// used-memory gauge is exercised by every allocation the tests make.
#[cfg(test)]
#[global_allocator]
static TEST_ALLOC: mem::CountingAlloc = mem::CountingAlloc;
