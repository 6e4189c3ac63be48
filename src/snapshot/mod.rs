//! # Snapshot Serializer
//!
//! Persists the entire multi-database keyspace to one self-contained
//! binary file and reloads it into a fresh process with identical
//! semantics.
//!
//! ## File layout
//!
//! ```text
//! "REDIS0009"                                  magic + 4-digit version
//! [AUX name value]...                          server metadata
//! per non-empty database:
//!   SELECT-DB  <index>
//!   RESIZE-DB  <main size> <expires size>      pre-sizing hints
//!   per entry:
//!     [EXPIRETIME-MS <8 LE>] [IDLE <len>] [FREQ <byte>]
//!     <type tag> <key string> <value body>
//! EOF
//! <crc64, 8 LE>                                zero when disabled
//! ```
//!
//! ## Length encoding
//!
//! The top two bits of the first byte select the format: `00` a 6-bit
//! length, `01` a 14-bit length, `10` a 4- or 8-byte big-endian length
//! (discriminated by the low bits), `11` a special encoding — 8/16/32
//! bit little-endian integers or an LZF-compressed string.
//!
//! ## Strings
//!
//! A string that is the strict decimal form of an integer fitting 32
//! bits is stored as that integer (2, 3, or 5 bytes). Longer strings
//! are LZF-compressed when compression is enabled and it helps.
//! Everything else is a raw length-prefixed byte run; all strings are
//! binary-safe.
//!
//! ## Failure semantics
//!
//! Saving reports I/O errors as ordinary `Result`s and leaves the
//! partially written temp file on disk for later cleanup. Loading is
//! strict: a short read, a bad length, an unknown opcode or value type,
//! a version beyond the supported range, or a checksum mismatch aborts
//! the load with an error the embedding server must treat as fatal —
//! the keyspace is presumed partial and must not be served.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Submodules
// ------------------------------------------------------------------------------------------------

mod background;
mod crc64;
mod lzf;
mod reader;
mod writer;

pub use background::{BackgroundSave, spawn_background_save};
pub use reader::{LoadResult, load};
pub use writer::{FanoutReport, FanoutSink, SnapshotWriter, save_databases, save_to_fanout};

pub(crate) use crc64::CRC64;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::db::{Database, StoreConfig};

// ------------------------------------------------------------------------------------------------
// Format constants
// ------------------------------------------------------------------------------------------------

/// File magic; followed by four ASCII digits of the format version.
pub const MAGIC: &[u8; 5] = b"REDIS";

/// Version written by this build.
pub const FORMAT_VERSION: u32 = 9;

/// Oldest version the loader accepts.
pub const MIN_VERSION: u32 = 1;

/// First version carrying the CRC-64 trailer.
pub(crate) const MIN_CRC_VERSION: u32 = 5;

// Opcodes (metadata bytes ≥ 247; value type tags are ≤ 15).
pub(crate) const OP_MODULE_AUX: u8 = 247;
pub(crate) const OP_IDLE: u8 = 248;
pub(crate) const OP_FREQ: u8 = 249;
pub(crate) const OP_AUX: u8 = 250;
pub(crate) const OP_RESIZEDB: u8 = 251;
pub(crate) const OP_EXPIRETIME_MS: u8 = 252;
pub(crate) const OP_EXPIRETIME_SEC: u8 = 253;
pub(crate) const OP_SELECTDB: u8 = 254;
pub(crate) const OP_EOF: u8 = 255;

// Value type tags.
pub(crate) const TYPE_STRING: u8 = 0;
pub(crate) const TYPE_LIST: u8 = 1;
pub(crate) const TYPE_SET: u8 = 2;
pub(crate) const TYPE_ZSET: u8 = 3;
pub(crate) const TYPE_HASH: u8 = 4;
pub(crate) const TYPE_ZSET_BINARY: u8 = 5;
pub(crate) const TYPE_MODULE: u8 = 6;
pub(crate) const TYPE_MODULE_2: u8 = 7;
pub(crate) const TYPE_LIST_ZIPLIST: u8 = 10;
pub(crate) const TYPE_SET_INTSET: u8 = 11;
pub(crate) const TYPE_ZSET_ZIPLIST: u8 = 12;
pub(crate) const TYPE_HASH_ZIPLIST: u8 = 13;
pub(crate) const TYPE_LIST_QUICKLIST: u8 = 14;
pub(crate) const TYPE_STREAM: u8 = 15;

// Length-encoding markers.
pub(crate) const LEN_32BIT_MARKER: u8 = 0x80;
pub(crate) const LEN_64BIT_MARKER: u8 = 0x81;
pub(crate) const ENC_INT8: u8 = 0;
pub(crate) const ENC_INT16: u8 = 1;
pub(crate) const ENC_INT32: u8 = 2;
pub(crate) const ENC_LZF: u8 = 3;

// Legacy (ASCII) double sentinels.
pub(crate) const DOUBLE_NAN: u8 = 253;
pub(crate) const DOUBLE_POS_INF: u8 = 254;
pub(crate) const DOUBLE_NEG_INF: u8 = 255;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors produced while saving or loading a snapshot.
///
/// Save-side errors are recoverable from the server's point of view.
/// Load-side errors are fatal for the load: the partially reconstructed
/// keyspace is discarded with the error.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SnapshotError {
    /// Underlying I/O error (including short writes).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The input ended before a field could be read.
    #[error("snapshot truncated at offset {offset} (need {needed} more bytes)")]
    Truncated { offset: usize, needed: usize },

    /// The file does not start with the snapshot magic.
    #[error("bad magic bytes (not a snapshot file)")]
    BadMagic,

    /// The version digits are out of the supported range.
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),

    /// The trailing CRC-64 does not match the file contents.
    #[error("checksum mismatch (stored {stored:#018x}, computed {computed:#018x})")]
    ChecksumMismatch { stored: u64, computed: u64 },

    /// A byte in opcode position is neither an opcode nor a value type.
    #[error("unknown opcode {opcode:#04x} at offset {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },

    /// A value type tag this build cannot reconstruct.
    #[error("unknown value type {tag} at offset {offset}")]
    UnknownValueType { tag: u8, offset: usize },

    /// An extension-module value; this build registers no extensions.
    #[error("unsupported extension value (module id {id:#x})")]
    UnsupportedExtension { id: u64 },

    /// Structurally invalid content (bad lengths, bad back references,
    /// inconsistent stream state, out-of-range database index).
    #[error("corrupt snapshot: {0}")]
    Corrupt(String),
}

// ------------------------------------------------------------------------------------------------
// Save options
// ------------------------------------------------------------------------------------------------

/// Which per-entry access metadata the writer emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessPersistence {
    /// No access metadata.
    #[default]
    None,
    /// Seconds-since-access (`IDLE` opcode), for LRU-style eviction.
    IdleTime,
    /// Logarithmic counter (`FREQ` opcode), for LFU-style eviction.
    Frequency,
}

/// Replication identifiers carried in the auxiliary section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationInfo {
    /// 40-character replication id.
    pub id: String,
    /// Master replication offset.
    pub offset: u64,
    /// Database the replication stream selects, when meaningful.
    pub stream_db: Option<u64>,
}

/// Serializer configuration.
#[derive(Debug, Clone)]
pub struct SaveOptions {
    /// Maintain and write the CRC-64 trailer (zero written when off).
    pub checksum: bool,
    /// Attempt LZF compression for strings longer than 20 bytes.
    pub compression: bool,
    /// Access metadata persisted per entry.
    pub access: AccessPersistence,
    /// Replication identifiers to embed, if any.
    pub replication: Option<ReplicationInfo>,
}

impl Default for SaveOptions {
    fn default() -> Self {
        SaveOptions {
            checksum: true,
            compression: true,
            access: AccessPersistence::None,
            replication: None,
        }
    }
}

/// Outcome of a completed save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveReport {
    /// Total bytes written, trailer included.
    pub bytes_written: u64,
}

// ------------------------------------------------------------------------------------------------
// File-level save
// ------------------------------------------------------------------------------------------------

/// This process's temp-file path inside `dir`.
pub fn temp_snapshot_path(dir: &Path) -> PathBuf {
    dir.join(format!("temp-{}.rdb", std::process::id()))
}

/// Saves every database into `path`, writing a temp file first and
/// renaming it into place on success. On error the temp file is left on
/// disk; [`remove_temp_file`] or [`clean_stale_temp_files`] reclaim it.
pub fn save_to_file(
    path: impl AsRef<Path>,
    databases: &[Database],
    options: &SaveOptions,
) -> Result<SaveReport, SnapshotError> {
    let dest = path.as_ref();
    let temp = temp_snapshot_path(dest.parent().unwrap_or_else(|| Path::new(".")));
    write_snapshot_file(&temp, dest, databases, options)
}

/// Writes `temp`, fsyncs it, and atomically renames it onto `dest`.
pub(crate) fn write_snapshot_file(
    temp: &Path,
    dest: &Path,
    databases: &[Database],
    options: &SaveOptions,
) -> Result<SaveReport, SnapshotError> {
    let file = File::create(temp)?;
    let mut writer = SnapshotWriter::new(BufWriter::new(file), options);
    save_databases(&mut writer, databases, options)?;
    let bytes_written = writer.bytes_written();

    let file = writer
        .into_inner()
        .into_inner()
        .map_err(|e| SnapshotError::Io(e.into_error()))?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(temp, dest)?;
    info!(
        path = %dest.display(),
        bytes = bytes_written,
        "snapshot saved"
    );
    Ok(SaveReport { bytes_written })
}

/// Removes this process's temp file from `dir`, if present.
pub fn remove_temp_file(dir: impl AsRef<Path>) {
    let path = temp_snapshot_path(dir.as_ref());
    match std::fs::remove_file(&path) {
        Ok(()) => debug!(path = %path.display(), "temp snapshot removed"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "temp snapshot removal failed"),
    }
}

/// Removes every `temp-*.rdb` left behind by interrupted saves of any
/// process. Returns how many files were deleted.
pub fn clean_stale_temp_files(dir: impl AsRef<Path>) -> io::Result<usize> {
    let mut removed = 0;
    for entry in std::fs::read_dir(dir.as_ref())? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with("temp-") && name.ends_with(".rdb") && entry.path().is_file() {
            std::fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    if removed > 0 {
        info!(dir = %dir.as_ref().display(), removed, "stale temp snapshots cleaned");
    }
    Ok(removed)
}

// ------------------------------------------------------------------------------------------------
// File-level load
// ------------------------------------------------------------------------------------------------

/// Maps `path` read-only and loads it into a fresh keyspace.
pub fn load_from_file(
    path: impl AsRef<Path>,
    config: StoreConfig,
) -> Result<LoadResult, SnapshotError> {
    let file = File::open(path.as_ref())?;
    if file.metadata()?.len() == 0 {
        return Err(SnapshotError::BadMagic);
    }
    // SAFETY: the mapping is read-only and dropped before this function
    // returns; concurrent truncation of a snapshot being loaded is
    // outside the supported operating model (saves write a temp file
    // and rename).
    let mapped = unsafe { Mmap::map(&file)? };
    load(&mapped, config)
}
