//! Snapshot decoding: a bounds-checked cursor over the mapped file and
//! the opcode loop that reconstructs the keyspace.

use tracing::{debug, info};

use crate::db::{Store, StoreConfig};
use crate::object::{
    Bytes, Object, PackedKind, PendingEntry, Stream, StreamConsumer, StreamGroup, StreamId, Value,
};
use crate::object::FREQ_INITIAL;
use crate::snapshot::{
    CRC64, DOUBLE_NAN, DOUBLE_NEG_INF, DOUBLE_POS_INF, ENC_INT8, ENC_INT16, ENC_INT32, ENC_LZF,
    FORMAT_VERSION, LEN_32BIT_MARKER, LEN_64BIT_MARKER, MAGIC, MIN_CRC_VERSION, MIN_VERSION,
    OP_AUX, OP_EOF, OP_EXPIRETIME_MS, OP_EXPIRETIME_SEC, OP_FREQ, OP_IDLE, OP_MODULE_AUX,
    OP_RESIZEDB, OP_SELECTDB, ReplicationInfo, SnapshotError, TYPE_HASH, TYPE_HASH_ZIPLIST,
    TYPE_LIST, TYPE_LIST_QUICKLIST, TYPE_LIST_ZIPLIST, TYPE_MODULE, TYPE_MODULE_2, TYPE_SET,
    TYPE_SET_INTSET, TYPE_STREAM, TYPE_STRING, TYPE_ZSET, TYPE_ZSET_BINARY, TYPE_ZSET_ZIPLIST,
    lzf,
};

// ------------------------------------------------------------------------------------------------
// Load result
// ------------------------------------------------------------------------------------------------

/// A successfully reconstructed keyspace plus the metadata the loader
/// recognized along the way.
pub struct LoadResult {
    pub store: Store,
    /// File format version the snapshot was written with.
    pub version: u32,
    /// Replication identifiers, when the snapshot carried them.
    pub replication: Option<ReplicationInfo>,
    /// Script bodies from `lua` auxiliary records, for the caller's
    /// script cache.
    pub scripts: Vec<Bytes>,
}

// ------------------------------------------------------------------------------------------------
// Cursor
// ------------------------------------------------------------------------------------------------

/// A decoded string: either raw bytes or the integer special encoding.
enum LoadedStr {
    Int(i64),
    Raw(Vec<u8>),
}

impl LoadedStr {
    fn into_bytes(self) -> Vec<u8> {
        match self {
            LoadedStr::Int(v) => v.to_string().into_bytes(),
            LoadedStr::Raw(b) => b,
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn offset(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SnapshotError> {
        let end = self.pos.checked_add(n).ok_or(SnapshotError::Truncated {
            offset: self.pos,
            needed: n,
        })?;
        if end > self.buf.len() {
            return Err(SnapshotError::Truncated {
                offset: self.pos,
                needed: end - self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, SnapshotError> {
        Ok(self.take(1)?[0])
    }

    /// 8-byte little-endian Unix milliseconds.
    fn read_millis(&mut self) -> Result<u64, SnapshotError> {
        let raw = self.take(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(raw);
        Ok(u64::from_le_bytes(bytes))
    }

    /// 4-byte little-endian Unix seconds (the legacy expire form).
    fn read_seconds(&mut self) -> Result<u64, SnapshotError> {
        let raw = self.take(4)?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(raw);
        Ok(u64::from(u32::from_le_bytes(bytes)))
    }

    fn read_binary_double(&mut self) -> Result<f64, SnapshotError> {
        let raw = self.take(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(raw);
        Ok(f64::from_le_bytes(bytes))
    }

    /// Legacy ASCII double: one prefix byte with non-finite sentinels,
    /// otherwise the length of the decimal text.
    fn read_legacy_double(&mut self) -> Result<f64, SnapshotError> {
        match self.read_u8()? {
            DOUBLE_NAN => Ok(f64::NAN),
            DOUBLE_POS_INF => Ok(f64::INFINITY),
            DOUBLE_NEG_INF => Ok(f64::NEG_INFINITY),
            len => {
                let raw = self.take(usize::from(len))?;
                std::str::from_utf8(raw)
                    .ok()
                    .and_then(|s| s.parse::<f64>().ok())
                    .ok_or_else(|| SnapshotError::Corrupt("unparsable legacy double".into()))
            }
        }
    }

    /// Length field; `Err` side of the pair carries the special
    /// encoding discriminator.
    fn read_len_or_encoding(&mut self) -> Result<Result<u64, u8>, SnapshotError> {
        let first = self.read_u8()?;
        match first >> 6 {
            0b00 => Ok(Ok(u64::from(first & 0x3f))),
            0b01 => {
                let second = self.read_u8()?;
                Ok(Ok((u64::from(first & 0x3f) << 8) | u64::from(second)))
            }
            0b10 => match first {
                LEN_32BIT_MARKER => {
                    let raw = self.take(4)?;
                    let mut bytes = [0u8; 4];
                    bytes.copy_from_slice(raw);
                    Ok(Ok(u64::from(u32::from_be_bytes(bytes))))
                }
                LEN_64BIT_MARKER => {
                    let raw = self.take(8)?;
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(raw);
                    Ok(Ok(u64::from_be_bytes(bytes)))
                }
                _ => Err(SnapshotError::Corrupt(format!(
                    "bad length marker {first:#04x} at offset {}",
                    self.pos - 1
                ))),
            },
            _ => Ok(Err(first & 0x3f)),
        }
    }

    /// A length where a special encoding is not allowed.
    fn read_len(&mut self) -> Result<u64, SnapshotError> {
        match self.read_len_or_encoding()? {
            Ok(len) => Ok(len),
            Err(_) => Err(SnapshotError::Corrupt(format!(
                "special encoding where a plain length was required (offset {})",
                self.pos
            ))),
        }
    }

    fn read_len_usize(&mut self) -> Result<usize, SnapshotError> {
        let len = self.read_len()?;
        usize::try_from(len)
            .map_err(|_| SnapshotError::Corrupt(format!("length {len} overflows this platform")))
    }

    fn read_string(&mut self) -> Result<LoadedStr, SnapshotError> {
        match self.read_len_or_encoding()? {
            Ok(len) => {
                let len = usize::try_from(len).map_err(|_| {
                    SnapshotError::Corrupt(format!("string length {len} overflows this platform"))
                })?;
                Ok(LoadedStr::Raw(self.take(len)?.to_vec()))
            }
            Err(ENC_INT8) => {
                let raw = self.take(1)?;
                Ok(LoadedStr::Int(i64::from(raw[0] as i8)))
            }
            Err(ENC_INT16) => {
                let raw = self.take(2)?;
                Ok(LoadedStr::Int(i64::from(i16::from_le_bytes([
                    raw[0], raw[1],
                ]))))
            }
            Err(ENC_INT32) => {
                let raw = self.take(4)?;
                Ok(LoadedStr::Int(i64::from(i32::from_le_bytes([
                    raw[0], raw[1], raw[2], raw[3],
                ]))))
            }
            Err(ENC_LZF) => {
                let compressed_len = self.read_len_usize()?;
                let original_len = self.read_len_usize()?;
                let compressed = self.take(compressed_len)?;
                lzf::decompress(compressed, original_len)
                    .map(LoadedStr::Raw)
                    .map_err(|e| SnapshotError::Corrupt(format!("lzf: {e}")))
            }
            Err(other) => Err(SnapshotError::Corrupt(format!(
                "unknown string encoding {other} at offset {}",
                self.pos
            ))),
        }
    }

    fn read_string_raw(&mut self) -> Result<Vec<u8>, SnapshotError> {
        Ok(self.read_string()?.into_bytes())
    }

    fn read_stream_id(&mut self) -> Result<StreamId, SnapshotError> {
        let raw = self.take(16)?;
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(raw);
        Ok(StreamId::from_bytes(&bytes))
    }
}

// ------------------------------------------------------------------------------------------------
// Value loaders
// ------------------------------------------------------------------------------------------------

fn load_value(r: &mut Reader<'_>, tag: u8) -> Result<Value, SnapshotError> {
    match tag {
        TYPE_STRING => Ok(match r.read_string()? {
            LoadedStr::Int(v) => Value::Int(v),
            LoadedStr::Raw(b) => Value::from_string_bytes(b),
        }),

        TYPE_LIST | TYPE_SET => {
            let count = r.read_len_usize()?;
            let mut items = Vec::with_capacity(count.min(1 << 20));
            for _ in 0..count {
                items.push(Bytes::from(r.read_string_raw()?));
            }
            Ok(if tag == TYPE_LIST {
                Value::List(items)
            } else {
                Value::Set(items)
            })
        }

        TYPE_HASH => {
            let count = r.read_len_usize()?;
            let mut pairs = Vec::with_capacity(count.min(1 << 20));
            for _ in 0..count {
                let field = Bytes::from(r.read_string_raw()?);
                let value = Bytes::from(r.read_string_raw()?);
                pairs.push((field, value));
            }
            Ok(Value::Hash(pairs))
        }

        TYPE_ZSET | TYPE_ZSET_BINARY => {
            let count = r.read_len_usize()?;
            let mut members = Vec::with_capacity(count.min(1 << 20));
            for _ in 0..count {
                let member = Bytes::from(r.read_string_raw()?);
                let score = if tag == TYPE_ZSET_BINARY {
                    r.read_binary_double()?
                } else {
                    r.read_legacy_double()?
                };
                members.push((member, score));
            }
            Ok(Value::SortedSet(members))
        }

        TYPE_LIST_ZIPLIST => Ok(Value::Packed(
            PackedKind::List,
            r.read_string_raw()?.into_boxed_slice(),
        )),
        TYPE_SET_INTSET => Ok(Value::Packed(
            PackedKind::IntSet,
            r.read_string_raw()?.into_boxed_slice(),
        )),
        TYPE_ZSET_ZIPLIST => Ok(Value::Packed(
            PackedKind::SortedSet,
            r.read_string_raw()?.into_boxed_slice(),
        )),
        TYPE_HASH_ZIPLIST => Ok(Value::Packed(
            PackedKind::Hash,
            r.read_string_raw()?.into_boxed_slice(),
        )),

        TYPE_LIST_QUICKLIST => {
            let count = r.read_len_usize()?;
            let mut nodes = Vec::with_capacity(count.min(1 << 20));
            for _ in 0..count {
                nodes.push(r.read_string_raw()?.into_boxed_slice());
            }
            Ok(Value::PackedList(nodes))
        }

        TYPE_STREAM => load_stream(r),

        TYPE_MODULE | TYPE_MODULE_2 => {
            let id = r.read_len()?;
            Err(SnapshotError::UnsupportedExtension { id })
        }

        other => Err(SnapshotError::UnknownValueType {
            tag: other,
            offset: r.offset(),
        }),
    }
}

fn load_stream(r: &mut Reader<'_>) -> Result<Value, SnapshotError> {
    let pack_count = r.read_len_usize()?;
    let mut entries = Vec::with_capacity(pack_count.min(1 << 20));
    for _ in 0..pack_count {
        let key = r.read_string_raw()?;
        let key: [u8; 16] = key.as_slice().try_into().map_err(|_| {
            SnapshotError::Corrupt(format!("stream pack key of {} bytes (want 16)", key.len()))
        })?;
        let pack = r.read_string_raw()?.into_boxed_slice();
        entries.push((StreamId::from_bytes(&key), pack));
    }

    let length = r.read_len()?;
    let last_id = StreamId {
        ms: r.read_len()?,
        seq: r.read_len()?,
    };

    let group_count = r.read_len_usize()?;
    let mut groups = Vec::with_capacity(group_count.min(1 << 16));
    for _ in 0..group_count {
        let name = Bytes::from(r.read_string_raw()?);
        let last_delivered = StreamId {
            ms: r.read_len()?,
            seq: r.read_len()?,
        };

        let pel_count = r.read_len_usize()?;
        let mut pending = Vec::with_capacity(pel_count.min(1 << 20));
        for _ in 0..pel_count {
            pending.push(PendingEntry {
                id: r.read_stream_id()?,
                delivery_time: r.read_millis()?,
                delivery_count: r.read_len()?,
            });
        }

        let consumer_count = r.read_len_usize()?;
        let mut consumers = Vec::with_capacity(consumer_count.min(1 << 16));
        for _ in 0..consumer_count {
            let consumer_name = Bytes::from(r.read_string_raw()?);
            let seen_time = r.read_millis()?;
            let consumer_pel = r.read_len_usize()?;
            let mut ids = Vec::with_capacity(consumer_pel.min(1 << 20));
            for _ in 0..consumer_pel {
                let id = r.read_stream_id()?;
                // Every consumer-held id must exist in the group list.
                if !pending.iter().any(|p| p.id == id) {
                    return Err(SnapshotError::Corrupt(
                        "consumer pending id missing from group pending list".into(),
                    ));
                }
                ids.push(id);
            }
            consumers.push(StreamConsumer {
                name: consumer_name,
                seen_time,
                pending: ids,
            });
        }

        groups.push(StreamGroup {
            name,
            last_delivered,
            pending,
            consumers,
        });
    }

    Ok(Value::Stream(Stream {
        entries,
        length,
        last_id,
        groups,
    }))
}

// ------------------------------------------------------------------------------------------------
// Load pipeline
// ------------------------------------------------------------------------------------------------

/// Per-entry scratch state accumulated from metadata opcodes.
#[derive(Default)]
struct EntryScratch {
    expire_at_ms: Option<u64>,
    idle: Option<u64>,
    freq: Option<u8>,
}

/// Reconstructs a keyspace from snapshot bytes.
///
/// Every integrity failure aborts the load with an error; the partial
/// keyspace is discarded. See the module docs for the failure taxonomy.
pub fn load(bytes: &[u8], config: StoreConfig) -> Result<LoadResult, SnapshotError> {
    let mut r = Reader::new(bytes);

    let header = r.take(9).map_err(|_| SnapshotError::BadMagic)?;
    if &header[..5] != MAGIC {
        return Err(SnapshotError::BadMagic);
    }
    let version: u32 = std::str::from_utf8(&header[5..])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(SnapshotError::BadMagic)?;
    if !(MIN_VERSION..=FORMAT_VERSION).contains(&version) {
        return Err(SnapshotError::UnsupportedVersion(version));
    }

    let mut store = Store::new(config);
    let mut current_db = 0usize;
    let mut scratch = EntryScratch::default();
    let mut scripts = Vec::new();
    let mut repl_id: Option<String> = None;
    let mut repl_offset: Option<u64> = None;
    let mut repl_stream_db: Option<u64> = None;

    loop {
        let opcode = r.read_u8()?;
        match opcode {
            OP_EXPIRETIME_MS => scratch.expire_at_ms = Some(r.read_millis()?),
            OP_EXPIRETIME_SEC => {
                scratch.expire_at_ms = Some(r.read_seconds()?.saturating_mul(1000));
            }
            OP_IDLE => scratch.idle = Some(r.read_len()?),
            OP_FREQ => scratch.freq = Some(r.read_u8()?),

            OP_SELECTDB => {
                let index = r.read_len_usize()?;
                if index >= store.database_count() {
                    return Err(SnapshotError::Corrupt(format!(
                        "database index {index} out of range (keyspace has {})",
                        store.database_count()
                    )));
                }
                current_db = index;
            }

            OP_RESIZEDB => {
                let main = r.read_len_usize()?;
                let expires = r.read_len_usize()?;
                let db = store
                    .db_mut(current_db)
                    .map_err(|e| SnapshotError::Corrupt(e.to_string()))?;
                db.reserve(main, expires);
            }

            OP_AUX => {
                let name = r.read_string_raw()?;
                let value = r.read_string_raw()?;
                match name.as_slice() {
                    b"repl-id" => {
                        repl_id = Some(String::from_utf8(value).map_err(|_| {
                            SnapshotError::Corrupt("replication id is not text".into())
                        })?);
                    }
                    b"repl-offset" => {
                        repl_offset = std::str::from_utf8(&value)
                            .ok()
                            .and_then(|s| s.parse().ok());
                    }
                    b"repl-stream-db" => {
                        repl_stream_db = std::str::from_utf8(&value)
                            .ok()
                            .and_then(|s| s.parse().ok());
                    }
                    b"lua" => scripts.push(Bytes::from(value)),
                    other => {
                        debug!(
                            name = %String::from_utf8_lossy(other),
                            "skipping unrecognized auxiliary field"
                        );
                    }
                }
            }

            OP_MODULE_AUX => {
                return Err(SnapshotError::Corrupt(
                    "module auxiliary records are not supported".into(),
                ));
            }

            OP_EOF => break,

            tag if tag <= TYPE_STREAM => {
                let key = Bytes::from(r.read_string_raw()?);
                let value = load_value(&mut r, tag)?;
                let object = Object {
                    value,
                    idle: scratch.idle.take().unwrap_or(0),
                    freq: scratch.freq.take().unwrap_or(FREQ_INITIAL),
                };
                let expire = scratch.expire_at_ms.take();
                let db = store
                    .db_mut(current_db)
                    .map_err(|e| SnapshotError::Corrupt(e.to_string()))?;
                db.install(key, object, expire);
            }

            other => {
                return Err(SnapshotError::UnknownOpcode {
                    opcode: other,
                    offset: r.offset() - 1,
                });
            }
        }
    }

    // Trailer: CRC-64 of every byte before it, zero when disabled.
    if version >= MIN_CRC_VERSION {
        let body_len = r.offset();
        let raw = r.take(8)?;
        let mut stored_bytes = [0u8; 8];
        stored_bytes.copy_from_slice(raw);
        let stored = u64::from_le_bytes(stored_bytes);
        if stored != 0 {
            let computed = CRC64.checksum(&bytes[..body_len]);
            if computed != stored {
                return Err(SnapshotError::ChecksumMismatch { stored, computed });
            }
        }
    }
    if r.offset() != bytes.len() {
        return Err(SnapshotError::Corrupt(format!(
            "{} trailing bytes after end of snapshot",
            bytes.len() - r.offset()
        )));
    }

    let replication = match (repl_id, repl_offset) {
        (None, None) => None,
        (id, offset) => Some(ReplicationInfo {
            id: id.unwrap_or_default(),
            offset: offset.unwrap_or(0),
            stream_db: repl_stream_db,
        }),
    };

    info!(
        version,
        databases = store.databases().iter().filter(|d| !d.is_empty()).count(),
        keys = store.databases().iter().map(|d| d.len()).sum::<usize>(),
        "snapshot loaded"
    );
    Ok(LoadResult {
        store,
        version,
        replication,
        scripts,
    })
}

// ------------------------------------------------------------------------------------------------
// Primitive decode tests (cursor-level; the full pipeline is covered in
// the tests/ tree)
// ------------------------------------------------------------------------------------------------
