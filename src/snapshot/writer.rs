//! Snapshot encoding: the CRC-maintaining writer, the per-value-type
//! producers, and the socket fan-out sink.

use std::io::{self, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use tracing::{debug, trace};

use crate::db::Database;
use crate::object::{Bytes, PackedKind, Stream, Value, parse_decimal};
use crate::snapshot::{
    AccessPersistence, CRC64, ENC_INT8, ENC_INT16, ENC_INT32, ENC_LZF, FORMAT_VERSION,
    LEN_32BIT_MARKER, LEN_64BIT_MARKER, MAGIC, OP_AUX, OP_EOF, OP_EXPIRETIME_MS, OP_FREQ, OP_IDLE,
    OP_RESIZEDB, OP_SELECTDB, SaveOptions, SnapshotError, TYPE_HASH, TYPE_LIST,
    TYPE_LIST_QUICKLIST, TYPE_LIST_ZIPLIST, TYPE_SET, TYPE_SET_INTSET, TYPE_STREAM, TYPE_STRING,
    TYPE_ZSET_BINARY, TYPE_ZSET_ZIPLIST, TYPE_HASH_ZIPLIST, lzf,
};

// ------------------------------------------------------------------------------------------------
// Writer core
// ------------------------------------------------------------------------------------------------

/// A buffered sink that maintains the running CRC-64 and byte count of
/// everything written through it.
pub struct SnapshotWriter<W: Write> {
    out: W,
    digest: crc::Digest<'static, u64>,
    checksum: bool,
    compression: bool,
    bytes: u64,
}

impl<W: Write> SnapshotWriter<W> {
    pub fn new(out: W, options: &SaveOptions) -> Self {
        SnapshotWriter {
            out,
            digest: CRC64.digest(),
            checksum: options.checksum,
            compression: options.compression,
            bytes: 0,
        }
    }

    /// Total bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    /// The running checksum (zero when disabled).
    pub fn checksum_value(&self) -> u64 {
        if self.checksum {
            self.digest.clone().finalize()
        } else {
            0
        }
    }

    pub fn flush(&mut self) -> Result<(), SnapshotError> {
        self.out.flush()?;
        Ok(())
    }

    /// Unwraps the underlying sink.
    pub fn into_inner(self) -> W {
        self.out
    }

    // --------------------------------------------------------------------------------------------
    // Primitives
    // --------------------------------------------------------------------------------------------

    pub fn write_raw(&mut self, data: &[u8]) -> Result<(), SnapshotError> {
        self.out.write_all(data)?;
        if self.checksum {
            self.digest.update(data);
        }
        self.bytes += data.len() as u64;
        Ok(())
    }

    #[inline]
    pub fn write_u8(&mut self, byte: u8) -> Result<(), SnapshotError> {
        self.write_raw(&[byte])
    }

    /// Compact length encoding: 6-bit, 14-bit, or big-endian 32/64-bit.
    pub fn write_len(&mut self, len: u64) -> Result<(), SnapshotError> {
        if len < 64 {
            self.write_u8(len as u8)
        } else if len < 16384 {
            self.write_raw(&[0x40 | (len >> 8) as u8, (len & 0xff) as u8])
        } else if len <= u64::from(u32::MAX) {
            self.write_u8(LEN_32BIT_MARKER)?;
            self.write_raw(&(len as u32).to_be_bytes())
        } else {
            self.write_u8(LEN_64BIT_MARKER)?;
            self.write_raw(&len.to_be_bytes())
        }
    }

    /// Emits the integer special encoding when `v` fits 8, 16, or 32
    /// bits; reports whether it did.
    fn write_int_encoded(&mut self, v: i64) -> Result<bool, SnapshotError> {
        if (i64::from(i8::MIN)..=i64::from(i8::MAX)).contains(&v) {
            self.write_raw(&[0xC0 | ENC_INT8, v as i8 as u8])?;
            Ok(true)
        } else if (i64::from(i16::MIN)..=i64::from(i16::MAX)).contains(&v) {
            self.write_u8(0xC0 | ENC_INT16)?;
            self.write_raw(&(v as i16).to_le_bytes())?;
            Ok(true)
        } else if (i64::from(i32::MIN)..=i64::from(i32::MAX)).contains(&v) {
            self.write_u8(0xC0 | ENC_INT32)?;
            self.write_raw(&(v as i32).to_le_bytes())?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Integer value: special encoding when it fits 32 bits, decimal
    /// string otherwise.
    pub fn write_int_string(&mut self, v: i64) -> Result<(), SnapshotError> {
        if self.write_int_encoded(v)? {
            return Ok(());
        }
        let s = v.to_string();
        self.write_len(s.len() as u64)?;
        self.write_raw(s.as_bytes())
    }

    /// String encoding: integer form for short decimal strings, LZF for
    /// long compressible ones, raw length-prefixed bytes otherwise.
    pub fn write_string(&mut self, s: &[u8]) -> Result<(), SnapshotError> {
        if s.len() <= 11 {
            if let Some(v) = parse_decimal(s) {
                if self.write_int_encoded(v)? {
                    return Ok(());
                }
            }
        }
        if self.compression && s.len() > 20 {
            if let Some(compressed) = lzf::compress(s) {
                self.write_u8(0xC0 | ENC_LZF)?;
                self.write_len(compressed.len() as u64)?;
                self.write_len(s.len() as u64)?;
                return self.write_raw(&compressed);
            }
        }
        self.write_len(s.len() as u64)?;
        self.write_raw(s)
    }

    /// IEEE-754 binary64, little endian (the version ≥ 8 form).
    pub fn write_double_binary(&mut self, v: f64) -> Result<(), SnapshotError> {
        self.write_raw(&v.to_le_bytes())
    }

    /// Unix milliseconds, 8 bytes little endian.
    pub fn write_millis(&mut self, ms: u64) -> Result<(), SnapshotError> {
        self.write_raw(&ms.to_le_bytes())
    }
}

// ------------------------------------------------------------------------------------------------
// Value producers
// ------------------------------------------------------------------------------------------------

fn type_tag(value: &Value) -> u8 {
    match value {
        Value::Str(_) | Value::Int(_) | Value::Float(_) => TYPE_STRING,
        Value::List(_) => TYPE_LIST,
        Value::Set(_) => TYPE_SET,
        Value::Hash(_) => TYPE_HASH,
        Value::SortedSet(_) => TYPE_ZSET_BINARY,
        Value::PackedList(_) => TYPE_LIST_QUICKLIST,
        Value::Packed(PackedKind::List, _) => TYPE_LIST_ZIPLIST,
        Value::Packed(PackedKind::IntSet, _) => TYPE_SET_INTSET,
        Value::Packed(PackedKind::SortedSet, _) => TYPE_ZSET_ZIPLIST,
        Value::Packed(PackedKind::Hash, _) => TYPE_HASH_ZIPLIST,
        Value::Stream(_) => TYPE_STREAM,
    }
}

/// Formats a float value the way it is stored: canonical shortest
/// decimal, with the conventional spellings for the non-finite cases.
fn format_float(v: f64) -> String {
    if v.is_nan() {
        "nan".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "inf".to_string() } else { "-inf".to_string() }
    } else {
        format!("{v}")
    }
}

fn write_value_body<W: Write>(w: &mut SnapshotWriter<W>, value: &Value) -> Result<(), SnapshotError> {
    match value {
        Value::Str(s) => w.write_string(s),
        Value::Int(v) => w.write_int_string(*v),
        Value::Float(v) => w.write_string(format_float(*v).as_bytes()),

        Value::List(items) | Value::Set(items) => {
            w.write_len(items.len() as u64)?;
            for item in items {
                w.write_string(item)?;
            }
            Ok(())
        }

        Value::Hash(pairs) => {
            w.write_len(pairs.len() as u64)?;
            for (field, val) in pairs {
                w.write_string(field)?;
                w.write_string(val)?;
            }
            Ok(())
        }

        Value::SortedSet(members) => {
            w.write_len(members.len() as u64)?;
            for (member, score) in members {
                w.write_string(member)?;
                w.write_double_binary(*score)?;
            }
            Ok(())
        }

        Value::PackedList(nodes) => {
            w.write_len(nodes.len() as u64)?;
            for node in nodes {
                w.write_string(node)?;
            }
            Ok(())
        }

        Value::Packed(_, blob) => w.write_string(blob),

        Value::Stream(stream) => write_stream(w, stream),
    }
}

/// Stream body: the pack index, stream counters, then consumer groups
/// with their pending-entry lists.
fn write_stream<W: Write>(w: &mut SnapshotWriter<W>, stream: &Stream) -> Result<(), SnapshotError> {
    w.write_len(stream.entries.len() as u64)?;
    for (id, pack) in &stream.entries {
        w.write_string(&id.to_bytes())?;
        w.write_string(pack)?;
    }
    w.write_len(stream.length)?;
    w.write_len(stream.last_id.ms)?;
    w.write_len(stream.last_id.seq)?;

    w.write_len(stream.groups.len() as u64)?;
    for group in &stream.groups {
        w.write_string(&group.name)?;
        w.write_len(group.last_delivered.ms)?;
        w.write_len(group.last_delivered.seq)?;

        // Group-wide pending entries: raw id, delivery time, count.
        w.write_len(group.pending.len() as u64)?;
        for entry in &group.pending {
            w.write_raw(&entry.id.to_bytes())?;
            w.write_millis(entry.delivery_time)?;
            w.write_len(entry.delivery_count)?;
        }

        w.write_len(group.consumers.len() as u64)?;
        for consumer in &group.consumers {
            w.write_string(&consumer.name)?;
            w.write_millis(consumer.seen_time)?;
            // Consumer view: ids only, the group list holds the detail.
            w.write_len(consumer.pending.len() as u64)?;
            for id in &consumer.pending {
                w.write_raw(&id.to_bytes())?;
            }
        }
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Save pipeline
// ------------------------------------------------------------------------------------------------

fn write_aux<W: Write>(
    w: &mut SnapshotWriter<W>,
    name: &[u8],
    value: &[u8],
) -> Result<(), SnapshotError> {
    w.write_u8(OP_AUX)?;
    w.write_string(name)?;
    w.write_string(value)
}

fn write_entry<W: Write>(
    w: &mut SnapshotWriter<W>,
    key: &Bytes,
    value: &Value,
) -> Result<(), SnapshotError> {
    w.write_u8(type_tag(value))?;
    w.write_string(key)?;
    write_value_body(w, value)
}

/// Serializes every non-empty database through `w`: magic, auxiliary
/// section, per-database entries, EOF opcode, CRC-64 trailer.
///
/// Iteration borrows each database shared, which freezes its
/// dictionaries for the duration — the safe-iteration guarantee the
/// traversal relies on.
pub fn save_databases<W: Write>(
    w: &mut SnapshotWriter<W>,
    databases: &[Database],
    options: &SaveOptions,
) -> Result<(), SnapshotError> {
    w.write_raw(MAGIC)?;
    w.write_raw(format!("{FORMAT_VERSION:04}").as_bytes())?;

    let ctime = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    write_aux(w, b"redis-ver", env!("CARGO_PKG_VERSION").as_bytes())?;
    write_aux(w, b"redis-bits", usize::BITS.to_string().as_bytes())?;
    write_aux(w, b"ctime", ctime.to_string().as_bytes())?;
    write_aux(w, b"used-mem", crate::mem::used_memory().to_string().as_bytes())?;

    if let Some(repl) = &options.replication {
        if let Some(stream_db) = repl.stream_db {
            write_aux(w, b"repl-stream-db", stream_db.to_string().as_bytes())?;
        }
        write_aux(w, b"repl-id", repl.id.as_bytes())?;
        write_aux(w, b"repl-offset", repl.offset.to_string().as_bytes())?;
    }

    for db in databases {
        if db.is_empty() {
            continue;
        }
        w.write_u8(OP_SELECTDB)?;
        w.write_len(db.index() as u64)?;
        w.write_u8(OP_RESIZEDB)?;
        w.write_len(db.len() as u64)?;
        w.write_len(db.expires_len() as u64)?;

        for (key, object) in db.iter() {
            if let Some(at_ms) = db.expire_of_key(key) {
                w.write_u8(OP_EXPIRETIME_MS)?;
                w.write_millis(at_ms)?;
            }
            match options.access {
                AccessPersistence::None => {}
                AccessPersistence::IdleTime => {
                    w.write_u8(OP_IDLE)?;
                    w.write_len(object.idle)?;
                }
                AccessPersistence::Frequency => {
                    w.write_u8(OP_FREQ)?;
                    w.write_u8(object.freq)?;
                }
            }
            write_entry(w, key, &object.value)?;
        }
        trace!(db = db.index(), keys = db.len(), "database serialized");
    }

    w.write_u8(OP_EOF)?;
    let crc = w.checksum_value();
    w.write_raw(&crc.to_le_bytes())?;
    w.flush()?;
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Socket fan-out
// ------------------------------------------------------------------------------------------------

/// A sink duplicating every write to a set of receivers (replication
/// followers). A receiver that fails is dropped from the set with its
/// error recorded; the stream aborts only when no receiver remains.
pub struct FanoutSink<W: Write> {
    targets: Vec<(W, Option<io::Error>)>,
}

impl<W: Write> FanoutSink<W> {
    pub fn new(targets: Vec<W>) -> Self {
        FanoutSink {
            targets: targets.into_iter().map(|w| (w, None)).collect(),
        }
    }

    fn live_count(&self) -> usize {
        self.targets.iter().filter(|(_, e)| e.is_none()).count()
    }

    /// Per-receiver outcome, indexed by submission order.
    pub fn into_results(self) -> Vec<Result<W, io::Error>> {
        self.targets
            .into_iter()
            .map(|(w, e)| match e {
                None => Ok(w),
                Some(err) => Err(err),
            })
            .collect()
    }
}

impl<W: Write> Write for FanoutSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for (target, error) in &mut self.targets {
            if error.is_none() {
                if let Err(e) = target.write_all(buf) {
                    *error = Some(e);
                }
            }
        }
        if self.live_count() == 0 {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "every fan-out receiver failed",
            ));
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        for (target, error) in &mut self.targets {
            if error.is_none() {
                if let Err(e) = target.flush() {
                    *error = Some(e);
                }
            }
        }
        if self.live_count() == 0 {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "every fan-out receiver failed",
            ));
        }
        Ok(())
    }
}

/// Outcome of a fan-out save.
pub struct FanoutReport<W> {
    /// The 40-hex stream mark framing the payload.
    pub mark: String,
    /// Payload bytes (prologue and epilogue excluded).
    pub payload_bytes: u64,
    /// Per-receiver outcome, submission order.
    pub receivers: Vec<Result<W, io::Error>>,
}

const HEX: &[u8; 16] = b"0123456789abcdef";

fn random_mark() -> String {
    let mut rng = rand::rng();
    (0..40)
        .map(|_| char::from(HEX[rng.random_range(0..16)]))
        .collect()
}

/// Streams a snapshot to a set of receivers with `$EOF:<mark>\r\n` as
/// prologue and the bare mark as epilogue, so receivers detect the end
/// of the stream without parsing the payload. The payload between the
/// marks is a byte-exact snapshot file.
pub fn save_to_fanout<W: Write>(
    targets: Vec<W>,
    databases: &[Database],
    options: &SaveOptions,
) -> Result<FanoutReport<W>, SnapshotError> {
    let mark = random_mark();
    let mut sink = FanoutSink::new(targets);

    sink.write_all(b"$EOF:")?;
    sink.write_all(mark.as_bytes())?;
    sink.write_all(b"\r\n")?;

    let mut writer = SnapshotWriter::new(sink, options);
    save_databases(&mut writer, databases, options)?;
    let payload_bytes = writer.bytes_written();

    let mut sink = writer.into_inner();
    sink.write_all(mark.as_bytes())?;
    sink.flush()?;

    let receivers = sink.into_results();
    debug!(
        payload_bytes,
        delivered = receivers.iter().filter(|r| r.is_ok()).count(),
        "fan-out snapshot complete"
    );
    Ok(FanoutReport {
        mark,
        payload_bytes,
        receivers,
    })
}
