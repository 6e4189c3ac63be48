//! CRC-64 for the snapshot trailer.
//!
//! The trailer polynomial is fixed by the file contract; it is the
//! `CRC_64_REDIS` entry of the [`crc`] crate's catalog (Jones
//! polynomial, reflected, init 0, no final xor). The writer keeps a
//! streaming [`crc::Digest`] alive across writes; the loader checksums
//! the mapped body in one shot.

use crc::{CRC_64_REDIS, Crc};

/// The trailer checksum algorithm. A `static` so the writer's
/// streaming digest can borrow it for `'static`.
pub(crate) static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_REDIS);
