//! Shared scaffolding for the snapshot test suite.

use crate::db::{Store, StoreConfig};
use crate::snapshot::{SaveOptions, SnapshotWriter, save_databases};
use tracing::Level;
use tracing_subscriber::fmt::Subscriber;

pub fn init_tracing() {
    let _ = Subscriber::builder()
        .with_max_level(Level::TRACE)
        .try_init();
}

/// A small fixed-seed store for deterministic fixtures.
pub fn test_store() -> Store {
    Store::new(StoreConfig {
        databases: 4,
        lazyfree_threshold: 64,
        hash_seed: Some(0x5EED),
    })
}

pub fn test_config() -> StoreConfig {
    StoreConfig {
        databases: 4,
        lazyfree_threshold: 64,
        hash_seed: Some(0x5EED),
    }
}

/// Serializes the store into an in-memory snapshot image.
pub fn snapshot_bytes(store: &Store, options: &SaveOptions) -> Vec<u8> {
    let mut writer = SnapshotWriter::new(Vec::new(), options);
    save_databases(&mut writer, store.databases(), options).expect("in-memory save cannot fail");
    writer.into_inner()
}

/// Serializes one string through the writer primitives alone.
pub fn encode_string(s: &[u8], options: &SaveOptions) -> Vec<u8> {
    let mut writer = SnapshotWriter::new(Vec::new(), options);
    writer.write_string(s).unwrap();
    writer.into_inner()
}

/// Serializes one length field.
pub fn encode_len(len: u64) -> Vec<u8> {
    let mut writer = SnapshotWriter::new(Vec::new(), &SaveOptions::default());
    writer.write_len(len).unwrap();
    writer.into_inner()
}
