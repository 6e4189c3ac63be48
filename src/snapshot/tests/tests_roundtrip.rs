#[cfg(test)]
mod tests {
    use crate::db::Store;
    use crate::object::{Bytes, Value};
    use crate::snapshot::tests::helpers::{init_tracing, snapshot_bytes, test_config, test_store};
    use crate::snapshot::{
        AccessPersistence, FORMAT_VERSION, ReplicationInfo, SaveOptions, load,
    };

    fn mixed_store() -> Store {
        let mut store = test_store();
        store.set(0, b"plain", Value::Str(b"hello world".as_slice().into())).unwrap();
        store.set(0, b"number", Value::Int(-42)).unwrap();
        store
            .set(0, b"list", Value::List(vec![Bytes::from("a"), Bytes::from("b")]))
            .unwrap();
        store.set(1, b"other-db", Value::Int(7)).unwrap();
        store
            .set(2, b"scored", Value::SortedSet(vec![(Bytes::from("m"), 2.5)]))
            .unwrap();
        store.set_expire(0, b"plain", 4_000_000_000_000).unwrap();
        store
    }

    #[test]
    fn test_full_round_trip_preserves_every_tuple() {
        init_tracing();

        let store = mixed_store();
        let image = snapshot_bytes(&store, &SaveOptions::default());
        let mut loaded = load(&image, test_config()).unwrap().store;

        assert_eq!(
            loaded.get(0, b"plain").unwrap(),
            Some(&Value::Str(b"hello world".as_slice().into()))
        );
        assert_eq!(loaded.expire_of(0, b"plain").unwrap(), Some(4_000_000_000_000));
        assert_eq!(loaded.get(0, b"number").unwrap(), Some(&Value::Int(-42)));
        assert_eq!(
            loaded.get(0, b"list").unwrap(),
            Some(&Value::List(vec![Bytes::from("a"), Bytes::from("b")]))
        );
        assert_eq!(loaded.get(1, b"other-db").unwrap(), Some(&Value::Int(7)));
        assert_eq!(
            loaded.get(2, b"scored").unwrap(),
            Some(&Value::SortedSet(vec![(Bytes::from("m"), 2.5)]))
        );

        // Per-database counts survive exactly.
        for (db, expected) in [(0, 3), (1, 1), (2, 1), (3, 0)] {
            assert_eq!(loaded.db(db).unwrap().len(), expected, "db {db} count");
        }
        assert_eq!(loaded.db(0).unwrap().expires_len(), 1);
    }

    #[test]
    fn test_round_trip_of_a_large_database() {
        init_tracing();

        let mut store = test_store();
        for i in 0..5000u64 {
            store
                .set(0, format!("key:{i:05}").as_bytes(), Value::Int(i as i64))
                .unwrap();
            if i % 3 == 0 {
                store
                    .set_expire(0, format!("key:{i:05}").as_bytes(), 4_000_000_000_000 + i)
                    .unwrap();
            }
        }

        let image = snapshot_bytes(&store, &SaveOptions::default());
        let mut loaded = load(&image, test_config()).unwrap().store;

        assert_eq!(loaded.db(0).unwrap().len(), 5000);
        for i in (0..5000u64).step_by(97) {
            let key = format!("key:{i:05}");
            assert_eq!(
                loaded.get(0, key.as_bytes()).unwrap(),
                Some(&Value::Int(i as i64)),
                "value for {key}"
            );
            let expected_expire = (i % 3 == 0).then_some(4_000_000_000_000 + i);
            assert_eq!(loaded.expire_of(0, key.as_bytes()).unwrap(), expected_expire);
        }
    }

    #[test]
    fn test_idle_metadata_round_trip() {
        init_tracing();

        let mut store = test_store();
        store.set(0, b"cold", Value::Int(1)).unwrap();
        store.db_mut(0).unwrap().object_mut(b"cold").unwrap().idle = 9000;

        let options = SaveOptions {
            access: AccessPersistence::IdleTime,
            ..SaveOptions::default()
        };
        let image = snapshot_bytes(&store, &options);
        let loaded = load(&image, test_config()).unwrap().store;
        assert_eq!(loaded.db(0).unwrap().object(b"cold").unwrap().idle, 9000);
    }

    #[test]
    fn test_freq_metadata_round_trip() {
        init_tracing();

        let mut store = test_store();
        store.set(0, b"hot", Value::Int(1)).unwrap();
        store.db_mut(0).unwrap().object_mut(b"hot").unwrap().freq = 200;

        let options = SaveOptions {
            access: AccessPersistence::Frequency,
            ..SaveOptions::default()
        };
        let image = snapshot_bytes(&store, &options);
        let loaded = load(&image, test_config()).unwrap().store;
        assert_eq!(loaded.db(0).unwrap().object(b"hot").unwrap().freq, 200);
    }

    #[test]
    fn test_replication_identifiers_round_trip() {
        init_tracing();

        let repl = ReplicationInfo {
            id: "f".repeat(40),
            offset: 123_456_789,
            stream_db: Some(2),
        };
        let options = SaveOptions {
            replication: Some(repl.clone()),
            ..SaveOptions::default()
        };
        let store = mixed_store();
        let image = snapshot_bytes(&store, &options);
        let loaded = load(&image, test_config()).unwrap();
        assert_eq!(loaded.replication, Some(repl));
    }

    #[test]
    fn test_empty_store_round_trip() {
        init_tracing();

        let store = test_store();
        let image = snapshot_bytes(&store, &SaveOptions::default());
        let loaded = load(&image, test_config()).unwrap();
        assert_eq!(loaded.version, FORMAT_VERSION);
        assert!(loaded.replication.is_none());
        assert!(loaded.store.databases().iter().all(|db| db.is_empty()));
    }

    #[test]
    fn test_resize_hints_presize_the_target() {
        init_tracing();

        let mut store = test_store();
        for i in 0..2000u64 {
            store.set(0, format!("k{i}").as_bytes(), Value::Int(i as i64)).unwrap();
        }
        let image = snapshot_bytes(&store, &SaveOptions::default());
        let loaded = load(&image, test_config()).unwrap().store;

        // The resize hint must have pre-expanded past the entry count,
        // so loading never rehashed.
        assert!(loaded.db(0).unwrap().main_table_size() >= 2000);
    }

    #[test]
    fn test_compression_off_round_trips_identically() {
        init_tracing();

        let mut store = test_store();
        let long = b"the quick brown fox jumps over the lazy dog, repeatedly".repeat(20);
        store.set(0, b"long", Value::Str(long.clone().into())).unwrap();

        for compression in [true, false] {
            let options = SaveOptions {
                compression,
                ..SaveOptions::default()
            };
            let image = snapshot_bytes(&store, &options);
            let mut loaded = load(&image, test_config()).unwrap().store;
            assert_eq!(
                loaded.get(0, b"long").unwrap(),
                Some(&Value::Str(long.clone().into())),
                "compression={compression}"
            );
        }
    }
}
