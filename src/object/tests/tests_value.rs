#[cfg(test)]
mod tests {
    use crate::object::{Bytes, Object, PackedKind, StreamId, Value};
    use crate::object::{PendingEntry, Stream, StreamGroup};

    #[test]
    fn test_from_string_bytes_canonicalizes_integers() {
        assert_eq!(Value::from_string_bytes(b"12345".to_vec()), Value::Int(12345));
        assert_eq!(Value::from_string_bytes(b"-7".to_vec()), Value::Int(-7));
    }

    #[test]
    fn test_from_string_bytes_keeps_non_integers() {
        assert_eq!(
            Value::from_string_bytes(b"007".to_vec()),
            Value::Str(Bytes::from_slice(b"007"))
        );
        assert_eq!(
            Value::from_string_bytes(b"hello".to_vec()),
            Value::Str(Bytes::from_slice(b"hello"))
        );
    }

    #[test]
    fn test_free_effort_scalars_are_cheap() {
        assert_eq!(Value::Str(Bytes::from_slice(b"x")).free_effort(), 1);
        assert_eq!(Value::Int(1).free_effort(), 1);
        assert_eq!(Value::Packed(PackedKind::IntSet, Box::from(&[1u8, 2][..])).free_effort(), 1);
    }

    #[test]
    fn test_free_effort_tracks_element_count() {
        let list = Value::List((0..100).map(|i| Bytes::from(format!("{i}").as_str())).collect());
        assert_eq!(list.free_effort(), 100);

        let hash = Value::Hash(vec![
            (Bytes::from_slice(b"a"), Bytes::from_slice(b"1")),
            (Bytes::from_slice(b"b"), Bytes::from_slice(b"2")),
        ]);
        assert_eq!(hash.free_effort(), 2);
    }

    #[test]
    fn test_free_effort_stream_counts_packs_and_pending() {
        let stream = Stream {
            entries: vec![
                (StreamId { ms: 1, seq: 0 }, Box::from(&b"pack0"[..])),
                (StreamId { ms: 2, seq: 0 }, Box::from(&b"pack1"[..])),
            ],
            length: 8,
            last_id: StreamId { ms: 2, seq: 3 },
            groups: vec![StreamGroup {
                name: Bytes::from_slice(b"g"),
                last_delivered: StreamId { ms: 2, seq: 0 },
                pending: vec![PendingEntry {
                    id: StreamId { ms: 1, seq: 0 },
                    delivery_time: 1000,
                    delivery_count: 1,
                }],
                consumers: vec![],
            }],
        };
        assert_eq!(Value::Stream(stream).free_effort(), 3);
    }

    #[test]
    fn test_stream_id_wire_order_matches_numeric_order() {
        let a = StreamId { ms: 1, seq: 500 };
        let b = StreamId { ms: 2, seq: 0 };
        assert!(a < b);
        assert!(a.to_bytes() < b.to_bytes());
        assert_eq!(StreamId::from_bytes(&a.to_bytes()), a);
    }

    #[test]
    fn test_object_defaults() {
        let obj = Object::new(Value::Int(9));
        assert_eq!(obj.idle, 0);
        assert_eq!(obj.freq, crate::object::FREQ_INITIAL);
        assert_eq!(Object::from(Value::Int(9)), obj);
    }
}
