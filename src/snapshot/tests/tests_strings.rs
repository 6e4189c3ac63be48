#[cfg(test)]
mod tests {
    use crate::db::StoreConfig;
    use crate::object::Value;
    use crate::snapshot::tests::helpers::{
        encode_string, init_tracing, snapshot_bytes, test_config, test_store,
    };
    use crate::snapshot::{SaveOptions, load};

    fn no_compression() -> SaveOptions {
        SaveOptions {
            compression: false,
            ..SaveOptions::default()
        }
    }

    #[test]
    fn test_small_int_uses_8bit_form() {
        init_tracing();

        assert_eq!(encode_string(b"0", &no_compression()), vec![0xC0, 0x00]);
        assert_eq!(encode_string(b"127", &no_compression()), vec![0xC0, 0x7f]);
        assert_eq!(encode_string(b"-128", &no_compression()), vec![0xC0, 0x80]);
    }

    #[test]
    fn test_16bit_integer_special_form() {
        init_tracing();

        // "12345" → tag 0xC1 then 0x3039 little endian.
        assert_eq!(
            encode_string(b"12345", &no_compression()),
            vec![0xC1, 0x39, 0x30]
        );
    }

    #[test]
    fn test_32bit_integer_special_form() {
        init_tracing();

        assert_eq!(
            encode_string(b"1000000000", &no_compression()),
            vec![0xC2, 0x00, 0xCA, 0x9A, 0x3B]
        );
    }

    #[test]
    fn test_non_canonical_digits_stay_raw() {
        init_tracing();

        // Leading zeros and "+" are not the canonical decimal form, so
        // the bytes must be preserved verbatim.
        assert_eq!(
            encode_string(b"007", &no_compression()),
            vec![0x03, b'0', b'0', b'7']
        );
        assert_eq!(
            encode_string(b"+12", &no_compression()),
            vec![0x03, b'+', b'1', b'2']
        );
    }

    #[test]
    fn test_int_too_wide_for_special_form_stays_raw() {
        init_tracing();

        // Fits i64 but not i32, and is 11 chars: raw form.
        let encoded = encode_string(b"99999999999", &no_compression());
        assert_eq!(encoded[0], 11);
        assert_eq!(&encoded[1..], b"99999999999");
    }

    #[test]
    fn test_compression_kicks_in_above_20_bytes() {
        init_tracing();

        let compressible = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        let packed = encode_string(compressible, &SaveOptions::default());
        // LZF tag is 0xC3.
        assert_eq!(packed[0], 0xC3);
        assert!(packed.len() < compressible.len());

        // Same string with compression disabled: raw form.
        let raw = encode_string(compressible, &no_compression());
        assert_eq!(raw[0] as usize, compressible.len());
    }

    #[test]
    fn test_short_strings_never_compressed() {
        init_tracing();

        let s = b"aaaaaaaaaaaaaaaaaaaa"; // exactly 20 bytes
        let encoded = encode_string(s, &SaveOptions::default());
        assert_eq!(encoded[0] as usize, s.len());
    }

    #[test]
    fn test_integer_value_round_trips_to_original_digits() {
        init_tracing();

        // An integer-encodable string value comes back as the integer
        // whose decimal form is the original bytes.
        let mut store = test_store();
        store.set(0, b"n", Value::Str(b"12345".as_slice().into())).unwrap();

        let image = snapshot_bytes(&store, &SaveOptions::default());
        // The 16-bit special form must appear in the image.
        assert!(
            image.windows(3).any(|w| w == [0xC1, 0x39, 0x30]),
            "16-bit integer form missing from the image"
        );

        let loaded = load(&image, test_config()).unwrap();
        let mut loaded_store = loaded.store;
        assert_eq!(loaded_store.get(0, b"n").unwrap(), Some(&Value::Int(12345)));
    }

    #[test]
    fn test_integer_keys_round_trip_byte_exact() {
        init_tracing();

        // Keys go through the same integer special encoding but must
        // come back as their original ASCII bytes.
        let mut store = test_store();
        store.set(0, b"4242", Value::Int(1)).unwrap();

        let image = snapshot_bytes(&store, &SaveOptions::default());
        let loaded = load(&image, test_config()).unwrap();
        let mut loaded_store = loaded.store;
        assert_eq!(loaded_store.get(0, b"4242").unwrap(), Some(&Value::Int(1)));
    }

    #[test]
    fn test_binary_strings_survive_compression_path() {
        init_tracing();

        let mut blob = Vec::new();
        for i in 0..1000u32 {
            blob.extend_from_slice(&(i % 7).to_le_bytes());
        }
        blob.push(0);
        blob.push(255);

        let mut store = test_store();
        store.set(0, b"blob", Value::Str(blob.clone().into())).unwrap();

        let image = snapshot_bytes(&store, &SaveOptions::default());
        let loaded = load(&image, test_config()).unwrap();
        let mut loaded_store = loaded.store;
        assert_eq!(
            loaded_store.get(0, b"blob").unwrap(),
            Some(&Value::Str(blob.into()))
        );
    }

    #[test]
    fn test_checksum_disabled_writes_zero_trailer() {
        init_tracing();

        let mut store = test_store();
        store.set(0, b"k", Value::Int(1)).unwrap();

        let options = SaveOptions {
            checksum: false,
            ..SaveOptions::default()
        };
        let image = snapshot_bytes(&store, &options);
        assert_eq!(&image[image.len() - 8..], &[0u8; 8]);

        // A zero trailer means "checksum not recorded": load succeeds.
        let loaded = load(&image, StoreConfig::default()).unwrap();
        assert_eq!(loaded.version, crate::snapshot::FORMAT_VERSION);
    }
}
