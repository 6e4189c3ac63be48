#[cfg(test)]
mod tests {
    use crate::object::Value;
    use crate::snapshot::tests::helpers::{init_tracing, test_config, test_store};
    use crate::snapshot::{SaveOptions, load, save_to_fanout};
    use std::io::{self, Write};

    /// A sink that starts failing after a byte budget, to model a
    /// receiver dropping mid-stream.
    struct FlakySink {
        received: Vec<u8>,
        budget: usize,
    }

    impl Write for FlakySink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.received.len() + buf.len() > self.budget {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "receiver gone"));
            }
            self.received.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_fanout_framing_and_payload() {
        init_tracing();

        let mut store = test_store();
        store.set(0, b"k", Value::Int(5)).unwrap();

        let report =
            save_to_fanout(vec![Vec::new(), Vec::new()], store.databases(), &SaveOptions::default())
                .unwrap();

        assert_eq!(report.mark.len(), 40);
        assert!(report.mark.bytes().all(|b| b.is_ascii_hexdigit()));

        for receiver in report.receivers {
            let stream = receiver.expect("in-memory receiver cannot fail");

            // Prologue: $EOF:<mark>\r\n
            let prologue_len = 5 + 40 + 2;
            assert_eq!(&stream[..5], b"$EOF:");
            assert_eq!(&stream[5..45], report.mark.as_bytes());
            assert_eq!(&stream[45..47], b"\r\n");

            // Epilogue: the bare mark again.
            let payload_end = stream.len() - 40;
            assert_eq!(&stream[payload_end..], report.mark.as_bytes());

            // The payload between the marks is a byte-exact snapshot.
            let payload = &stream[prologue_len..payload_end];
            assert_eq!(payload.len() as u64, report.payload_bytes);
            let mut loaded = load(payload, test_config()).unwrap().store;
            assert_eq!(loaded.get(0, b"k").unwrap(), Some(&Value::Int(5)));
        }
    }

    #[test]
    fn test_identical_bytes_to_every_receiver() {
        init_tracing();

        let mut store = test_store();
        for i in 0..50u64 {
            store.set(0, format!("k{i}").as_bytes(), Value::Int(i as i64)).unwrap();
        }
        let report =
            save_to_fanout(vec![Vec::new(), Vec::new(), Vec::new()], store.databases(), &SaveOptions::default())
                .unwrap();
        let streams: Vec<Vec<u8>> = report
            .receivers
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(streams[0], streams[1]);
        assert_eq!(streams[1], streams[2]);
    }

    #[test]
    fn test_failing_receiver_does_not_stop_the_others() {
        init_tracing();

        let mut store = test_store();
        for i in 0..200u64 {
            store
                .set(0, format!("key:{i}").as_bytes(), Value::Int(i as i64))
                .unwrap();
        }

        let flaky = FlakySink {
            received: Vec::new(),
            budget: 64,
        };
        let healthy = FlakySink {
            received: Vec::new(),
            budget: usize::MAX,
        };

        let report =
            save_to_fanout(vec![flaky, healthy], store.databases(), &SaveOptions::default())
                .unwrap();

        assert!(report.receivers[0].is_err(), "flaky receiver must be reported");
        let healthy = report.receivers.into_iter().nth(1).unwrap().unwrap();
        assert!(healthy.received.len() as u64 > report.payload_bytes);
    }

    #[test]
    fn test_all_receivers_failing_aborts_the_save() {
        init_tracing();

        let mut store = test_store();
        for i in 0..200u64 {
            store
                .set(0, format!("key:{i}").as_bytes(), Value::Int(i as i64))
                .unwrap();
        }

        let a = FlakySink { received: Vec::new(), budget: 32 };
        let b = FlakySink { received: Vec::new(), budget: 48 };
        assert!(save_to_fanout(vec![a, b], store.databases(), &SaveOptions::default()).is_err());
    }
}
