use std::sync::Arc;
use std::thread;

use diskqueue::{Error, Queue, QueueConfig};
use tempfile::tempdir;

#[test]
fn offsets_point_at_length_prefix() {
    let dir = tempdir().expect("tempdir");
    let queue = Queue::open(QueueConfig::new(dir.path())).expect("queue open");

    assert_eq!(queue.put(b"hello").expect("put hello"), 0);
    assert_eq!(queue.put(b"world").expect("put world"), 9);
    assert_eq!(queue.put(b"").expect("put empty"), 18);
    assert_eq!(queue.end_offset().expect("end offset"), 22);

    let records = queue
        .read(0, vec![Vec::new(); 3])
        .expect("read back");
    assert_eq!(records, vec![b"hello".to_vec(), b"world".to_vec(), Vec::new()]);
    queue.close().expect("close");
}

#[test]
fn oversized_payload_rejected_without_side_effects() {
    let dir = tempdir().expect("tempdir");
    let config = QueueConfig {
        max_msg_size: 8,
        ..QueueConfig::new(dir.path())
    };
    let queue = Queue::open(config).expect("queue open");

    let err = queue.put(&[0u8; 9]).expect_err("too large");
    assert!(matches!(err, Error::MsgTooLarge { len: 9, max: 8 }));
    assert_eq!(queue.end_offset().expect("end offset"), 0);

    assert_eq!(queue.put(&[1u8; 8]).expect("put at limit"), 0);
    queue.close().expect("close");
}

#[test]
fn put_before_init_fails() {
    let dir = tempdir().expect("tempdir");
    let queue = Queue::new(QueueConfig::new(dir.path()));
    assert!(matches!(queue.put(b"early"), Err(Error::NotInitialized)));
    assert!(matches!(queue.end_offset(), Err(Error::NotInitialized)));
}

#[test]
fn concurrent_producers_get_distinct_readable_offsets() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 200;

    let dir = tempdir().expect("tempdir");
    let config = QueueConfig {
        write_batch: 16,
        segment_size: 4096,
        ..QueueConfig::new(dir.path())
    };
    let queue = Arc::new(Queue::open(config).expect("queue open"));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                (0..PER_THREAD)
                    .map(|i| {
                        let payload = format!("t{t}-m{i}").into_bytes();
                        let offset = queue.put(&payload).expect("put");
                        (offset, payload)
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        let written = handle.join().expect("producer");
        for pair in written.windows(2) {
            assert!(pair[0].0 < pair[1].0, "per-thread order must hold");
        }
        all.extend(written);
    }

    for (offset, payload) in &all {
        let records = queue.read(*offset, Vec::new()).expect("read");
        assert_eq!(&records[0], payload);
    }

    all.sort_by_key(|(offset, _)| *offset);
    all.dedup_by_key(|(offset, _)| *offset);
    assert_eq!(all.len(), THREADS * PER_THREAD);

    let total: u64 = queue
        .segment_metas()
        .expect("metas")
        .iter()
        .map(|meta| meta.msg_count)
        .sum();
    assert_eq!(total, (THREADS * PER_THREAD) as u64);
    assert!(queue.num_segments().expect("segments") > 1);
    queue.close().expect("close");
}
