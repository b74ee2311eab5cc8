use std::sync::{Arc, Barrier};
use std::thread;

use diskqueue::{Error, Queue, QueueConfig};
use tempfile::tempdir;

#[test]
fn close_is_terminal() {
    let dir = tempdir().expect("tempdir");
    let mut queue = Queue::open(QueueConfig::new(dir.path())).expect("queue open");
    let offset = queue.put(b"kept").expect("put");

    queue.close().expect("first close");
    assert!(matches!(queue.close(), Err(Error::AlreadyClosed)));
    assert!(matches!(queue.put(b"late"), Err(Error::AlreadyClosed)));
    assert!(matches!(queue.read(offset, Vec::new()), Err(Error::AlreadyClosed)));
    assert!(matches!(queue.init(), Err(Error::AlreadyClosed)));
}

#[test]
fn racing_closers_exactly_one_wins() {
    const CLOSERS: usize = 8;

    let dir = tempdir().expect("tempdir");
    let queue = Arc::new(Queue::open(QueueConfig::new(dir.path())).expect("queue open"));
    queue.put(b"before close").expect("put");
    let barrier = Arc::new(Barrier::new(CLOSERS));

    let handles: Vec<_> = (0..CLOSERS)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                queue.close()
            })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        match handle.join().expect("closer") {
            Ok(()) => winners += 1,
            Err(Error::AlreadyClosing) | Err(Error::AlreadyClosed) => {}
            Err(err) => panic!("unexpected close error: {err}"),
        }
    }
    assert_eq!(winners, 1);
    assert!(matches!(queue.check_close_state(), Err(Error::AlreadyClosed)));
}

#[test]
fn close_before_init() {
    let dir = tempdir().expect("tempdir");
    let mut queue = Queue::new(QueueConfig::new(dir.path()));
    queue.close().expect("close uninitialised");
    assert!(matches!(queue.init(), Err(Error::AlreadyClosed)));
    assert!(matches!(queue.put(b"x"), Err(Error::AlreadyClosed)));
}

#[test]
fn puts_racing_close_always_return() {
    const PRODUCERS: usize = 4;

    let dir = tempdir().expect("tempdir");
    let config = QueueConfig {
        write_batch: 4,
        ..QueueConfig::new(dir.path())
    };
    let queue = Arc::new(Queue::open(config).expect("queue open"));
    let barrier = Arc::new(Barrier::new(PRODUCERS + 1));

    let handles: Vec<_> = (0..PRODUCERS)
        .map(|t| {
            let queue = Arc::clone(&queue);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut accepted = Vec::new();
                for i in 0..500 {
                    match queue.put(format!("{t}:{i}").as_bytes()) {
                        Ok(offset) => accepted.push(offset),
                        Err(Error::AlreadyClosing) | Err(Error::AlreadyClosed) => break,
                        Err(err) => panic!("unexpected put error: {err}"),
                    }
                }
                accepted
            })
        })
        .collect();

    barrier.wait();
    queue.close().expect("close");

    let mut accepted = 0u64;
    for handle in handles {
        accepted += handle.join().expect("producer").len() as u64;
    }

    // Everything acknowledged before close is recorded in metadata.
    let reopened = Queue::open(QueueConfig::new(dir.path())).expect("reopen");
    let recorded: u64 = reopened
        .segment_metas()
        .expect("metas")
        .iter()
        .map(|meta| meta.msg_count)
        .sum();
    assert_eq!(recorded, accepted);
    reopened.close().expect("close reopened");
}
