//! Cross-component scenarios: several threads, real segments, full stacks.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::backoff::backoff;
use crate::queue::Queue;
use crate::ring::broadcast::Broadcast;
use crate::ring::Ring;
use crate::sync::waiter::Waiter;

/// Unique object names so parallel test runs never share kernel objects.
pub(crate) fn unique_name(tag: &str) -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!(
        "shmq-test-{}-{}-{}",
        tag,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}

fn ring_push(ring: &Broadcast<u64, 32>, value: u64) -> bool {
    ring.push(&mut |p| unsafe { p.write(value) })
}

fn ring_pop(ring: &Broadcast<u64, 32>, cursor: &mut u16, id: u32) -> Option<u64> {
    let mut value = 0u64;
    ring.pop(cursor, id, &mut |p| value = unsafe { p.read() })?;
    Some(value)
}

/// Two producers, two broadcast readers: every reader sees every message
/// exactly once, and both observe the same global commit order.
#[test]
fn broadcast_fan_out_under_contention() {
    const PER_PRODUCER: u64 = 1_000;
    const PRODUCERS: u64 = 2;

    let ring: Arc<Broadcast<u64, 32>> =
        Arc::new(unsafe { std::mem::MaybeUninit::zeroed().assume_init() });
    ring.init();

    // readers connect before any producer starts, so nothing is skipped
    let readers: Vec<(u32, u16)> = (0..2)
        .map(|_| (ring.connect_receiver(), ring.cursor()))
        .collect();

    let mut handles = Vec::new();
    for p in 0..PRODUCERS {
        let ring = Arc::clone(&ring);
        handles.push(thread::spawn(move || {
            for i in 0..PER_PRODUCER {
                let value = (p << 32) | i;
                let mut k = 0u32;
                while !ring_push(&ring, value) {
                    backoff(&mut k);
                }
            }
        }));
    }

    let mut consumers = Vec::new();
    for (id, cursor) in readers {
        let ring = Arc::clone(&ring);
        consumers.push(thread::spawn(move || {
            let mut cursor = cursor;
            let mut seen = Vec::new();
            let mut k = 0u32;
            while seen.len() < (PRODUCERS * PER_PRODUCER) as usize {
                match ring_pop(&ring, &mut cursor, id) {
                    Some(v) => {
                        seen.push(v);
                        k = 0;
                    }
                    None => backoff(&mut k),
                }
            }
            seen
        }));
    }

    for h in handles {
        h.join().unwrap();
    }
    let observed: Vec<Vec<u64>> = consumers.into_iter().map(|c| c.join().unwrap()).collect();

    for seen in &observed {
        let distinct: HashSet<&u64> = seen.iter().collect();
        assert_eq!(distinct.len(), seen.len(), "no duplicate deliveries");
        for p in 0..PRODUCERS {
            let of_p: Vec<u64> = seen
                .iter()
                .filter(|v| *v >> 32 == p)
                .map(|v| v & 0xffff_ffff)
                .collect();
            assert_eq!(
                of_p,
                (0..PER_PRODUCER).collect::<Vec<_>>(),
                "per-producer order and completeness"
            );
        }
    }
    assert_eq!(
        observed[0], observed[1],
        "both readers see the same commit order"
    );
}

/// Facade-level fan-out over a real named segment.
#[test]
fn two_readers_share_one_named_channel() {
    let name = unique_name("scenario-fanout");
    let mut writer: Queue<u64> = Queue::open(&name).unwrap();
    assert!(writer.ready_sending());

    let mut r1: Queue<u64> = Queue::open(&name).unwrap();
    let mut r2: Queue<u64> = Queue::open(&name).unwrap();
    assert!(r1.connect());
    assert!(r2.connect());
    assert_eq!(writer.conn_count(), 2);

    for v in [11, 22, 33u64] {
        assert!(writer.push(v));
    }
    for reader in [&mut r1, &mut r2] {
        assert_eq!(reader.pop(), Some(11));
        assert_eq!(reader.pop(), Some(22));
        assert_eq!(reader.pop(), Some(33));
        assert_eq!(reader.pop(), None);
    }

    // the slot drains with whichever reader releases it second
    let mut releases = Vec::new();
    assert!(writer.push(44));
    assert_eq!(r1.pop_with(|last| releases.push(last)), Some(44));
    assert_eq!(r2.pop_with(|last| releases.push(last)), Some(44));
    assert_eq!(releases, vec![false, true]);

    r1.disconnect();
    r2.disconnect();
    writer.shut_sending();
    Queue::<u64>::clear_storage(&name);
}

/// A reader sleeping on a waiter is driven entirely by producer notifies.
#[test]
fn waiter_paces_a_blocking_reader() {
    const COUNT: u64 = 200;
    let name = unique_name("scenario-waiter");

    let mut reader: Queue<u64> = Queue::open(&name).unwrap();
    assert!(reader.connect());
    let reader_waiter = Arc::new(Waiter::open(&name).unwrap());

    let writer_name = name.clone();
    let writer_waiter = Arc::clone(&reader_waiter);
    let producer = thread::spawn(move || {
        let mut queue: Queue<u64> = Queue::open(&writer_name).unwrap();
        assert!(queue.ready_sending());
        for v in 0..COUNT {
            let mut k = 0u32;
            while !queue.push(v) {
                backoff(&mut k);
            }
            writer_waiter.notify().unwrap();
            if v % 50 == 0 {
                thread::sleep(Duration::from_millis(1));
            }
        }
        queue.shut_sending();
    });

    let mut received = Vec::new();
    while received.len() < COUNT as usize {
        reader_waiter
            .wait_if(|| reader.empty(), 1_000)
            .unwrap();
        while let Some(v) = reader.pop() {
            received.push(v);
        }
    }
    producer.join().unwrap();

    assert_eq!(received, (0..COUNT).collect::<Vec<_>>());
    reader.disconnect();
    Waiter::clear_storage(&name);
    Queue::<u64>::clear_storage(&name);
}

/// Shutdown while a reader is parked: quit_waiting releases it promptly.
#[test]
fn quit_waiting_unparks_a_reader_with_no_producer() {
    let name = unique_name("scenario-shutdown");
    let waiter = Arc::new(Waiter::open(&name).unwrap());

    let parked = Arc::clone(&waiter);
    let handle = thread::spawn(move || parked.wait_if(|| true, crate::TIMEOUT_INFINITE).unwrap());

    thread::sleep(Duration::from_millis(50));
    waiter.quit_waiting().unwrap();
    assert!(handle.join().unwrap());
    Waiter::clear_storage(&name);
}

/// Mixed-rate readers: the slow one is eventually evicted by force_push and
/// the fast one keeps receiving.
#[test]
fn force_push_keeps_the_fast_reader_alive() {
    let name = unique_name("scenario-evict");
    let writer: Queue<u64> = Queue::open(&name).unwrap();
    let mut fast: Queue<u64> = Queue::open(&name).unwrap();
    let mut slow: Queue<u64> = Queue::open(&name).unwrap();
    assert!(fast.connect());
    assert!(slow.connect());

    let mut pushed = 0u64;
    let mut evicted = false;
    while pushed < 1_000 {
        if writer.push(pushed) {
            pushed += 1;
        } else {
            assert!(writer.force_push(pushed), "force_push must make room");
            pushed += 1;
            evicted = true;
        }
        // only the fast reader drains
        while fast.pop().is_some() {}
    }
    assert!(evicted, "the parked reader must have forced an eviction");
    assert_eq!(writer.conn_count(), 1);
    assert_eq!(slow.pop(), None);
    assert!(!slow.connected());

    Queue::<u64>::clear_storage(&name);
}
