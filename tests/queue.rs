//! End-to-end scenarios for the priority queue, sequential and concurrent.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::thread::scope;
use kiwi_queue::{Hooks, KiwiQueue};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Pins the probabilistic rebalance policy off so sequential scenarios are
/// deterministic, and counts rebalance entries.
#[derive(Default)]
struct Deterministic {
    rebalances: AtomicUsize,
}

impl Hooks for Deterministic {
    fn on_rebalance(&self) {
        self.rebalances.fetch_add(1, Ordering::Relaxed);
    }
    fn policy_override(&self) -> Option<bool> {
        Some(false)
    }
}

#[test]
fn one_push_one_pop() {
    let queue: KiwiQueue<i32> = KiwiQueue::new();
    assert!(queue.push(1));
    assert_eq!(queue.try_pop(), Some(1));
    assert_eq!(queue.try_pop(), None);
}

#[test]
fn ascending_sequence_drains_in_order() {
    let queue: KiwiQueue<u32, (), 64> = KiwiQueue::new();
    for key in 10..=500u32 {
        assert!(queue.push(key));
    }
    for expected in 10..=500u32 {
        assert_eq!(queue.try_pop(), Some(expected));
    }
    assert_eq!(queue.try_pop(), None);
}

#[test]
fn descending_sequence_drains_in_order() {
    let queue: KiwiQueue<u32, (), 64> = KiwiQueue::new();
    for key in (10..=500u32).rev() {
        assert!(queue.push(key));
    }
    for expected in 10..=500u32 {
        assert_eq!(queue.try_pop(), Some(expected));
    }
    assert_eq!(queue.try_pop(), None);
}

#[test]
fn rebalance_triggered_by_tiny_chunks() {
    let queue: KiwiQueue<u32, Deterministic, 4> =
        KiwiQueue::with_hooks(64, Deterministic::default());
    for key in 1..=17u32 {
        assert!(queue.push(key));
    }
    assert_eq!(queue.size(), 17);
    assert!(queue.hooks().rebalances.load(Ordering::Relaxed) >= 1);
    for expected in 1..=17u32 {
        assert_eq!(queue.try_pop(), Some(expected));
    }
    assert_eq!(queue.try_pop(), None);
}

#[test]
fn count_conservation_with_duplicates() {
    let queue: KiwiQueue<u32, (), 32> = KiwiQueue::new();
    let pushed = [9u32, 4, 4, 7, 1, 9, 9, 2, 4, 6, 0, 7];
    for &key in &pushed {
        assert!(queue.push(key));
    }
    let mut popped = Vec::new();
    for _ in 0..5 {
        popped.push(queue.try_pop().unwrap());
    }
    assert_eq!(queue.size(), pushed.len() - popped.len());
    let mut remaining = Vec::new();
    while let Some(key) = queue.try_pop() {
        remaining.push(key);
    }
    let mut all = popped;
    all.extend(remaining);
    all.sort_unstable();
    let mut expected = pushed.to_vec();
    expected.sort_unstable();
    assert_eq!(all, expected);
}

#[test]
fn randomized_heap_sort() {
    const N: usize = 256;
    let queue: KiwiQueue<u32, (), N> = KiwiQueue::new();
    let mut rng = StdRng::seed_from_u64(0xDEADBEEF);
    let mut input: Vec<u32> = (0..5 * N + 10).map(|_| rng.gen()).collect();
    for &key in &input {
        assert!(queue.push(key));
    }
    input.sort_unstable();
    for &expected in &input {
        assert_eq!(queue.try_pop(), Some(expected));
    }
    assert_eq!(queue.try_pop(), None);
}

#[test]
fn concurrent_producers_lose_nothing() {
    const N: usize = 256;
    const THREADS: u64 = 8;
    const B: u64 = (N as u64) * 4;
    let queue: KiwiQueue<u64, (), N> = KiwiQueue::new();
    scope(|s| {
        for t in 0..THREADS {
            let queue = &queue;
            s.spawn(move |_| {
                for key in t * B..(t + 1) * B {
                    assert!(queue.push(key));
                }
            });
        }
    })
    .unwrap();
    assert_eq!(queue.size(), (THREADS * B) as usize);
    for expected in 0..THREADS * B {
        assert_eq!(queue.try_pop(), Some(expected));
    }
    assert_eq!(queue.try_pop(), None);
}

#[test]
fn mixed_workload_keeps_the_multiset() {
    const N: usize = 256;
    const PUSHERS: u64 = 4;
    const PER_PUSHER: u64 = (N as u64) * 32;
    const POPPERS: usize = 4;
    const PER_POPPER: usize = N * 16;
    let queue: KiwiQueue<u64, (), N> = KiwiQueue::new();
    scope(|s| {
        for t in 0..PUSHERS {
            let queue = &queue;
            s.spawn(move |_| {
                for key in t * PER_PUSHER..(t + 1) * PER_PUSHER {
                    assert!(queue.push(key));
                }
            });
        }
        for _ in 0..POPPERS {
            let queue = &queue;
            s.spawn(move |_| {
                let mut popped = 0;
                while popped < PER_POPPER {
                    if queue.try_pop().is_some() {
                        popped += 1;
                    }
                }
            });
        }
    })
    .unwrap();
    assert_eq!(
        queue.size(),
        (PUSHERS * PER_PUSHER) as usize - POPPERS * PER_POPPER
    );
    let mut drained = Vec::new();
    while let Some(key) = queue.try_pop() {
        drained.push(key);
    }
    assert_eq!(drained.len(), (PUSHERS * PER_PUSHER) as usize - POPPERS * PER_POPPER);
    // All pushed keys were distinct, so the drain is strictly increasing.
    assert!(drained.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn helping_under_constant_rebalance_pressure() {
    // Tiny chunks force a rebalance every few operations; interleaved key
    // ranges make every thread hammer the same chunks, so most rebalances
    // are driven by helpers.
    const THREADS: u64 = 8;
    const PER_THREAD: u64 = 500;
    let queue: KiwiQueue<u64, (), 4> = KiwiQueue::new();
    scope(|s| {
        for t in 0..THREADS {
            let queue = &queue;
            s.spawn(move |_| {
                for i in 0..PER_THREAD {
                    assert!(queue.push(i * THREADS + t));
                }
            });
        }
    })
    .unwrap();
    assert_eq!(queue.size(), (THREADS * PER_THREAD) as usize);
    for expected in 0..THREADS * PER_THREAD {
        assert_eq!(queue.try_pop(), Some(expected));
    }
    assert_eq!(queue.try_pop(), None);
}
