//! The queue facade: locate a chunk, check its health, execute, help.
//!
//! Dvir Basin, Edward Bortnikov, Anastasia Braginsky, Guy Golan-Gueta,
//! Eshcar Hillel, Idit Keidar, and Moshe Sulamy. KiWi: A Key-Value Map for
//! Scalable Real-Time Analytics. PPoPP 2017.
//! https://doi.org/10.1145/3018743.3018761

use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Shared};
use crossbeam_utils::CachePadded;
use rand::Rng;

use crate::chunk::{Chunk, DEFAULT_CHUNK_SIZE, FROZEN, INFANT};
use crate::index::Index;
use crate::tid;

/// Default PPA width; thread ids must stay below the queue's bound.
pub const DEFAULT_MAX_THREADS: usize = 128;

/// Probability (percent) that a popper walking past the head helps a frozen
/// chunk it encounters. At the head it always helps, for progress.
const HELP_POP_PCT: u32 = 50;

/// Capability hooks for instrumenting and steering the rebalance driver.
/// The no-op impl on `()` is the production configuration.
pub trait Hooks {
    /// Called once per entry into the rebalance driver.
    fn on_rebalance(&self) {}

    /// Overrides the probabilistic rebalance policy: `Some(v)` forces every
    /// policy decision to `v`, `None` keeps the default heuristic.
    fn policy_override(&self) -> Option<bool> {
        None
    }
}

impl Hooks for () {}

/// A lock-free concurrent priority queue over totally ordered keys.
///
/// `K` is the key type (the `Ord` bound is the comparator), `H` the hook
/// set, and `N` the chunk capacity. Equal keys may coexist; the queue is a
/// multiset.
pub struct KiwiQueue<K, H = (), const N: usize = DEFAULT_CHUNK_SIZE> {
    pub(crate) head: CachePadded<Atomic<Chunk<K, N>>>,
    pub(crate) index: Index<K, *mut Chunk<K, N>>,
    pub(crate) max_threads: usize,
    pub(crate) hooks: H,
}

unsafe impl<K: Send, H: Send, const N: usize> Send for KiwiQueue<K, H, N> {}
unsafe impl<K: Send, H: Sync, const N: usize> Sync for KiwiQueue<K, H, N> {}

/// True with probability `percent` per cent, on this thread's PRNG.
pub(crate) fn coin(percent: u32) -> bool {
    rand::thread_rng().gen_range(0..100) < percent
}

impl<K, const N: usize> KiwiQueue<K, (), N>
where
    K: Ord + Copy + Send,
{
    pub fn new() -> Self {
        Self::with_max_threads(DEFAULT_MAX_THREADS)
    }

    /// A queue whose chunks carry `max_threads` pending-operation slots.
    pub fn with_max_threads(max_threads: usize) -> Self {
        Self::with_hooks(max_threads, ())
    }
}

impl<K, const N: usize> Default for KiwiQueue<K, (), N>
where
    K: Ord + Copy + Send,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, H, const N: usize> KiwiQueue<K, H, N>
where
    K: Ord + Copy + Send,
    H: Hooks,
{
    pub fn with_hooks(max_threads: usize, hooks: H) -> Self {
        KiwiQueue {
            head: CachePadded::new(Atomic::null()),
            index: Index::new(std::ptr::null_mut()),
            max_threads,
            hooks,
        }
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Inserts `key`. Returns true on successful insertion.
    pub fn push(&self, key: K) -> bool {
        let guard = &epoch::pin();
        let tid = tid::thread_id();
        assert!(
            tid < self.max_threads,
            "thread id {} exceeds max_threads {}",
            tid,
            self.max_threads
        );
        loop {
            let chunk = self.locate(&key, guard);
            if self.check_rebalance(chunk, guard) {
                continue;
            }
            let chunk_ref = unsafe { chunk.deref() };
            let idx = match chunk_ref.reserve_slot() {
                Some(idx) => idx,
                None => {
                    self.rebalance(chunk, guard);
                    continue;
                }
            };
            unsafe { chunk_ref.write_key(idx, key) };
            if !chunk_ref.publish_push(tid, idx) {
                // Frozen between the reservation and the publication; the
                // slot is abandoned and the key retried elsewhere.
                self.rebalance(chunk, guard);
                continue;
            }
            chunk_ref.insert(idx);
            chunk_ref.unpublish(tid);
            return true;
        }
    }

    /// Removes and returns the current minimum. Approximate under
    /// concurrency: an insert racing into an earlier chunk may linearize
    /// after the popping thread has walked past it.
    pub fn try_pop(&self) -> Option<K> {
        let guard = &epoch::pin();
        let tid = tid::thread_id();
        assert!(
            tid < self.max_threads,
            "thread id {} exceeds max_threads {}",
            tid,
            self.max_threads
        );
        'restart: loop {
            let mut chunk = self.head.load(Ordering::SeqCst, guard).with_tag(0);
            let mut at_head = true;
            while !chunk.is_null() {
                let chunk_ref = unsafe { chunk.deref() };
                if let Some(key) = chunk_ref.try_pop(tid) {
                    return Some(key);
                }
                if chunk_ref.status() == FROZEN && (at_head || coin(HELP_POP_PCT)) {
                    self.rebalance(chunk, guard);
                    continue 'restart;
                }
                at_head = false;
                chunk = chunk_ref.next.load(Ordering::SeqCst, guard).with_tag(0);
            }
            return None;
        }
    }

    /// Number of live keys. Unsynchronized; test and diagnostic use only.
    pub fn size(&self) -> usize {
        let guard = &epoch::pin();
        let mut total = 0;
        let mut chunk = self.head.load(Ordering::SeqCst, guard).with_tag(0);
        while !chunk.is_null() {
            let chunk_ref = unsafe { chunk.deref() };
            total += chunk_ref.count_live();
            chunk = chunk_ref.next.load(Ordering::SeqCst, guard).with_tag(0);
        }
        total
    }

    /// Finds the chunk whose range covers `key`, creating the bootstrap
    /// chunk when the list is empty. The index gives a starting hint; the
    /// walk over `next` pointers is authoritative.
    fn locate<'g>(&self, key: &K, guard: &'g Guard) -> Shared<'g, Chunk<K, N>> {
        loop {
            let first = self.head.load(Ordering::SeqCst, guard).with_tag(0);
            if first.is_null() {
                let chunk = Chunk::<K, N>::new(self.max_threads);
                unsafe { chunk.set_min_key(*key) };
                match self.head.compare_exchange(
                    Shared::null(),
                    chunk,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                    guard,
                ) {
                    Ok(installed) => self.normalize(Shared::null(), installed, guard),
                    Err(e) => drop(e.new),
                }
                continue;
            }
            let hint = self.index.load_prev(key, guard);
            let mut curr = if hint.is_null() {
                // The first chunk takes every key below its own minimum.
                first
            } else {
                Shared::from(hint as *const Chunk<K, N>)
            };
            loop {
                let next = unsafe { curr.deref() }
                    .next
                    .load(Ordering::SeqCst, guard)
                    .with_tag(0);
                if next.is_null() || unsafe { next.deref() }.min_key() > *key {
                    break;
                }
                curr = next;
            }
            return curr;
        }
    }

    /// INFANT chunks get normalized; full, frozen, or suspiciously loaded
    /// chunks trigger a rebalance. True means the caller must re-locate.
    fn check_rebalance<'g>(&self, chunk: Shared<'g, Chunk<K, N>>, guard: &'g Guard) -> bool {
        let chunk_ref = unsafe { chunk.deref() };
        if chunk_ref.status() == INFANT {
            let parent = chunk_ref.parent.load(Ordering::SeqCst, guard);
            self.normalize(parent, chunk, guard);
            return true;
        }
        if chunk_ref.slots_used() as usize >= N
            || chunk_ref.status() == FROZEN
            || self.policy_check(chunk_ref)
        {
            self.rebalance(chunk, guard);
            return true;
        }
        false
    }

    /// Engage heuristic: a chunk outside the healthy fill band joins a
    /// neighbor's rebalance, with a dampening coin.
    pub(crate) fn policy_engage(&self, chunk: &Chunk<K, N>) -> bool {
        if let Some(forced) = self.hooks.policy_override() {
            return forced;
        }
        let used = chunk.slots_used() as usize;
        (used <= N / 8 || used >= N * 5 / 8) && coin(15)
    }

    /// Check heuristic: a nearly full chunk occasionally rebalances early.
    fn policy_check(&self, chunk: &Chunk<K, N>) -> bool {
        if let Some(forced) = self.hooks.policy_override() {
            return forced;
        }
        chunk.slots_used() as usize > N * 7 / 8 && coin(5)
    }
}

impl<K, H, const N: usize> Drop for KiwiQueue<K, H, N> {
    fn drop(&mut self) {
        unsafe {
            let guard = epoch::unprotected();
            let mut chunk = self.head.load(Ordering::Relaxed, guard).with_tag(0);
            while !chunk.is_null() {
                let next = chunk.deref().next.load(Ordering::Relaxed, guard).with_tag(0);
                drop(chunk.into_owned());
                chunk = next;
            }
        }
    }
}
