//! The distributed rebalance protocol: engage, freeze, build, replace,
//! normalize.
//!
//! Any thread that notices a saturated or frozen chunk drives a rebalance.
//! Threads racing on the same chunk converge on one `RebalanceObject`, the
//! consensus token naming the engaged range; every phase is idempotent so
//! an arbitrary number of helpers can push the same rebalance forward.
//! Exactly one helper wins the final pointer swing, the rest re-observe the
//! new list and abandon their speculative sublists.

use std::sync::atomic::Ordering;

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};

use crate::chunk::{Chunk, FROZEN, INFANT};
use crate::queue::{coin, Hooks, KiwiQueue};

/// Probability (percent) that a driver losing the swing CAS helps its
/// frozen predecessor instead of just re-reading the list. Throttled so a
/// chain of adjacent rebalances does not turn into a storm.
const HELP_PRED_PCT: u32 = 50;

/// Consensus token shared by every chunk engaged in one rebalance.
pub(crate) struct RebalanceObject<K, const N: usize> {
    /// The chunk that created this object. Immutable.
    pub(crate) first: *const Chunk<K, N>,
    /// Sweeps forward over engagement candidates; null once the engage
    /// phase is over.
    pub(crate) next: Atomic<Chunk<K, N>>,
}

impl<K, const N: usize> RebalanceObject<K, N> {
    fn new(first: *const Chunk<K, N>, next: Shared<'_, Chunk<K, N>>) -> Self {
        let ro = RebalanceObject {
            first,
            next: Atomic::null(),
        };
        ro.next.store(next, Ordering::Relaxed);
        ro
    }
}

impl<K, H, const N: usize> KiwiQueue<K, H, N>
where
    K: Ord + Copy + Send,
    H: Hooks,
{
    /// Drives the rebalance `chunk` participates in to completion.
    pub(crate) fn rebalance<'g>(&self, chunk: Shared<'g, Chunk<K, N>>, guard: &'g Guard) {
        self.hooks.on_rebalance();
        let chunk = chunk.with_tag(0);
        let chunk_ref = unsafe { chunk.deref() };

        // Engage: agree on the set of chunks this rebalance covers.
        if chunk_ref.ro.load(Ordering::SeqCst, guard).is_null() {
            let candidate = Owned::new(RebalanceObject::new(
                chunk.as_raw(),
                chunk_ref.next.load(Ordering::SeqCst, guard).with_tag(0),
            ));
            if let Err(e) = chunk_ref.ro.compare_exchange(
                Shared::null(),
                candidate,
                Ordering::SeqCst,
                Ordering::SeqCst,
                guard,
            ) {
                drop(e.new);
            }
        }
        let ro = chunk_ref.ro.load(Ordering::SeqCst, guard);
        let ro_ref = unsafe { ro.deref() };

        let mut last = chunk;
        loop {
            let next = ro_ref.next.load(Ordering::SeqCst, guard).with_tag(0);
            if next.is_null() {
                break;
            }
            let next_ref = unsafe { next.deref() };
            if self.policy_engage(next_ref) {
                let _ = next_ref.ro.compare_exchange(
                    Shared::null(),
                    ro,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                    guard,
                );
                if next_ref.ro.load(Ordering::SeqCst, guard) == ro {
                    let after = next_ref.next.load(Ordering::SeqCst, guard).with_tag(0);
                    let _ = ro_ref.next.compare_exchange(
                        next,
                        after,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                        guard,
                    );
                    last = next;
                } else {
                    // Lost to a different rebalance; stop sweeping here.
                    let _ = ro_ref.next.compare_exchange(
                        next,
                        Shared::null(),
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                        guard,
                    );
                }
            } else {
                let _ = ro_ref.next.compare_exchange(
                    next,
                    Shared::null(),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                    guard,
                );
            }
        }
        // Pick up chunks engaged by racing drivers past our local view.
        loop {
            let next = unsafe { last.deref() }
                .next
                .load(Ordering::SeqCst, guard)
                .with_tag(0);
            if next.is_null() || unsafe { next.deref() }.ro.load(Ordering::SeqCst, guard) != ro {
                break;
            }
            last = next;
        }

        // Freeze the engaged range so the build phase reads a stable set.
        let first = Shared::from(ro_ref.first);
        let mut c = first;
        loop {
            debug_assert!(!c.is_null());
            let c_ref = unsafe { c.deref() };
            c_ref.freeze();
            if c == last {
                break;
            }
            c = c_ref.next.load(Ordering::SeqCst, guard).with_tag(0);
        }

        // Build: collect every surviving key, in order, and distribute into
        // half-full replacement chunks so they have room to grow.
        let mut keys = Vec::new();
        let mut c = first;
        loop {
            let c_ref = unsafe { c.deref() };
            c_ref.collect_preserved(&mut keys);
            if c == last {
                break;
            }
            c = c_ref.next.load(Ordering::SeqCst, guard).with_tag(0);
        }
        keys.sort_unstable();
        let new_chunks: Vec<Shared<'g, Chunk<K, N>>> = keys
            .chunks(N / 2 + 1)
            .map(|part| {
                Chunk::new_populated(self.max_threads, part, ro_ref.first).into_shared(guard)
            })
            .collect();

        // Replace, step one: the frozen-link mark on `last.next` stops
        // anyone from extending the doomed sublist while it is swapped out.
        let last_ref = unsafe { last.deref() };
        let succ = loop {
            let s = last_ref.next.load(Ordering::SeqCst, guard);
            if s.tag() == 1 {
                break s.with_tag(0);
            }
            if last_ref
                .next
                .compare_exchange(s, s.with_tag(1), Ordering::SeqCst, Ordering::SeqCst, guard)
                .is_ok()
            {
                break s;
            }
        };

        // Wire the replacement sublist and hook its tail to the successor.
        for pair in new_chunks.windows(2) {
            unsafe { pair[0].deref() }.next.store(pair[1], Ordering::Relaxed);
        }
        let infant = new_chunks.first().copied().unwrap_or_else(Shared::null);
        let new_head = match new_chunks.last() {
            Some(&tail) => {
                unsafe { tail.deref() }.next.store(succ, Ordering::SeqCst);
                infant
            }
            // Every engaged chunk drained empty; splice the range out.
            None => succ,
        };

        // Replace, step two: swing the predecessor over the new sublist.
        loop {
            match self.load_prev_chunk(first, guard) {
                Err(()) => {
                    // Another driver already swung the list. Our sublist was
                    // never published, so it can be dropped immediately.
                    for &c in &new_chunks {
                        drop(unsafe { c.into_owned() });
                    }
                    self.normalize(first, Shared::null(), guard);
                    return;
                }
                Ok(pred) => {
                    let swung = match pred {
                        Some(p) => unsafe { p.deref() }
                            .next
                            .compare_exchange(
                                first,
                                new_head,
                                Ordering::SeqCst,
                                Ordering::SeqCst,
                                guard,
                            )
                            .is_ok(),
                        None => self
                            .head
                            .compare_exchange(
                                first,
                                new_head,
                                Ordering::SeqCst,
                                Ordering::SeqCst,
                                guard,
                            )
                            .is_ok(),
                    };
                    if swung {
                        self.normalize(first, infant, guard);
                        // Retire the replaced chain and the consensus token.
                        let mut c = first;
                        loop {
                            let next = unsafe { c.deref() }
                                .next
                                .load(Ordering::SeqCst, guard)
                                .with_tag(0);
                            unsafe { guard.defer_destroy(c) };
                            if c == last {
                                break;
                            }
                            c = next;
                        }
                        unsafe { guard.defer_destroy(ro) };
                        return;
                    }
                    if let Some(p) = pred {
                        let p_ref = unsafe { p.deref() };
                        if p_ref.status() == FROZEN
                            && p_ref.next.load(Ordering::SeqCst, guard).with_tag(0) == first
                            && coin(HELP_PRED_PCT)
                        {
                            // The predecessor is being rebalanced itself.
                            self.rebalance(p, guard);
                        }
                    }
                }
            }
        }
    }

    /// Engage-time index maintenance: retire the index entries of the
    /// replaced chunks and publish the new ones, flipping INFANT to NORMAL.
    pub(crate) fn normalize<'g>(
        &self,
        parent: Shared<'g, Chunk<K, N>>,
        infant: Shared<'g, Chunk<K, N>>,
        guard: &'g Guard,
    ) {
        if !parent.is_null() {
            let ro = unsafe { parent.deref() }.ro.load(Ordering::SeqCst, guard);
            if !ro.is_null() {
                let mut c = parent;
                loop {
                    let c_ref = unsafe { c.deref() };
                    if c_ref.ro.load(Ordering::SeqCst, guard) != ro {
                        break;
                    }
                    let next = c_ref.next.load(Ordering::SeqCst, guard).with_tag(0);
                    self.index.delete_conditional(
                        &c_ref.min_key(),
                        c.as_raw() as *mut Chunk<K, N>,
                        guard,
                    );
                    if next.is_null() {
                        break;
                    }
                    c = next;
                }
            }
        }
        if !infant.is_null() {
            let parent_raw = parent.as_raw();
            let mut c = infant;
            while !c.is_null() {
                let c_ref = unsafe { c.deref() };
                if c_ref.parent.load(Ordering::SeqCst, guard).as_raw() != parent_raw
                    || c_ref.status() != INFANT
                {
                    break;
                }
                let next = c_ref.next.load(Ordering::SeqCst, guard).with_tag(0);
                loop {
                    let prev = self.index.load_prev(&c_ref.min_key(), guard);
                    if c_ref.status() != INFANT {
                        break;
                    }
                    if self.index.put_conditional(
                        c_ref.min_key(),
                        prev,
                        c.as_raw() as *mut Chunk<K, N>,
                        guard,
                    ) {
                        c_ref.set_normal();
                        break;
                    }
                }
                c = next;
            }
        }
    }

    /// Finds the chunk whose successor pointer is `target`, `None` meaning
    /// `target` hangs directly off the queue head. `Err` means `target` is
    /// no longer reachable: another driver finished the replace.
    fn load_prev_chunk<'g>(
        &self,
        target: Shared<'g, Chunk<K, N>>,
        guard: &'g Guard,
    ) -> Result<Option<Shared<'g, Chunk<K, N>>>, ()> {
        let target_min = unsafe { target.deref() }.min_key();
        let hint = self.index.load_prev(&target_min, guard);
        let (mut prev, mut curr) = if hint.is_null() {
            (None, self.head.load(Ordering::SeqCst, guard).with_tag(0))
        } else {
            let p = Shared::from(hint as *const Chunk<K, N>);
            (
                Some(p),
                unsafe { p.deref() }.next.load(Ordering::SeqCst, guard).with_tag(0),
            )
        };
        loop {
            if curr == target {
                return Ok(prev);
            }
            if curr.is_null() {
                return Err(());
            }
            let curr_ref = unsafe { curr.deref() };
            if curr_ref.min_key() > target_min {
                return Err(());
            }
            prev = Some(curr);
            curr = curr_ref.next.load(Ordering::SeqCst, guard).with_tag(0);
        }
    }
}
