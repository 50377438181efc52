//! Lock-free skip-list index from chunk minimum keys to chunk pointers.
//!
//! The queue uses this to jump close to the chunk covering a key instead of
//! scanning the chunk list linearly. Entries are inserted when a chunk
//! becomes NORMAL and deleted when a rebalance retires it; both operations
//! are conditional on the observed neighborhood so that a racing rebalance
//! cannot publish into a subrange being replaced. A stale or missing entry
//! only costs a longer linear walk, never correctness.
//!
//! The search is Fraser's marked-pointer skip-list search; deletion marks a
//! node's forward pointers top-down and lets the next search splice it out.
//!
//! Keir Fraser. Practical lock-freedom. University of Cambridge, 2004.

use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam_epoch::Guard;
use rand::Rng;

use crate::marked::{tag, tagged, untagged};

const MAX_LEVEL: usize = 20;

struct Node<K, V> {
    key: MaybeUninit<K>,
    val: V,
    /// One forward pointer per level; the mark bit flags deletion.
    next: Box<[AtomicPtr<Node<K, V>>]>,
}

impl<K, V> Node<K, V> {
    fn new(key: MaybeUninit<K>, val: V, height: usize) -> Box<Self> {
        Box::new(Node {
            key,
            val,
            next: (0..height).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
        })
    }

    fn height(&self) -> usize {
        self.next.len()
    }

    /// Safety: not the head sentinel.
    unsafe fn key(&self) -> K
    where
        K: Copy,
    {
        *self.key.as_ptr()
    }
}

/// `preds[i]`/`succs[i]` per level, straddling the searched key.
type Window<K, V> = ([*mut Node<K, V>; MAX_LEVEL], [*mut Node<K, V>; MAX_LEVEL]);

pub(crate) struct Index<K, V> {
    /// Head sentinel; its value stands for "the list head" in `load_prev`.
    head: *mut Node<K, V>,
}

impl<K, V> Index<K, V>
where
    K: Ord + Copy,
    V: Copy + PartialEq,
{
    pub(crate) fn new(head_val: V) -> Self {
        Index {
            head: Box::into_raw(Node::new(MaybeUninit::uninit(), head_val, MAX_LEVEL)),
        }
    }

    /// Fraser search down from `height - 1`: per level, `preds[i]` is the
    /// last node with key below `key` and `succs[i]` the first at or above
    /// it (null meaning the tail), with marked runs spliced along the way.
    fn search(&self, key: &K, height: usize) -> Window<K, V> {
        'retry: loop {
            let mut preds = [ptr::null_mut(); MAX_LEVEL];
            let mut succs = [ptr::null_mut(); MAX_LEVEL];
            let mut left = self.head;
            for i in (0..height).rev() {
                let mut left_next = unsafe { &*left }.next[i].load(Ordering::Acquire);
                if tag(left_next) != 0 {
                    continue 'retry;
                }
                let mut right = left_next;
                loop {
                    // Skip a run of marked nodes.
                    let mut right_next;
                    loop {
                        if right.is_null() {
                            right_next = ptr::null_mut();
                            break;
                        }
                        right_next = unsafe { &*right }.next[i].load(Ordering::Acquire);
                        if tag(right_next) == 0 {
                            break;
                        }
                        right = untagged(right_next);
                    }
                    // Make left and right adjacent again.
                    if left_next != right
                        && unsafe { &*left }.next[i]
                            .compare_exchange(left_next, right, Ordering::Release, Ordering::Relaxed)
                            .is_err()
                    {
                        continue 'retry;
                    }
                    if right.is_null() || unsafe { (*right).key() } >= *key {
                        break;
                    }
                    left = right;
                    left_next = right_next;
                    right = right_next;
                }
                preds[i] = left;
                succs[i] = right;
            }
            return (preds, succs);
        }
    }

    /// Value at the greatest key strictly below `key`, or the head value
    /// when no such entry exists. The guard keeps traversed nodes alive.
    pub(crate) fn load_prev(&self, key: &K, _guard: &Guard) -> V {
        let (preds, _) = self.search(key, MAX_LEVEL);
        unsafe { (*preds[0]).val }
    }

    /// Inserts `key -> val` iff no entry for `key` exists and the current
    /// predecessor's value matches `expected_prev`.
    pub(crate) fn put_conditional(&self, key: K, expected_prev: V, val: V, _guard: &Guard) -> bool {
        let height = random_height();
        let node = Box::into_raw(Node::new(MaybeUninit::new(key), val, height));
        loop {
            let (preds, succs) = self.search(&key, MAX_LEVEL);
            let succ = succs[0];
            if !succ.is_null() && unsafe { (*succ).key() } == key {
                drop(unsafe { Box::from_raw(node) });
                return false;
            }
            if unsafe { (*preds[0]).val } != expected_prev {
                drop(unsafe { Box::from_raw(node) });
                return false;
            }
            for i in 0..height {
                unsafe { &*node }.next[i].store(succs[i], Ordering::Relaxed);
            }
            // The node is live once linked at the bottom level.
            if unsafe { &*preds[0] }.next[0]
                .compare_exchange(succ, node, Ordering::Release, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            self.finish_insert(node, height, &key, preds, succs);
            return true;
        }
    }

    /// Links the upper levels of a freshly inserted node, repairing stale
    /// forward pointers and backing off if the node gets deleted meanwhile.
    fn finish_insert(
        &self,
        node: *mut Node<K, V>,
        height: usize,
        key: &K,
        mut preds: [*mut Node<K, V>; MAX_LEVEL],
        mut succs: [*mut Node<K, V>; MAX_LEVEL],
    ) {
        for i in 1..height {
            loop {
                let pred = preds[i];
                let succ = succs[i];
                let cur = unsafe { &*node }.next[i].load(Ordering::Acquire);
                if tag(cur) != 0 {
                    return;
                }
                // The forward pointer may be stale after a re-search.
                if cur != succ
                    && unsafe { &*node }.next[i]
                        .compare_exchange(cur, succ, Ordering::Release, Ordering::Relaxed)
                        .is_err()
                {
                    return;
                }
                if unsafe { &*pred }.next[i]
                    .compare_exchange(succ, node, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    if tag(unsafe { &*node }.next[i].load(Ordering::Acquire)) != 0 {
                        // Deleted while we were stitching; help unlink.
                        self.search(key, MAX_LEVEL);
                        return;
                    }
                    break;
                }
                let (p, s) = self.search(key, MAX_LEVEL);
                preds = p;
                succs = s;
            }
        }
    }

    /// Deletes the entry for `key` iff its value matches `expected`.
    pub(crate) fn delete_conditional(&self, key: &K, expected: V, guard: &Guard) -> bool {
        loop {
            let (_, succs) = self.search(key, MAX_LEVEL);
            let target = succs[0];
            if target.is_null()
                || unsafe { (*target).key() } != *key
                || unsafe { (*target).val } != expected
            {
                return false;
            }
            // The bottom-level mark decides the delete.
            let next = unsafe { &*target }.next[0].load(Ordering::Acquire);
            if tag(next) != 0 {
                return false;
            }
            if unsafe { &*target }.next[0]
                .compare_exchange(next, tagged(next, 1), Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            self.mark_upper_levels(target);
            // Physically unlink, then hand the node to the collector.
            self.search(key, unsafe { (*target).height() });
            unsafe { guard.defer_unchecked(move || drop(Box::from_raw(target))) };
            return true;
        }
    }

    fn mark_upper_levels(&self, node: *mut Node<K, V>) {
        for i in (1..unsafe { (*node).height() }).rev() {
            loop {
                let next = unsafe { &*node }.next[i].load(Ordering::Acquire);
                if tag(next) != 0 {
                    break;
                }
                if unsafe { &*node }.next[i]
                    .compare_exchange(next, tagged(next, 1), Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }
            }
        }
    }
}

impl<K, V> Drop for Index<K, V> {
    fn drop(&mut self) {
        unsafe {
            let mut curr = self.head;
            while !curr.is_null() {
                let next = untagged((*curr).next[0].load(Ordering::Relaxed));
                drop(Box::from_raw(curr));
                curr = next;
            }
        }
    }
}

fn random_height() -> usize {
    let mut rng = rand::thread_rng();
    let mut height = 1;
    while height < MAX_LEVEL && rng.gen::<bool>() {
        height += 1;
    }
    height
}

#[cfg(test)]
mod tests {
    use super::Index;
    use crossbeam_epoch as epoch;

    #[test]
    fn conditional_put_get_delete() {
        let guard = &epoch::pin();
        let index: Index<u32, usize> = Index::new(0);
        assert_eq!(index.load_prev(&10, guard), 0);
        assert!(index.put_conditional(10, 0, 1, guard));
        // Duplicate key.
        assert!(!index.put_conditional(10, 0, 2, guard));
        // Strict predecessor: the entry at 10 itself is not its own prev.
        assert_eq!(index.load_prev(&10, guard), 0);
        assert_eq!(index.load_prev(&11, guard), 1);
        assert!(index.put_conditional(20, 1, 2, guard));
        // Wrong expected predecessor value.
        assert!(!index.put_conditional(15, 9, 3, guard));
        assert_eq!(index.load_prev(&25, guard), 2);
        // Value mismatch refuses the delete.
        assert!(!index.delete_conditional(&20, 7, guard));
        assert!(index.delete_conditional(&20, 2, guard));
        assert_eq!(index.load_prev(&25, guard), 1);
        assert!(!index.delete_conditional(&20, 2, guard));
    }

    #[test]
    fn many_entries_stay_ordered() {
        let guard = &epoch::pin();
        let index: Index<u32, usize> = Index::new(usize::MAX);
        let mut prev = usize::MAX;
        for key in (0..200u32).step_by(2) {
            assert!(index.put_conditional(key, prev, key as usize, guard));
            prev = key as usize;
        }
        for key in (0..200u32).step_by(2) {
            assert_eq!(index.load_prev(&(key + 1), guard), key as usize);
        }
        assert_eq!(index.load_prev(&0, guard), usize::MAX);
    }
}
