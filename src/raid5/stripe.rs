// vim: tw=80
//! Stripe slots and the stripe cache.
//!
//! The array owns a fixed pool of stripe slots.  The cache maps a stripe
//! index to a slot, keeps active slots on an MRU-ordered list, and reclaims
//! idle slots from the LRU end when the free list runs dry.  A slot is
//! reclaimable iff its refcount is zero.

use std::{
    collections::{HashMap, VecDeque},
    hash::BuildHasherDefault,
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicU32, AtomicU64, Ordering}
    }
};

use divbuf::DivBufShared;
use futures::channel::oneshot;
use metrohash::MetroHash64;
use tracing::{Level, event};

/// One stripe slot.  Slots live for the lifetime of the array and are
/// rebound to different stripe indices as the cache turns over.
pub(crate) struct Stripe {
    /// The stripe index this slot is currently bound to.  Stable while the
    /// slot is active; rewritten under the cache lock on rebind.
    index: AtomicU64,

    /// In-flight requests touching this stripe.  The slot may be reclaimed
    /// iff this is 0.
    refs: AtomicU32,

    /// FIFO of requests serialized on this stripe.  Only the head has
    /// outstanding child I/O; the others wait for their turn.
    queue: Mutex<TurnQueue>,

    /// Per-child scratch buffers, each strip_size * blocklen bytes, used as
    /// preread targets and for parity/reconstruction math.
    pub bufs: Box<[DivBufShared]>,
}

#[derive(Default)]
struct TurnQueue {
    busy: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

impl Stripe {
    fn new(num_children: usize, chunk_bytes: usize) -> Self {
        let bufs = (0..num_children)
            .map(|_| DivBufShared::from(vec![0u8; chunk_bytes]))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Stripe {
            index: AtomicU64::new(0),
            refs: AtomicU32::new(0),
            queue: Mutex::new(TurnQueue::default()),
            bufs,
        }
    }

    pub fn index(&self) -> u64 {
        self.index.load(Ordering::Relaxed)
    }

    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::SeqCst)
    }

    /// Drop one reference.  The caller must have obtained the slot through
    /// [`StripeCache::get`].
    pub fn release(&self) {
        let old = self.refs.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(old > 0);
    }

    /// Claim a position in the stripe's request FIFO.
    ///
    /// Returns `None` if the queue was idle: the caller is now the head and
    /// may submit immediately.  Otherwise returns a receiver that completes
    /// when all earlier positions have released their turns.
    pub fn enqueue_turn(&self) -> Option<oneshot::Receiver<()>> {
        let mut q = self.queue.lock().unwrap();
        if !q.busy {
            q.busy = true;
            None
        } else {
            let (tx, rx) = oneshot::channel();
            q.waiters.push_back(tx);
            Some(rx)
        }
    }

    /// Release the head position, dispatching the next queued request if
    /// one exists.  Waiters whose tasks have gone away are skipped.
    pub fn release_turn(&self) {
        let mut q = self.queue.lock().unwrap();
        debug_assert!(q.busy);
        loop {
            match q.waiters.pop_front() {
                Some(tx) => {
                    if tx.send(()).is_ok() {
                        return;
                    }
                },
                None => {
                    q.busy = false;
                    return;
                }
            }
        }
    }
}

#[derive(Clone, Copy, Default)]
struct Link {
    /// Toward the next more recently used slot
    mru: Option<usize>,
    /// Toward the next less recently used slot
    lru: Option<usize>,
}

struct Inner {
    /// Maps stripe index -> slot for every active slot
    map: HashMap<u64, usize, BuildHasherDefault<MetroHash64>>,
    /// Active-list links, indexed by slot
    links: Box<[Link]>,
    /// Most recently used active slot
    mru: Option<usize>,
    /// Least recently used active slot
    lru: Option<usize>,
    /// Slots not bound to any stripe
    free: Vec<usize>,
}

/// The stripe cache.
///
/// One lock covers the hash map and both lists; it is held only for O(1)
/// bookkeeping (plus the bounded reclaim walk), never across I/O.
pub(crate) struct StripeCache {
    slots: Box<[Arc<Stripe>]>,
    inner: Mutex<Inner>,
}

impl StripeCache {
    pub fn new(capacity: usize, num_children: usize, chunk_bytes: usize)
        -> Self
    {
        let slots = (0..capacity)
            .map(|_| Arc::new(Stripe::new(num_children, chunk_bytes)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let inner = Inner {
            map: HashMap::with_hasher(BuildHasherDefault::default()),
            links: vec![Link::default(); capacity].into_boxed_slice(),
            mru: None,
            lru: None,
            free: (0..capacity).rev().collect(),
        };
        StripeCache { slots, inner: Mutex::new(inner) }
    }

    /// Number of active (hash-resident) slots
    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    /// Look up or bind a slot for `stripe_index`, taking a reference.
    ///
    /// On a hit the slot moves to the MRU position.  On a miss a free slot
    /// is bound, reclaiming idle slots first if necessary.  Returns `None`
    /// when every slot is referenced; the caller should park on its
    /// channel's retry queue.
    pub fn get(&self, stripe_index: u64) -> Option<Arc<Stripe>> {
        let mut inner = self.inner.lock().unwrap();
        let slot = match inner.map.get(&stripe_index).copied() {
            Some(slot) => {
                Self::unlink(&mut inner, slot);
                slot
            },
            None => {
                let slot = match inner.free.pop() {
                    Some(slot) => slot,
                    None => {
                        self.reclaim(&mut inner);
                        inner.free.pop()?
                    }
                };
                self.slots[slot].index.store(stripe_index,
                                             Ordering::Relaxed);
                inner.map.insert(stripe_index, slot);
                slot
            }
        };
        Self::push_mru(&mut inner, slot);
        self.slots[slot].refs.fetch_add(1, Ordering::SeqCst);
        Some(self.slots[slot].clone())
    }

    /// Move idle slots from the LRU end of the active list to the free
    /// list.  Frees at most `capacity / 8` slots, keeping the cache about
    /// 7/8 full after a miss storm.
    fn reclaim(&self, inner: &mut Inner) {
        let goal = std::cmp::max(self.slots.len() / 8, 1);
        let mut freed = 0;
        let mut cursor = inner.lru;
        while let Some(slot) = cursor {
            if freed >= goal {
                break;
            }
            cursor = inner.links[slot].mru;
            if self.slots[slot].refs() != 0 {
                continue;
            }
            Self::unlink(inner, slot);
            let index = self.slots[slot].index();
            let removed = inner.map.remove(&index);
            debug_assert_eq!(removed, Some(slot));
            inner.free.push(slot);
            freed += 1;
        }
        event!(Level::DEBUG, freed, "stripe_cache_reclaim");
    }

    fn unlink(inner: &mut Inner, slot: usize) {
        let link = inner.links[slot];
        match link.mru {
            Some(m) => inner.links[m].lru = link.lru,
            None => {
                debug_assert_eq!(inner.mru, Some(slot));
                inner.mru = link.lru;
            }
        }
        match link.lru {
            Some(l) => inner.links[l].mru = link.mru,
            None => {
                debug_assert_eq!(inner.lru, Some(slot));
                inner.lru = link.mru;
            }
        }
        inner.links[slot] = Link::default();
    }

    fn push_mru(inner: &mut Inner, slot: usize) {
        inner.links[slot] = Link { mru: None, lru: inner.mru };
        if let Some(old) = inner.mru {
            inner.links[old].mru = Some(slot);
        }
        inner.mru = Some(slot);
        if inner.lru.is_none() {
            inner.lru = Some(slot);
        }
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
use futures::FutureExt;
use pretty_assertions::assert_eq;
use super::*;

fn cache(capacity: usize) -> StripeCache {
    StripeCache::new(capacity, 3, 4096)
}

#[test]
fn get_miss_binds_slot() {
    let c = cache(4);
    let s = c.get(7).unwrap();
    assert_eq!(s.index(), 7);
    assert_eq!(s.refs(), 1);
    assert_eq!(c.active_count(), 1);
}

#[test]
fn get_hit_takes_another_ref() {
    let c = cache(4);
    let a = c.get(7).unwrap();
    let b = c.get(7).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.refs(), 2);
    assert_eq!(c.active_count(), 1);
}

#[test]
fn exhaustion_returns_none() {
    let c = cache(2);
    let _a = c.get(0).unwrap();
    let _b = c.get(1).unwrap();
    assert!(c.get(2).is_none());
}

#[test]
fn release_makes_reclaimable() {
    let c = cache(2);
    let a = c.get(0).unwrap();
    let _b = c.get(1).unwrap();
    a.release();
    assert_eq!(a.refs(), 0);
    // Slot 0 is idle, so a new index can now take its place
    let d = c.get(2).unwrap();
    assert_eq!(d.index(), 2);
    assert_eq!(c.active_count(), 2);
}

#[test]
fn reclaim_takes_lru_first() {
    let c = cache(3);
    let a = c.get(10).unwrap();
    let b = c.get(11).unwrap();
    let d = c.get(12).unwrap();
    a.release();
    b.release();
    d.release();
    // Touch 10, making 11 the LRU
    let a2 = c.get(10).unwrap();
    a2.release();
    // One new bind forces a reclaim of at most ceil(3/8) = 1 slot: index 11
    let e = c.get(13).unwrap();
    assert_eq!(e.index(), 13);
    // 11 is gone from the cache; 10 and 12 are still hits
    assert_eq!(c.active_count(), 3);
    let a3 = c.get(10).unwrap();
    let d2 = c.get(12).unwrap();
    assert!(Arc::ptr_eq(&a2, &a3));
    assert!(Arc::ptr_eq(&d, &d2));
    assert_eq!(c.active_count(), 3);
}

#[test]
fn reclaim_skips_referenced() {
    let c = cache(2);
    let a = c.get(0).unwrap();
    let b = c.get(1).unwrap();
    b.release();
    // Slot for index 1 is idle, slot for 0 is not
    let d = c.get(2).unwrap();
    assert_eq!(d.index(), 2);
    assert_eq!(a.index(), 0);
    assert_eq!(a.refs(), 1);
}

#[test]
fn capacity_bound() {
    let c = cache(4);
    let held = (0..4).map(|i| c.get(i).unwrap()).collect::<Vec<_>>();
    assert_eq!(c.active_count(), 4);
    assert!(c.get(99).is_none());
    assert_eq!(c.active_count(), 4);
    drop(held);
}

#[test]
fn turn_queue_fifo() {
    let c = cache(1);
    let s = c.get(0).unwrap();
    assert!(s.enqueue_turn().is_none());
    let mut rx1 = s.enqueue_turn().unwrap();
    let mut rx2 = s.enqueue_turn().unwrap();
    assert!(rx1.try_recv().unwrap().is_none());
    s.release_turn();
    assert!(rx1.now_or_never().unwrap().is_ok());
    assert!(rx2.try_recv().unwrap().is_none());
    s.release_turn();
    assert!(rx2.now_or_never().unwrap().is_ok());
    s.release_turn();
    // Queue is idle again
    assert!(s.enqueue_turn().is_none());
    s.release_turn();
}

#[test]
fn turn_queue_skips_dead_waiters() {
    let c = cache(1);
    let s = c.get(0).unwrap();
    assert!(s.enqueue_turn().is_none());
    let rx1 = s.enqueue_turn().unwrap();
    let rx2 = s.enqueue_turn().unwrap();
    drop(rx1);
    s.release_turn();
    assert!(rx2.now_or_never().unwrap().is_ok());
    s.release_turn();
}

}
// LCOV_EXCL_STOP
