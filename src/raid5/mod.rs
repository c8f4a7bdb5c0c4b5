// vim: tw=80
//! RAID-5 stripe execution engine.
//!
//! [`Raid5`] presents N >= 3 child block devices as one virtual device of
//! `strip_size * (N - 1)` data blocks per stripe, maintaining rotating XOR
//! parity.  Host reads and writes are split at stripe boundaries, bound to
//! cached stripe slots, serialized per stripe, and executed as chunked
//! child I/O.  One missing child is tolerated: reads reconstruct its data
//! from the survivors and writes keep parity consistent without it.

use std::{
    cmp,
    num::NonZeroUsize,
    sync::Arc
};

use futures::stream::FuturesUnordered;
use itertools::multizip;
use uuid::Uuid;

use crate::{
    bdev::{BaseBdev, BaseBdevInfo, BoxBdevFut},
    types::*,
    util::*,
};

mod channel;
mod geometry;
mod request;
mod sg;
mod stripe;
mod xor;

pub use self::channel::Raid5Channel;

use self::{
    geometry::Geometry,
    request::{PooledRequest, RequestPool, SubCmd, drain_all},
    sg::{SGCursorMut, slice_sglist},
    stripe::{Stripe, StripeCache},
};

/// Fewest children that can form an array
pub const BASE_BDEVS_MIN: usize = 3;

/// How many children may be degraded before the array fails requests
pub const BASE_BDEVS_MAX_DEGRADED: usize = 1;

/// Default number of stripe slots in the cache
pub const RAID_MAX_STRIPES: usize = 1024;

/// A host I/O command
pub enum IoCmd {
    /// Read into the given buffers
    Read(SGListMut),
    /// Write the given data
    Write(SGList),
}

/// A RAID-5 array
pub struct Raid5 {
    pub(crate) geom: Geometry,
    pub(crate) children: Box<[BaseBdevInfo]>,
    cache: StripeCache,
    pool: RequestPool,
    uuid: Uuid,
}

impl std::fmt::Debug for Raid5 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Raid5")
            .field("geom", &self.geom)
            .field("uuid", &self.uuid)
            .finish_non_exhaustive()
    }
}

/// Holds one reference on a stripe slot.  Dropping it releases the
/// reference and then lets one parked request on the channel retry, in
/// that order, so the retrier can claim the newly-idle slot.
struct StripeRefGuard {
    stripe: Arc<Stripe>,
    ch: Arc<Raid5Channel>,
}

impl Drop for StripeRefGuard {
    fn drop(&mut self) {
        self.stripe.release();
        self.ch.retry_one();
    }
}

/// Holds the head position of a stripe's request FIFO.  Dropping it
/// dispatches the next queued request.
struct TurnGuard<'a>(&'a Stripe);

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        self.0.release_turn();
    }
}

impl Raid5 {
    /// Assemble an array from its children.
    ///
    /// * `children`:       The child block devices.  At least
    ///                     [`BASE_BDEVS_MIN`], at most 255, all with the
    ///                     same block length.
    /// * `strip_size`:     Blocks per child per stripe.  Must be a power
    ///                     of two.
    /// * `max_stripes`:    Stripe cache capacity, if not
    ///                     [`RAID_MAX_STRIPES`].
    pub fn create(children: Vec<Arc<dyn BaseBdev>>, strip_size: BlockT,
        max_stripes: Option<NonZeroUsize>) -> Result<Arc<Self>>
    {
        let n = children.len();
        if !(BASE_BDEVS_MIN..=u8::MAX as usize).contains(&n) {
            return Err(Error::EINVAL);
        }
        let blocklen = children[0].block_len();
        if children.iter().any(|c| c.block_len() != blocklen) {
            return Err(Error::EINVAL);
        }
        let min_blocks = children.iter()
            .map(|c| c.block_count())
            .min()
            .unwrap();
        let geom = Geometry::new(n, strip_size, blocklen as usize,
                                 min_blocks)?;
        let max_stripes = max_stripes.map(NonZeroUsize::get)
            .unwrap_or(RAID_MAX_STRIPES);
        let cache = StripeCache::new(max_stripes, n,
                                     geom.bytes(geom.strip_size));
        let pool = RequestPool::new(4 * max_stripes, n);
        let children = children.into_iter()
            .map(BaseBdevInfo::new)
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Arc::new(Raid5 {
            geom,
            children,
            cache,
            pool,
            uuid: Uuid::new_v4(),
        }))
    }

    /// Size of the virtual device in blocks
    pub fn block_count(&self) -> BlockT {
        self.geom.stripe_blocks * self.geom.total_stripes
    }

    /// Host I/O split at multiples of this boundary never spans stripes
    pub fn optimal_io_boundary(&self) -> BlockT {
        self.geom.stripe_blocks
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Flag a child as missing, or bring it back
    pub fn set_degraded(&self, child: usize, degraded: bool) {
        self.children[child].set_degraded(degraded);
    }

    /// Initialize the resource for one I/O channel.  Each channel of the
    /// embedding framework should hold its own.
    pub fn channel(self: &Arc<Self>) -> Arc<Raid5Channel> {
        Arc::new(Raid5Channel::new())
    }

    /// Number of stripe slots currently bound
    #[doc(hidden)]
    pub fn active_stripes(&self) -> usize {
        self.cache.active_count()
    }

    /// Entry point for host reads and writes.
    ///
    /// The returned future resolves when every part of the host I/O has
    /// completed.  Momentary stripe-cache or request-pool exhaustion is
    /// handled internally by parking on the channel's retry queue.
    pub fn submit_rw_request(self: &Arc<Self>, ch: &Arc<Raid5Channel>,
        cmd: IoCmd, offset_blocks: BlockT) -> BoxBdevFut
    {
        let this = self.clone();
        let ch = ch.clone();
        Box::pin(async move {
            let g = this.geom;
            let total_bytes = match &cmd {
                IoCmd::Read(bufs) => sglist_len(bufs),
                IoCmd::Write(bufs) => sglist_len(bufs),
            };
            if total_bytes % g.blocklen != 0 {
                return Err(Error::EINVAL);
            }
            let num_blocks = (total_bytes / g.blocklen) as BlockT;
            if offset_blocks + num_blocks > this.block_count() {
                return Err(Error::EINVAL);
            }
            if num_blocks == 0 {
                return Ok(());
            }
            match cmd {
                IoCmd::Write(data) => {
                    let futs = FuturesUnordered::new();
                    let mut off = offset_blocks;
                    let mut remaining = num_blocks;
                    let mut byte_off = 0;
                    while remaining > 0 {
                        let (stripe_index, stripe_offset) = g.stripe_of(off);
                        let blocks = cmp::min(
                            g.stripe_blocks - stripe_offset, remaining);
                        let part = slice_sglist(&data, byte_off,
                                                g.bytes(blocks))?;
                        byte_off += g.bytes(blocks);
                        futs.push(this.clone().write_part(ch.clone(),
                            stripe_index, stripe_offset, blocks, part));
                        off += blocks;
                        remaining -= blocks;
                    }
                    drain_all(futs).await
                },
                IoCmd::Read(dest) => {
                    let mut cursor = SGCursorMut::from(dest);
                    let futs = FuturesUnordered::new();
                    let mut off = offset_blocks;
                    let mut remaining = num_blocks;
                    while remaining > 0 {
                        let (stripe_index, stripe_offset) = g.stripe_of(off);
                        let blocks = cmp::min(
                            g.stripe_blocks - stripe_offset, remaining);
                        let part_dest = cursor.take(g.bytes(blocks))?;
                        futs.push(this.clone().read_part(ch.clone(),
                            stripe_index, stripe_offset, blocks,
                            part_dest));
                        off += blocks;
                        remaining -= blocks;
                    }
                    debug_assert!(cursor.is_empty());
                    drain_all(futs).await
                },
            }
        })
    }

    /// Handle the portion of a write that falls within one stripe
    async fn write_part(self: Arc<Self>, ch: Arc<Raid5Channel>,
        stripe_index: BlockT, stripe_offset: BlockT, blocks: BlockT,
        data: SGList) -> Result<()>
    {
        let g = self.geom;
        // A short write that crosses a strip boundary would need a
        // non-contiguous parity update.  Split it in two.
        let mut subs = Vec::with_capacity(2);
        if blocks < g.strip_size {
            let limit = g.strip_size - (stripe_offset % g.strip_size);
            if blocks > limit {
                subs.push((stripe_offset, limit, 0));
                subs.push((stripe_offset + limit, blocks - limit,
                           g.bytes(limit)));
            }
        }
        if subs.is_empty() {
            subs.push((stripe_offset, blocks, 0));
        }

        let stripe = self.get_stripe(&ch, stripe_index).await;
        let _stripe_ref = StripeRefGuard {
            stripe: stripe.clone(),
            ch: ch.clone(),
        };
        let mut reqs = Vec::with_capacity(subs.len());
        for _ in &subs {
            reqs.push(self.get_request(&ch).await);
        }
        // Claim FIFO positions for both halves back to back, so a
        // competing request cannot execute in between them.
        let turns = subs.iter()
            .map(|_| stripe.enqueue_turn())
            .collect::<Vec<_>>();
        let mut status = Ok(());
        for ((sub, mut req), turn) in
            subs.into_iter().zip(reqs).zip(turns)
        {
            let (sub_off, sub_blocks, sub_byte_off) = sub;
            if let Some(rx) = turn {
                let _ = rx.await;
            }
            let _turn = TurnGuard(&stripe);
            self.plan_request(&mut req, stripe_index, sub_off, sub_blocks);
            let r = match slice_sglist(&data, sub_byte_off,
                                       g.bytes(sub_blocks))
            {
                Ok(sub_data) => {
                    self.execute_stripe_request(&stripe, &mut req,
                        SubCmd::Write(sub_data)).await
                },
                Err(e) => Err(e),
            };
            if r.is_err() && status.is_ok() {
                status = r;
            }
        }
        status
    }

    /// Handle the portion of a read that falls within one stripe
    async fn read_part(self: Arc<Self>, ch: Arc<Raid5Channel>,
        stripe_index: BlockT, stripe_offset: BlockT, blocks: BlockT,
        dest: SGListMut) -> Result<()>
    {
        let stripe = self.get_stripe(&ch, stripe_index).await;
        let _stripe_ref = StripeRefGuard {
            stripe: stripe.clone(),
            ch: ch.clone(),
        };
        let mut req = self.get_request(&ch).await;
        if let Some(rx) = stripe.enqueue_turn() {
            let _ = rx.await;
        }
        let _turn = TurnGuard(&stripe);
        self.plan_request(&mut req, stripe_index, stripe_offset, blocks);
        self.execute_stripe_request(&stripe, &mut req, SubCmd::Read(dest))
            .await
    }

    /// Acquire a stripe slot, parking on the channel's retry queue when
    /// the cache is exhausted
    async fn get_stripe(&self, ch: &Raid5Channel, stripe_index: BlockT)
        -> Arc<Stripe>
    {
        loop {
            if let Some(stripe) = self.cache.get(stripe_index) {
                return stripe;
            }
            let rx = ch.park();
            // A completion may have released slots between the failed
            // lookup and the park; the parked entry is skipped harmlessly.
            if let Some(stripe) = self.cache.get(stripe_index) {
                return stripe;
            }
            let _ = rx.await;
        }
    }

    /// Acquire a pooled request, parking like `get_stripe`
    async fn get_request(&self, ch: &Raid5Channel) -> PooledRequest<'_> {
        loop {
            if let Some(req) = self.pool.get() {
                return req;
            }
            let rx = ch.park();
            if let Some(req) = self.pool.get() {
                return req;
            }
            let _ = rx.await;
        }
    }

    /// Fast-path read: plain reads issued straight to the children,
    /// bypassing the stripe cache and request pool.
    ///
    /// Behavior is equivalent to [`Self::submit_rw_request`] with
    /// [`IoCmd::Read`] on a healthy array; there is no reconstruction, so
    /// it must not be used while any child is degraded.  It is not
    /// currently wired into the submission path.
    pub fn handle_read(self: &Arc<Self>, ch: &Arc<Raid5Channel>,
        dest: SGListMut, offset_blocks: BlockT) -> BoxBdevFut
    {
        let this = self.clone();
        let ch = ch.clone();
        Box::pin(async move {
            let g = this.geom;
            let total_bytes = sglist_len(&dest);
            if total_bytes % g.blocklen != 0 {
                return Err(Error::EINVAL);
            }
            let num_blocks = (total_bytes / g.blocklen) as BlockT;
            if offset_blocks + num_blocks > this.block_count() {
                return Err(Error::EINVAL);
            }
            if num_blocks == 0 {
                return Ok(());
            }
            let mut cursor = SGCursorMut::from(dest);
            let futs = FuturesUnordered::new();
            let mut off = offset_blocks;
            let mut remaining = num_blocks;
            while remaining > 0 {
                let (stripe_index, stripe_offset) = g.stripe_of(off);
                let blocks = cmp::min(g.stripe_blocks - stripe_offset,
                                      remaining);
                let parity = g.parity_child(stripe_index);
                let base = g.child_base(stripe_index);
                let (first_di, last_di) =
                    g.data_chunk_range(stripe_offset, blocks);
                let mut targets = Vec::with_capacity(last_di - first_di + 1);
                let mut offsets = Vec::with_capacity(targets.capacity());
                let mut counts = Vec::with_capacity(targets.capacity());
                for di in first_di..=last_di {
                    let (c_off, c_blocks) =
                        g.chunk_slice(stripe_offset, blocks, di);
                    targets.push(g.data_child(parity, di));
                    offsets.push(base + c_off);
                    counts.push(c_blocks);
                }
                for (child, child_off, c_blocks) in
                    multizip((targets, offsets, counts))
                {
                    let mut w = ch.take_wrapper();
                    let bufs = cursor.take(g.bytes(c_blocks))?;
                    w.dbis.extend(
                        bufs.iter().map(IoVecMut::clone_inaccessible));
                    let bdev = this.children[child].bdev.clone();
                    let ch2 = ch.clone();
                    futs.push(async move {
                        let mut first = Some(bufs);
                        let r = loop {
                            let b = match first.take() {
                                Some(b) => b,
                                None => w.dbis.iter()
                                    .map(|dbi| dbi.try_mut().unwrap())
                                    .collect(),
                            };
                            match bdev.readv_blocks(b, child_off, c_blocks)
                                .await
                            {
                                Err(Error::ENOMEM) => continue,
                                r => break r,
                            }
                        };
                        ch2.return_wrapper(w);
                        r
                    });
                }
                off += blocks;
                remaining -= blocks;
            }
            debug_assert!(cursor.is_empty());
            drain_all(futs).await
        })
    }
}

// LCOV_EXCL_STOP
