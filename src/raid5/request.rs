// vim: tw=80
//! Stripe requests: planning and execution.
//!
//! A stripe request covers the portion of one host I/O that falls within a
//! single stripe.  Planning computes each chunk's request and preread
//! slices; execution fans the resulting child I/Os out, runs the parity
//! math inline when they complete, and fans out the writes.
//!
//! The write planner picks between two strategies by vote.  Read-modify-
//! write prereads the touched data chunks and parity, then computes
//! `new_parity = old_parity ^ old_data ^ new_data`.  Reconstruction write
//! prereads the untouched data instead and computes parity from scratch.
//! A fully-overwritten stripe needs no preread at all.

use std::{
    cmp,
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex}
};

use divbuf::DivBufInaccessible;
use fixedbitset::FixedBitSet;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tracing::{Level, event};

use crate::{
    bdev::{BaseBdev, BoxBdevFut},
    types::*,
};
use super::{
    BASE_BDEVS_MAX_DEGRADED,
    Raid5,
    sg::{
        SGCursorMut,
        copy_sglists,
        slice_sglist,
        xor_sglists,
        zero_sglists
    },
    stripe::Stripe,
};

/// One child's share of a stripe request
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Chunk {
    /// Child index
    pub index: usize,

    /// The slice of this chunk that the host request addresses, as an
    /// offset from the chunk start and a block count.  Both 0 if the host
    /// request does not touch this chunk.
    pub req_offset: BlockT,
    pub req_blocks: BlockT,

    /// The slice to pre-read for the selected strategy.  Both 0 if no
    /// preread is needed.
    pub preread_offset: BlockT,
    pub preread_blocks: BlockT,
}

/// The in-memory state of one stripe-request
pub(crate) struct StripeRequest {
    /// One entry per child
    pub chunks: Vec<Chunk>,

    /// Child index of the first data chunk the request touches
    pub first_data: usize,

    /// Child index of the last data chunk the request touches
    pub last_data: usize,

    /// Child index of the stripe's parity chunk
    pub parity: usize,

    /// Child index of the degraded chunk, if any child in this stripe is
    /// degraded
    pub degraded: Option<usize>,
}

impl StripeRequest {
    fn new(num_children: usize) -> Self {
        StripeRequest {
            chunks: Vec::with_capacity(num_children),
            first_data: 0,
            last_data: 0,
            parity: 0,
            degraded: None,
        }
    }
}

/// Fixed pool of stripe requests.
///
/// Each pooled request reserves capacity for one chunk per child up front,
/// so steady-state operation does not allocate per request.
pub(crate) struct RequestPool {
    free: Mutex<Vec<Box<StripeRequest>>>,
}

impl RequestPool {
    pub fn new(count: usize, num_children: usize) -> Self {
        let free = (0..count)
            .map(|_| Box::new(StripeRequest::new(num_children)))
            .collect();
        RequestPool { free: Mutex::new(free) }
    }

    /// Take a request from the pool.  Returns `None` when the pool is
    /// exhausted; the caller should park on its channel's retry queue.
    pub fn get(&self) -> Option<PooledRequest<'_>> {
        self.free.lock().unwrap().pop()
            .map(|req| PooledRequest { pool: self, req: Some(req) })
    }

    fn put(&self, mut req: Box<StripeRequest>) {
        req.chunks.clear();
        req.degraded = None;
        self.free.lock().unwrap().push(req);
    }
}

/// RAII handle for a pooled request
pub(crate) struct PooledRequest<'a> {
    pool: &'a RequestPool,
    req: Option<Box<StripeRequest>>,
}

impl Deref for PooledRequest<'_> {
    type Target = StripeRequest;
    fn deref(&self) -> &StripeRequest {
        self.req.as_ref().unwrap()
    }
}

impl DerefMut for PooledRequest<'_> {
    fn deref_mut(&mut self) -> &mut StripeRequest {
        self.req.as_mut().unwrap()
    }
}

impl Drop for PooledRequest<'_> {
    fn drop(&mut self) {
        self.pool.put(self.req.take().unwrap());
    }
}

/// The portion of a host I/O handled by one stripe request
pub(crate) enum SubCmd {
    Read(SGListMut),
    Write(SGList),
}

/// A planned child write: chunk-relative offset plus the data to write
struct ChunkWrite {
    child: usize,
    offset: BlockT,
    blocks: BlockT,
    data: SGList,
}

/// Await every future, latching the first error but letting the rest
/// finish, so no child I/O is still outstanding when the status is
/// reported.
pub(crate) async fn drain_all<F>(mut futs: FuturesUnordered<F>) -> Result<()>
    where F: futures::Future<Output = Result<()>>
{
    let mut status = Ok(());
    while let Some(r) = futs.next().await {
        if let Err(e) = r {
            if status.is_ok() {
                event!(Level::WARN, error = ?e, "chunk request failed");
                status = Err(e);
            }
        }
    }
    status
}

/// Read into a stripe's scratch buffer for one child.  A child that is
/// momentarily out of resources is retried.
async fn scratch_read(bdev: Arc<dyn BaseBdev>, stripe: Arc<Stripe>,
    child: usize, len: usize, offset_blocks: BlockT, num_blocks: BlockT)
    -> Result<()>
{
    loop {
        // This request is the head of the stripe's queue, so it has
        // exclusive use of the scratch buffers.
        let buf = stripe.bufs[child].try_mut().unwrap().split_to(len);
        match bdev.readv_blocks(vec![buf], offset_blocks, num_blocks).await {
            Err(Error::ENOMEM) => continue,
            r => break r,
        }
    }
}

/// Read into host memory, re-acquiring the buffers through their
/// inaccessible handles on each attempt.
async fn host_read(bdev: Arc<dyn BaseBdev>, dbis: Vec<DivBufInaccessible>,
    offset_blocks: BlockT, num_blocks: BlockT) -> Result<()>
{
    loop {
        let bufs = dbis.iter()
            .map(|dbi| dbi.try_mut().unwrap())
            .collect::<SGListMut>();
        match bdev.readv_blocks(bufs, offset_blocks, num_blocks).await {
            Err(Error::ENOMEM) => continue,
            r => break r,
        }
    }
}

async fn chunk_write(bdev: Arc<dyn BaseBdev>, data: SGList,
    offset_blocks: BlockT, num_blocks: BlockT) -> Result<()>
{
    loop {
        match bdev.writev_blocks(data.clone(), offset_blocks, num_blocks)
            .await
        {
            Err(Error::ENOMEM) => continue,
            r => break r,
        }
    }
}

/// Per-chunk read strategy for a reconstruction read
enum ReadPlan {
    /// Preread into scratch; the chunk itself was not requested
    Scratch,
    /// The degraded chunk: its host buffers are the reconstruction target
    Degraded(Vec<DivBufInaccessible>),
    /// Read straight into the host buffers; the chunk's slice covers the
    /// degraded chunk's slice
    Direct(Vec<DivBufInaccessible>),
    /// Preread a widened span into scratch; the host subrange is copied
    /// out after reconstruction
    Widened(Vec<DivBufInaccessible>),
}

impl Raid5 {
    /// Compute the per-chunk request slices for a stripe-relative range
    pub(crate) fn plan_request(&self, req: &mut StripeRequest,
        stripe_index: BlockT, stripe_offset: BlockT, blocks: BlockT)
    {
        let g = &self.geom;
        let parity = g.parity_child(stripe_index);
        let (first_di, last_di) = g.data_chunk_range(stripe_offset, blocks);
        let first_data = g.data_child(parity, first_di);
        let last_data = g.data_child(parity, last_di);
        req.chunks.clear();
        for c in 0..g.num_children {
            let (req_offset, req_blocks) =
                if c == parity || c < first_data || c > last_data {
                    (0, 0)
                } else {
                    g.chunk_slice(stripe_offset, blocks,
                                  g.data_index(parity, c))
                };
            req.chunks.push(Chunk {
                index: c,
                req_offset,
                req_blocks,
                preread_offset: 0,
                preread_blocks: 0,
            });
        }
        req.first_data = first_data;
        req.last_data = last_data;
        req.parity = parity;
        req.degraded = None;
    }

    /// Record the degraded chunk, if any.  More than
    /// `BASE_BDEVS_MAX_DEGRADED` degraded children fails the request.
    fn check_degraded(&self, req: &mut StripeRequest) -> Result<()> {
        let mut degraded = FixedBitSet::with_capacity(self.geom.num_children);
        for (i, info) in self.children.iter().enumerate() {
            if info.is_degraded() {
                degraded.insert(i);
            }
        }
        if degraded.count_ones(..) > BASE_BDEVS_MAX_DEGRADED {
            event!(Level::WARN, "too many degraded children");
            return Err(Error::EIO);
        }
        req.degraded = degraded.ones().next();
        Ok(())
    }

    /// Execute one stripe request.  The caller must hold the head position
    /// of the stripe's request FIFO.
    pub(crate) async fn execute_stripe_request(&self, stripe: &Arc<Stripe>,
        req: &mut StripeRequest, cmd: SubCmd) -> Result<()>
    {
        self.check_degraded(req)?;
        match cmd {
            SubCmd::Read(dest) => self.stripe_read(stripe, req, dest).await,
            SubCmd::Write(data) => self.stripe_write(stripe, req, data).await,
        }
    }

    fn preread_chunks(&self, stripe: &Arc<Stripe>, req: &StripeRequest)
        -> impl futures::Future<Output = Result<()>>
    {
        let base = self.geom.child_base(stripe.index());
        let futs = FuturesUnordered::new();
        for chunk in req.chunks.iter().filter(|c| c.preread_blocks > 0) {
            futs.push(Box::pin(scratch_read(
                self.children[chunk.index].bdev.clone(),
                stripe.clone(),
                chunk.index,
                self.geom.bytes(chunk.preread_blocks),
                base + chunk.preread_offset,
                chunk.preread_blocks)) as BoxBdevFut);
        }
        drain_all(futs)
    }

    fn submit_writes(&self, stripe: &Arc<Stripe>, writes: Vec<ChunkWrite>)
        -> impl futures::Future<Output = Result<()>>
    {
        let base = self.geom.child_base(stripe.index());
        let futs = FuturesUnordered::new();
        for w in writes {
            futs.push(Box::pin(chunk_write(
                self.children[w.child].bdev.clone(),
                w.data,
                base + w.offset,
                w.blocks)) as BoxBdevFut);
        }
        drain_all(futs)
    }

    async fn stripe_write(&self, stripe: &Arc<Stripe>,
        req: &mut StripeRequest, data: SGList) -> Result<()>
    {
        if req.degraded.is_some() {
            return self.degraded_write(stripe, req, data).await;
        }
        let g = &self.geom;
        let p = req.parity;

        // A single touched chunk updates just its slice of parity; more
        // than one updates the whole strip.
        let (p_off, p_blocks) = if req.first_data == req.last_data {
            (req.chunks[req.first_data].req_offset,
             req.chunks[req.first_data].req_blocks)
        } else {
            (0, g.strip_size)
        };
        req.chunks[p].req_offset = p_off;
        req.chunks[p].req_blocks = p_blocks;

        // The vote: chunks whose old data reconstruction-write would have
        // to read count for RMW; chunks whose new data we already have
        // count against it.
        let mut preread_balance = 0i32;
        for c in g.data_children(p) {
            if req.chunks[c].req_blocks < p_blocks {
                preread_balance += 1;
            }
            if req.chunks[c].req_blocks > 0 {
                preread_balance -= 1;
            }
        }
        let rmw = preread_balance > 0;

        for ci in 0..g.num_children {
            let (c_off, c_blocks) =
                (req.chunks[ci].req_offset, req.chunks[ci].req_blocks);
            let (off, blocks) = if rmw {
                // Preread exactly what will be rewritten
                (c_off, c_blocks)
            } else if ci == p {
                // Reconstruction write never reads old parity
                (0, 0)
            } else if req.first_data == req.last_data {
                if c_blocks > 0 {
                    (0, 0)
                } else {
                    (p_off, p_blocks)
                }
            } else if c_off > 0 {
                (0, c_off)
            } else {
                (c_blocks, g.strip_size - c_blocks)
            };
            req.chunks[ci].preread_offset = off;
            req.chunks[ci].preread_blocks = blocks;
        }

        self.preread_chunks(stripe, req).await?;

        let writes = if rmw {
            self.compute_parity_rmw(stripe, req, &data)?
        } else {
            self.compute_parity_rcw(stripe, req, &data, None)?
        };
        self.submit_writes(stripe, writes).await
    }

    async fn degraded_write(&self, stripe: &Arc<Stripe>,
        req: &mut StripeRequest, data: SGList) -> Result<()>
    {
        let g = &self.geom;
        let p = req.parity;
        let d = req.degraded.unwrap();

        if d == p {
            // The parity chunk itself is missing: write the touched data
            // chunks and skip parity entirely.
            let mut writes = Vec::new();
            let mut iov_off = 0;
            for c in g.data_children(p) {
                let chunk = &req.chunks[c];
                if chunk.req_blocks == 0 {
                    continue;
                }
                let len = g.bytes(chunk.req_blocks);
                let newdata = slice_sglist(&data, iov_off, len)?;
                iov_off += len;
                writes.push(ChunkWrite {
                    child: c,
                    offset: chunk.req_offset,
                    blocks: chunk.req_blocks,
                    data: newdata,
                });
            }
            return self.submit_writes(stripe, writes).await;
        }

        let (p_off, p_blocks) = if req.first_data == req.last_data {
            (req.chunks[req.first_data].req_offset,
             req.chunks[req.first_data].req_blocks)
        } else {
            (0, g.strip_size)
        };
        req.chunks[p].req_offset = p_off;
        req.chunks[p].req_blocks = p_blocks;

        let d_off = req.chunks[d].req_offset;
        let d_blocks = req.chunks[d].req_blocks;
        let d_full = d_off == 0 && d_blocks == g.strip_size;

        for ci in 0..g.num_children {
            if ci == d {
                req.chunks[ci].preread_offset = 0;
                req.chunks[ci].preread_blocks = 0;
                continue;
            }
            let (c_off, c_blocks) =
                (req.chunks[ci].req_offset, req.chunks[ci].req_blocks);
            let (off, blocks) = if d_blocks == 0 {
                // The degraded chunk is untouched: plain RMW against the
                // surviving chunks.
                (c_off, c_blocks)
            } else if req.first_data == req.last_data {
                // Only the degraded chunk is touched: every survivor
                // prereads the parity window.
                if ci == p {
                    (0, 0)
                } else {
                    (p_off, p_blocks)
                }
            } else if d_full {
                // The degraded chunk is fully overwritten: survivors fill
                // in the untouched parts of the parity window.
                if ci == p {
                    (0, 0)
                } else if c_off > 0 {
                    (0, c_off)
                } else {
                    (c_blocks, g.strip_size - c_blocks)
                }
            } else {
                // The degraded chunk is partially touched: its old
                // contents must be reconstructed over the complement of
                // its touched slice.
                let complement = if d_off > 0 {
                    (0, d_off)
                } else {
                    (d_blocks, g.strip_size - d_blocks)
                };
                if ci == p {
                    complement
                } else if ci == req.first_data || ci == req.last_data ||
                    c_blocks == 0
                {
                    (0, g.strip_size)
                } else {
                    complement
                }
            };
            req.chunks[ci].preread_offset = off;
            req.chunks[ci].preread_blocks = blocks;
        }

        self.preread_chunks(stripe, req).await?;

        let writes = if d_blocks > 0 {
            if req.chunks[p].preread_blocks > 0 {
                self.compute_parity_degraded(stripe, req, &data)?
            } else {
                self.compute_parity_rcw(stripe, req, &data, Some(d))?
            }
        } else {
            self.compute_parity_rmw(stripe, req, &data)?
        };
        self.submit_writes(stripe, writes).await
    }

    /// RMW parity phase: XOR each touched chunk's old and new data into
    /// the preread parity, then write the new data and parity.
    fn compute_parity_rmw(&self, stripe: &Arc<Stripe>, req: &StripeRequest,
        data: &SGList) -> Result<Vec<ChunkWrite>>
    {
        let g = &self.geom;
        let p = req.parity;
        let p_off = req.chunks[p].req_offset;
        let p_len = g.bytes(req.chunks[p].req_blocks);
        let mut writes = Vec::new();
        let mut iov_off = 0;
        {
            let mut pbuf = stripe.bufs[p].try_mut().unwrap().split_to(p_len);
            for c in g.data_children(p) {
                let chunk = &req.chunks[c];
                if chunk.req_blocks == 0 {
                    continue;
                }
                let len = g.bytes(chunk.req_blocks);
                let dest_off = g.bytes(chunk.req_offset - p_off);
                let old = vec![
                    stripe.bufs[c].try_const().unwrap().slice_to(len)
                ];
                xor_sglists(std::slice::from_mut(&mut pbuf), dest_off,
                            &old, 0, len);
                let newdata = slice_sglist(data, iov_off, len)?;
                iov_off += len;
                xor_sglists(std::slice::from_mut(&mut pbuf), dest_off,
                            &newdata, 0, len);
                writes.push(ChunkWrite {
                    child: c,
                    offset: chunk.req_offset,
                    blocks: chunk.req_blocks,
                    data: newdata,
                });
            }
        }
        writes.push(ChunkWrite {
            child: p,
            offset: p_off,
            blocks: req.chunks[p].req_blocks,
            data: vec![stripe.bufs[p].try_const().unwrap().slice_to(p_len)],
        });
        Ok(writes)
    }

    /// Reconstruction-write parity phase: zero the parity buffer, then XOR
    /// in every data chunk, preread or new.  `skip_write` names a degraded
    /// chunk whose new data contributes to parity but is not written.
    fn compute_parity_rcw(&self, stripe: &Arc<Stripe>, req: &StripeRequest,
        data: &SGList, skip_write: Option<usize>) -> Result<Vec<ChunkWrite>>
    {
        let g = &self.geom;
        let p = req.parity;
        let p_off = req.chunks[p].req_offset;
        let p_len = g.bytes(req.chunks[p].req_blocks);
        let mut writes = Vec::new();
        let mut iov_off = 0;
        {
            let mut pbuf = stripe.bufs[p].try_mut().unwrap().split_to(p_len);
            zero_sglists(std::slice::from_mut(&mut pbuf));
            for c in g.data_children(p) {
                let chunk = &req.chunks[c];
                if chunk.preread_blocks > 0 {
                    let plen = g.bytes(chunk.preread_blocks);
                    let pre = vec![
                        stripe.bufs[c].try_const().unwrap().slice_to(plen)
                    ];
                    xor_sglists(std::slice::from_mut(&mut pbuf),
                                g.bytes(chunk.preread_offset - p_off),
                                &pre, 0, plen);
                }
                if chunk.req_blocks > 0 {
                    let len = g.bytes(chunk.req_blocks);
                    let newdata = slice_sglist(data, iov_off, len)?;
                    iov_off += len;
                    xor_sglists(std::slice::from_mut(&mut pbuf),
                                g.bytes(chunk.req_offset - p_off),
                                &newdata, 0, len);
                    if skip_write != Some(c) {
                        writes.push(ChunkWrite {
                            child: c,
                            offset: chunk.req_offset,
                            blocks: chunk.req_blocks,
                            data: newdata,
                        });
                    }
                }
            }
        }
        writes.push(ChunkWrite {
            child: p,
            offset: p_off,
            blocks: req.chunks[p].req_blocks,
            data: vec![stripe.bufs[p].try_const().unwrap().slice_to(p_len)],
        });
        Ok(writes)
    }

    /// Degraded-write parity phase for a partially-touched degraded chunk:
    /// first rebuild the degraded chunk's old contents from the prereads,
    /// then compute parity as a reconstruction write.
    fn compute_parity_degraded(&self, stripe: &Arc<Stripe>,
        req: &mut StripeRequest, data: &SGList) -> Result<Vec<ChunkWrite>>
    {
        let g = &self.geom;
        let p = req.parity;
        let d = req.degraded.unwrap();

        // The parity preread window is the complement of the degraded
        // chunk's touched slice; reconstruct its old contents there.
        let w_off = req.chunks[p].preread_offset;
        let w_blocks = req.chunks[p].preread_blocks;
        req.chunks[d].preread_offset = w_off;
        req.chunks[d].preread_blocks = w_blocks;
        let wlen = g.bytes(w_blocks);
        {
            let mut dbuf = stripe.bufs[d].try_mut().unwrap().split_to(wlen);
            zero_sglists(std::slice::from_mut(&mut dbuf));
            for c in (0..g.num_children).filter(|&c| c != d) {
                let chunk = &req.chunks[c];
                let plen = g.bytes(chunk.preread_blocks);
                let src = vec![
                    stripe.bufs[c].try_const().unwrap().slice_to(plen)
                ];
                xor_sglists(std::slice::from_mut(&mut dbuf), 0, &src,
                            g.bytes(w_off - chunk.preread_offset), wlen);
            }
        }

        let p_off = req.chunks[p].req_offset;
        let p_len = g.bytes(req.chunks[p].req_blocks);
        let mut writes = Vec::new();
        let mut iov_off = 0;
        {
            let mut pbuf = stripe.bufs[p].try_mut().unwrap().split_to(p_len);
            zero_sglists(std::slice::from_mut(&mut pbuf));
            for c in g.data_children(p) {
                let chunk = &req.chunks[c];
                // The untouched span of this chunk, covered by its preread
                // (or by the reconstruction, for the degraded chunk)
                let (rp_off, rp_blocks) = if chunk.req_offset > 0 {
                    (0, chunk.req_offset)
                } else {
                    (chunk.req_blocks, g.strip_size - chunk.req_blocks)
                };
                if rp_blocks > 0 {
                    let plen = g.bytes(chunk.preread_blocks);
                    let src = vec![
                        stripe.bufs[c].try_const().unwrap().slice_to(plen)
                    ];
                    xor_sglists(std::slice::from_mut(&mut pbuf),
                                g.bytes(rp_off - p_off), &src,
                                g.bytes(rp_off - chunk.preread_offset),
                                g.bytes(rp_blocks));
                }
                if chunk.req_blocks > 0 {
                    let len = g.bytes(chunk.req_blocks);
                    let newdata = slice_sglist(data, iov_off, len)?;
                    iov_off += len;
                    xor_sglists(std::slice::from_mut(&mut pbuf),
                                g.bytes(chunk.req_offset - p_off),
                                &newdata, 0, len);
                    if c != d {
                        writes.push(ChunkWrite {
                            child: c,
                            offset: chunk.req_offset,
                            blocks: chunk.req_blocks,
                            data: newdata,
                        });
                    }
                }
            }
        }
        writes.push(ChunkWrite {
            child: p,
            offset: p_off,
            blocks: req.chunks[p].req_blocks,
            data: vec![stripe.bufs[p].try_const().unwrap().slice_to(p_len)],
        });
        Ok(writes)
    }

    async fn stripe_read(&self, stripe: &Arc<Stripe>,
        req: &mut StripeRequest, dest: SGListMut) -> Result<()>
    {
        let g = &self.geom;
        let base = g.child_base(stripe.index());
        let mut cursor = SGCursorMut::from(dest);
        let d_opt = req.degraded.filter(|&d| req.chunks[d].req_blocks > 0);

        let Some(d) = d_opt else {
            // No degraded chunk intersects the request: plain reads into
            // the host buffers.
            let futs = FuturesUnordered::new();
            for c in g.data_children(req.parity) {
                let chunk = &req.chunks[c];
                if chunk.req_blocks == 0 {
                    continue;
                }
                let bufs = cursor.take(g.bytes(chunk.req_blocks))?;
                let dbis = bufs.iter()
                    .map(IoVecMut::clone_inaccessible)
                    .collect::<Vec<_>>();
                drop(bufs);
                futs.push(Box::pin(host_read(
                    self.children[c].bdev.clone(),
                    dbis,
                    base + chunk.req_offset,
                    chunk.req_blocks)) as BoxBdevFut);
            }
            return drain_all(futs).await;
        };

        // Reconstruction read: gather enough of the surviving chunks to
        // rebuild the degraded chunk's slice by XOR.
        let d_off = req.chunks[d].req_offset;
        let d_blocks = req.chunks[d].req_blocks;
        let mut plans = Vec::with_capacity(g.num_children);
        let futs = FuturesUnordered::new();
        for ci in 0..g.num_children {
            let (c_off, c_blocks) =
                (req.chunks[ci].req_offset, req.chunks[ci].req_blocks);
            let plan = if c_blocks == 0 {
                // Parity, or a data chunk outside the request
                req.chunks[ci].preread_offset = d_off;
                req.chunks[ci].preread_blocks = d_blocks;
                futs.push(Box::pin(scratch_read(
                    self.children[ci].bdev.clone(),
                    stripe.clone(),
                    ci,
                    g.bytes(d_blocks),
                    base + d_off,
                    d_blocks)) as BoxBdevFut);
                ReadPlan::Scratch
            } else if ci == d {
                let bufs = cursor.take(g.bytes(c_blocks))?;
                let dbis = bufs.iter()
                    .map(IoVecMut::clone_inaccessible)
                    .collect::<Vec<_>>();
                drop(bufs);
                ReadPlan::Degraded(dbis)
            } else if c_off > d_off ||
                c_off + c_blocks < d_off + d_blocks
            {
                // This chunk's slice does not cover the degraded slice.
                // Preread the union of both spans into scratch and copy
                // the host portion out afterwards.
                let pre_off = cmp::min(c_off, d_off);
                let pre_end = cmp::max(c_off + c_blocks, d_off + d_blocks);
                req.chunks[ci].preread_offset = pre_off;
                req.chunks[ci].preread_blocks = pre_end - pre_off;
                let bufs = cursor.take(g.bytes(c_blocks))?;
                let dbis = bufs.iter()
                    .map(IoVecMut::clone_inaccessible)
                    .collect::<Vec<_>>();
                drop(bufs);
                futs.push(Box::pin(scratch_read(
                    self.children[ci].bdev.clone(),
                    stripe.clone(),
                    ci,
                    g.bytes(pre_end - pre_off),
                    base + pre_off,
                    pre_end - pre_off)) as BoxBdevFut);
                ReadPlan::Widened(dbis)
            } else {
                let bufs = cursor.take(g.bytes(c_blocks))?;
                let dbis = bufs.iter()
                    .map(IoVecMut::clone_inaccessible)
                    .collect::<Vec<_>>();
                drop(bufs);
                futs.push(Box::pin(host_read(
                    self.children[ci].bdev.clone(),
                    dbis.clone(),
                    base + c_off,
                    c_blocks)) as BoxBdevFut);
                ReadPlan::Direct(dbis)
            };
            plans.push(plan);
        }
        drain_all(futs).await?;

        // Rebuild the degraded chunk's slice in the host buffers
        let d_dbis = match &plans[d] {
            ReadPlan::Degraded(dbis) => dbis,
            _ => unreachable!(),
        };
        {
            let mut dbufs = d_dbis.iter()
                .map(|dbi| dbi.try_mut().unwrap())
                .collect::<SGListMut>();
            zero_sglists(&mut dbufs);
            let dlen = g.bytes(d_blocks);
            for ci in (0..g.num_children).filter(|&c| c != d) {
                match &plans[ci] {
                    ReadPlan::Scratch | ReadPlan::Widened(_) => {
                        let plen = g.bytes(req.chunks[ci].preread_blocks);
                        let src = vec![
                            stripe.bufs[ci].try_const().unwrap()
                                .slice_to(plen)
                        ];
                        let src_off = g.bytes(
                            d_off - req.chunks[ci].preread_offset);
                        xor_sglists(&mut dbufs, 0, &src, src_off, dlen);
                    },
                    ReadPlan::Direct(dbis) => {
                        let src = dbis.iter()
                            .map(|dbi| dbi.try_mut().unwrap())
                            .collect::<SGListMut>();
                        let src_off = g.bytes(
                            d_off - req.chunks[ci].req_offset);
                        xor_sglists(&mut dbufs, 0, &src, src_off, dlen);
                    },
                    ReadPlan::Degraded(_) => unreachable!(),
                }
            }
        }

        // Copy the requested subranges out of the widened prereads
        for ci in 0..g.num_children {
            if let ReadPlan::Widened(dbis) = &plans[ci] {
                let chunk = &req.chunks[ci];
                let mut host = dbis.iter()
                    .map(|dbi| dbi.try_mut().unwrap())
                    .collect::<SGListMut>();
                let src = vec![
                    stripe.bufs[ci].try_const().unwrap()
                        .slice_to(g.bytes(chunk.preread_blocks))
                ];
                copy_sglists(&mut host, 0, &src,
                    g.bytes(chunk.req_offset - chunk.preread_offset),
                    g.bytes(chunk.req_blocks));
            }
        }
        Ok(())
    }
}

// LCOV_EXCL_STOP
