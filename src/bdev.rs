// vim: tw=80
//! The child block-device seam.
//!
//! The RAID engine addresses its children through [`BaseBdev`], which the
//! embedding block-device framework implements.  All child I/O is submitted
//! asynchronously and completes through the returned future on the
//! submitting task.

use std::{
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering}
    }
};

#[cfg(test)] use mockall::mock;

use crate::types::*;

/// Future representing an I/O operation on a child block device.
pub type BdevFut = dyn futures::Future<Output = Result<()>> + Send + Sync;

/// Boxed `BdevFut`
pub type BoxBdevFut =
    Pin<Box<dyn futures::Future<Output = Result<()>> + Send + Sync>>;

/// A child block device.
///
/// Implementations must tolerate multiple outstanding operations.  A child
/// that is momentarily out of internal resources should resolve the returned
/// future with [`Error::ENOMEM`]; the engine resubmits the operation.
pub trait BaseBdev: Send + Sync {
    /// Size of the device in blocks
    fn block_count(&self) -> BlockT;

    /// Size of one block in bytes
    fn block_len(&self) -> u32;

    /// Read `num_blocks` blocks starting at `offset_blocks` into `bufs`.
    ///
    /// The total length of `bufs` must be exactly
    /// `num_blocks * block_len()` bytes.
    fn readv_blocks(&self, bufs: SGListMut, offset_blocks: BlockT,
        num_blocks: BlockT) -> BoxBdevFut;

    /// Write the contents of `bufs` to `num_blocks` blocks starting at
    /// `offset_blocks`.
    fn writev_blocks(&self, bufs: SGList, offset_blocks: BlockT,
        num_blocks: BlockT) -> BoxBdevFut;
}

/// Per-child bookkeeping: the device handle and its health.
pub(crate) struct BaseBdevInfo {
    pub bdev: Arc<dyn BaseBdev>,

    /// A degraded child is unavailable.  Its data must be reconstructed
    /// from the other children, and no I/O may be issued to it.
    degraded: AtomicBool,
}

impl BaseBdevInfo {
    pub fn new(bdev: Arc<dyn BaseBdev>) -> Self {
        BaseBdevInfo { bdev, degraded: AtomicBool::new(false) }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn set_degraded(&self, degraded: bool) {
        self.degraded.store(degraded, Ordering::Relaxed);
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mock! {
    pub BaseBdev {}
    impl BaseBdev for BaseBdev {
        fn block_count(&self) -> BlockT;
        fn block_len(&self) -> u32;
        fn readv_blocks(&self, bufs: SGListMut, offset_blocks: BlockT,
            num_blocks: BlockT) -> BoxBdevFut;
        fn writev_blocks(&self, bufs: SGList, offset_blocks: BlockT,
            num_blocks: BlockT) -> BoxBdevFut;
    }
}
// LCOV_EXCL_STOP
