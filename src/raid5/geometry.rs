// vim: tw=80
//! Geometry and chunk addressing for a single-parity array.
//!
//! The parity chunk rotates across stripes.  Data chunks occupy the other
//! `N - 1` child slots; mapping a data index to a child index skips the
//! parity slot.  All of the layout math lives here, separate from the I/O
//! path.

use crate::types::*;

#[derive(Clone, Copy, Debug)]
pub(crate) struct Geometry {
    /// Number of child devices in the array
    pub num_children: usize,

    /// Blocks per child per stripe.  Always a power of two.
    pub strip_size: BlockT,

    /// log2 of `strip_size`
    pub strip_size_shift: u32,

    /// Bytes per block
    pub blocklen: usize,

    /// Data blocks per stripe: `strip_size * (num_children - 1)`
    pub stripe_blocks: BlockT,

    /// Number of stripes on the array
    pub total_stripes: BlockT,
}

impl Geometry {
    pub fn new(num_children: usize, strip_size: BlockT, blocklen: usize,
               min_child_blocks: BlockT) -> Result<Self>
    {
        if !strip_size.is_power_of_two() {
            return Err(Error::EINVAL);
        }
        let total_stripes = min_child_blocks / strip_size;
        if total_stripes == 0 {
            return Err(Error::EINVAL);
        }
        Ok(Geometry {
            num_children,
            strip_size,
            strip_size_shift: strip_size.trailing_zeros(),
            blocklen,
            stripe_blocks: strip_size * (num_children as BlockT - 1),
            total_stripes,
        })
    }

    /// Convert a count of blocks into bytes
    pub fn bytes(&self, blocks: BlockT) -> usize {
        blocks as usize * self.blocklen
    }

    /// The child holding parity for the given stripe
    pub fn parity_child(&self, stripe_index: BlockT) -> usize {
        let n = self.num_children;
        (n - 1) - (stripe_index % n as BlockT) as usize
    }

    /// Map a data-chunk index to a child index, skipping the parity slot
    pub fn data_child(&self, parity: usize, data_idx: usize) -> usize {
        if data_idx < parity {
            data_idx
        } else {
            data_idx + 1
        }
    }

    /// Map a child index to its data-chunk index within the stripe
    pub fn data_index(&self, parity: usize, child: usize) -> usize {
        debug_assert_ne!(child, parity);
        if child < parity {
            child
        } else {
            child - 1
        }
    }

    /// Iterate over the children holding data for a stripe, in data order
    pub fn data_children(&self, parity: usize)
        -> impl Iterator<Item = usize>
    {
        (0..self.num_children).filter(move |c| *c != parity)
    }

    /// Decompose a virtual offset into (stripe index, offset within stripe)
    pub fn stripe_of(&self, offset_blocks: BlockT) -> (BlockT, BlockT) {
        (offset_blocks / self.stripe_blocks,
         offset_blocks % self.stripe_blocks)
    }

    /// First block of a stripe on each of its children
    pub fn child_base(&self, stripe_index: BlockT) -> BlockT {
        stripe_index << self.strip_size_shift
    }

    /// Data-chunk indices of the first and last chunks a stripe-relative
    /// range touches
    pub fn data_chunk_range(&self, stripe_offset: BlockT, blocks: BlockT)
        -> (usize, usize)
    {
        debug_assert!(blocks > 0);
        debug_assert!(stripe_offset + blocks <= self.stripe_blocks);
        ((stripe_offset >> self.strip_size_shift) as usize,
         ((stripe_offset + blocks - 1) >> self.strip_size_shift) as usize)
    }

    /// The slice of one data chunk that a stripe-relative range addresses,
    /// as (offset from chunk start, block count).
    ///
    /// Only meaningful for data chunks within
    /// [`Self::data_chunk_range`]; other chunks have an empty slice.
    pub fn chunk_slice(&self, stripe_offset: BlockT, blocks: BlockT,
                       data_idx: usize) -> (BlockT, BlockT)
    {
        let chunk_from = (data_idx as BlockT) << self.strip_size_shift;
        let chunk_to = chunk_from + self.strip_size;
        let range_from = stripe_offset;
        let range_to = stripe_offset + blocks;
        debug_assert!(range_from < chunk_to && range_to > chunk_from);

        let req_offset = range_from.saturating_sub(chunk_from);
        let req_end = if range_to < chunk_to {
            range_to - chunk_from
        } else {
            self.strip_size
        };
        (req_offset, req_end - req_offset)
    }
}

// LCOV_EXCL_STOP
