// vim: tw=80
//! Common type definitions used throughout vdev-raid5

use divbuf::{DivBuf, DivBufMut};
use enum_primitive_derive::Primitive;
use num_traits::ToPrimitive;

/// Indexes a block on the virtual device or on a child device.
///
/// The engine is entirely block-addressed; the byte width of a block comes
/// from the array geometry.
pub type BlockT = u64;

/// Our `IoVec`.  Unlike the standard library's, ours is reference-counted so
/// it can have more than one owner.
pub type IoVec = DivBuf;

/// Mutable version of `IoVec`.  Uniquely owned.
pub type IoVecMut = DivBufMut;

/// Our scatter-gather list.  A vector of reference-counted `IoVec`s.
pub type SGList = Vec<IoVec>;

/// Mutable version of `SGList`.  Uniquely owned.
pub type SGListMut = Vec<IoVecMut>;

/// vdev-raid5's error type.  Basically just an errno.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Primitive)]
pub enum Error {
    EPERM           = libc::EPERM as isize,
    EIO             = libc::EIO as isize,
    ENXIO           = libc::ENXIO as isize,
    ENOMEM          = libc::ENOMEM as isize,
    EBUSY           = libc::EBUSY as isize,
    ENODEV          = libc::ENODEV as isize,
    EINVAL          = libc::EINVAL as isize,
    ENOSPC          = libc::ENOSPC as isize,
    EAGAIN          = libc::EAGAIN as isize,
    EOVERFLOW       = libc::EOVERFLOW as isize,
}

impl From<Error> for i32 {
    fn from(e: Error) -> Self {
        e.to_i32().unwrap()
    }
}

pub type Result<T = ()> = std::result::Result<T, Error>;

// LCOV_EXCL_STOP
