// vim: tw=80
//! Common utility functions used throughout vdev-raid5

/// Return the length of data in an sglist, not the number of iovecs
pub fn sglist_len<T>(sglist: &[T]) -> usize
    where T: std::ops::Deref<Target=[u8]>
{
    sglist.iter().fold(0usize, |accumulator, buf| {
        accumulator + buf.len()
    })
}

// LCOV_EXCL_STOP
