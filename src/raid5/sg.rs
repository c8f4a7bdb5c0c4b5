// vim: tw=80
//! Scatter/gather mapping between host buffers and per-chunk I/O.
//!
//! Host requests arrive as sglists whose segment boundaries have nothing to
//! do with chunk boundaries.  The helpers here slice a subrange of a host
//! sglist into a chunk's sglist, carve a mutable host buffer in submission
//! order, and XOR/copy/zero byte ranges across differently-segmented lists
//! in lockstep.

use std::{
    cmp,
    collections::VecDeque,
    ops::Deref
};

use crate::types::*;
use super::xor::xor_buf;

/// Slice the subrange `[offset, offset + len)` out of a host sglist.
///
/// Interior segments are borrowed whole; the first and last are clipped.
/// Fails with `EINVAL` if the host sglist is shorter than the requested
/// range.
pub(crate) fn slice_sglist(host: &[IoVec], offset: usize, len: usize)
    -> Result<SGList>
{
    let mut out = SGList::new();
    let mut remaining = len;
    let mut skip = offset;
    let mut iter = host.iter();
    while remaining > 0 {
        let seg = iter.next().ok_or(Error::EINVAL)?;
        if skip >= seg.len() {
            skip -= seg.len();
            continue;
        }
        let take = cmp::min(seg.len() - skip, remaining);
        out.push(seg.slice(skip, skip + take));
        skip = 0;
        remaining -= take;
    }
    Ok(out)
}

/// In-order carving of a mutable host buffer.
///
/// Each [`Self::take`] consumes the next `len` bytes as a new sglist,
/// splitting a segment when the boundary falls inside it.  Chunks are
/// always carved in ascending data order, so a cursor is all the mapping
/// the read path needs.
pub(crate) struct SGCursorMut {
    segs: VecDeque<IoVecMut>,
}

impl SGCursorMut {
    pub fn take(&mut self, len: usize) -> Result<SGListMut> {
        let mut out = SGListMut::new();
        let mut remaining = len;
        while remaining > 0 {
            let mut seg = self.segs.pop_front().ok_or(Error::EINVAL)?;
            if seg.len() > remaining {
                out.push(seg.split_to(remaining));
                self.segs.push_front(seg);
                remaining = 0;
            } else {
                remaining -= seg.len();
                out.push(seg);
            }
        }
        Ok(out)
    }

    pub fn is_empty(&self) -> bool {
        self.segs.iter().all(|s| s.is_empty())
    }
}

impl From<SGListMut> for SGCursorMut {
    fn from(src: SGListMut) -> Self {
        SGCursorMut { segs: src.into() }
    }
}

/// Locate the segment containing byte `offset`, returning
/// (segment index, offset within it)
fn seek<T: Deref<Target=[u8]>>(list: &[T], mut offset: usize)
    -> (usize, usize)
{
    let mut i = 0;
    while i < list.len() && offset >= list[i].len() {
        offset -= list[i].len();
        i += 1;
    }
    (i, offset)
}

/// XOR `len` bytes of `src` at `src_offset` into `dst` at `dst_offset`,
/// region by region.  Segmentation of the two lists is independent.
pub(crate) fn xor_sglists<S>(dst: &mut [IoVecMut], dst_offset: usize,
                             src: &[S], src_offset: usize, len: usize)
    where S: Deref<Target=[u8]>
{
    let (mut di, mut doff) = seek(dst, dst_offset);
    let (mut si, mut soff) = seek(src, src_offset);
    let mut remaining = len;
    while remaining > 0 {
        let n = cmp::min(remaining,
            cmp::min(dst[di].len() - doff, src[si].len() - soff));
        xor_buf(&mut dst[di][doff..doff + n], &src[si][soff..soff + n]);
        remaining -= n;
        doff += n;
        soff += n;
        if doff == dst[di].len() {
            di += 1;
            doff = 0;
        }
        if soff == src[si].len() {
            si += 1;
            soff = 0;
        }
    }
}

/// `xor_sglists`, with copy.
pub(crate) fn copy_sglists<S>(dst: &mut [IoVecMut], dst_offset: usize,
                              src: &[S], src_offset: usize, len: usize)
    where S: Deref<Target=[u8]>
{
    let (mut di, mut doff) = seek(dst, dst_offset);
    let (mut si, mut soff) = seek(src, src_offset);
    let mut remaining = len;
    while remaining > 0 {
        let n = cmp::min(remaining,
            cmp::min(dst[di].len() - doff, src[si].len() - soff));
        dst[di][doff..doff + n].copy_from_slice(&src[si][soff..soff + n]);
        remaining -= n;
        doff += n;
        soff += n;
        if doff == dst[di].len() {
            di += 1;
            doff = 0;
        }
        if soff == src[si].len() {
            si += 1;
            soff = 0;
        }
    }
}

/// Zero-fill every segment of an sglist
pub(crate) fn zero_sglists(dst: &mut [IoVecMut]) {
    for seg in dst.iter_mut() {
        seg[..].fill(0);
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
use divbuf::DivBufShared;
use pretty_assertions::assert_eq;
use super::*;

fn host_sglist() -> (Vec<DivBufShared>, SGList) {
    let dbs0 = DivBufShared::from(vec![0u8, 1, 2, 3, 4]);
    let dbs1 = DivBufShared::from(vec![5u8, 6, 7]);
    let dbs2 = DivBufShared::from(vec![8u8, 9, 10, 11]);
    let sglist = vec![
        dbs0.try_const().unwrap(),
        dbs1.try_const().unwrap(),
        dbs2.try_const().unwrap()
    ];
    (vec![dbs0, dbs1, dbs2], sglist)
}

#[test]
fn slice_within_one_segment() {
    let (_dbs, host) = host_sglist();
    let s = slice_sglist(&host, 1, 3).unwrap();
    assert_eq!(s.len(), 1);
    assert_eq!(&s[0][..], &[1, 2, 3]);
}

#[test]
fn slice_across_segments() {
    let (_dbs, host) = host_sglist();
    let s = slice_sglist(&host, 3, 7).unwrap();
    assert_eq!(s.len(), 3);
    assert_eq!(&s[0][..], &[3, 4]);
    assert_eq!(&s[1][..], &[5, 6, 7]);
    assert_eq!(&s[2][..], &[8, 9]);
}

#[test]
fn slice_whole() {
    let (_dbs, host) = host_sglist();
    let s = slice_sglist(&host, 0, 12).unwrap();
    assert_eq!(s.len(), 3);
}

#[test]
fn slice_empty() {
    let (_dbs, host) = host_sglist();
    assert!(slice_sglist(&host, 5, 0).unwrap().is_empty());
}

#[test]
fn slice_short_host() {
    let (_dbs, host) = host_sglist();
    assert_eq!(slice_sglist(&host, 8, 5).unwrap_err(), Error::EINVAL);
    assert_eq!(slice_sglist(&host, 12, 1).unwrap_err(), Error::EINVAL);
}

#[test]
fn cursor_carves_in_order() {
    let dbs = DivBufShared::from((0u8..10).collect::<Vec<_>>());
    let mut cursor = SGCursorMut::from(vec![dbs.try_mut().unwrap()]);
    let a = cursor.take(3).unwrap();
    let b = cursor.take(7).unwrap();
    assert_eq!(&a[0][..], &[0, 1, 2]);
    assert_eq!(&b[0][..], &[3, 4, 5, 6, 7, 8, 9]);
    assert!(cursor.is_empty());
}

#[test]
fn cursor_across_segments() {
    let dbs0 = DivBufShared::from(vec![0u8, 1]);
    let dbs1 = DivBufShared::from(vec![2u8, 3, 4]);
    let mut cursor = SGCursorMut::from(vec![
        dbs0.try_mut().unwrap(),
        dbs1.try_mut().unwrap()
    ]);
    let a = cursor.take(4).unwrap();
    assert_eq!(a.len(), 2);
    assert_eq!(&a[0][..], &[0, 1]);
    assert_eq!(&a[1][..], &[2, 3]);
    assert_eq!(&cursor.take(1).unwrap()[0][..], &[4]);
}

#[test]
fn cursor_exhausted() {
    let dbs = DivBufShared::from(vec![0u8, 1]);
    let mut cursor = SGCursorMut::from(vec![dbs.try_mut().unwrap()]);
    assert_eq!(cursor.take(3).unwrap_err(), Error::EINVAL);
}

#[test]
fn xor_with_offsets() {
    let d = DivBufShared::from(vec![0u8; 8]);
    let s = DivBufShared::from(vec![0xffu8; 8]);
    let mut dst = vec![d.try_mut().unwrap()];
    let src = vec![s.try_const().unwrap()];
    xor_sglists(&mut dst, 2, &src, 5, 3);
    drop(dst);
    let out = d.try_const().unwrap();
    assert_eq!(&out[..], &[0, 0, 0xff, 0xff, 0xff, 0, 0, 0]);
}

#[test]
fn xor_lockstep_segmentation() {
    // 2+4 destination segments vs 3+3 source segments
    let d0 = DivBufShared::from(vec![0u8; 2]);
    let d1 = DivBufShared::from(vec![0u8; 4]);
    let s0 = DivBufShared::from(vec![1u8, 2, 3]);
    let s1 = DivBufShared::from(vec![4u8, 5, 6]);
    let mut dst = vec![d0.try_mut().unwrap(), d1.try_mut().unwrap()];
    let src = vec![s0.try_const().unwrap(), s1.try_const().unwrap()];
    xor_sglists(&mut dst, 0, &src, 0, 6);
    drop(dst);
    assert_eq!(&d0.try_const().unwrap()[..], &[1, 2]);
    assert_eq!(&d1.try_const().unwrap()[..], &[3, 4, 5, 6]);
}

#[test]
fn copy_with_offsets() {
    let d = DivBufShared::from(vec![0u8; 6]);
    let s = DivBufShared::from(vec![10u8, 11, 12, 13, 14, 15]);
    let mut dst = vec![d.try_mut().unwrap()];
    let src = vec![s.try_const().unwrap()];
    copy_sglists(&mut dst, 1, &src, 3, 2);
    drop(dst);
    assert_eq!(&d.try_const().unwrap()[..], &[0, 13, 14, 0, 0, 0]);
}

#[test]
fn zero_fills_all_segments() {
    let d0 = DivBufShared::from(vec![1u8, 2]);
    let d1 = DivBufShared::from(vec![3u8, 4, 5]);
    let mut dst = vec![d0.try_mut().unwrap(), d1.try_mut().unwrap()];
    zero_sglists(&mut dst);
    drop(dst);
    assert_eq!(&d0.try_const().unwrap()[..], &[0, 0]);
    assert_eq!(&d1.try_const().unwrap()[..], &[0, 0, 0]);
}

}
// LCOV_EXCL_STOP
