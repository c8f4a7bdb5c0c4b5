// vim: tw=80
//! The parity kernel.
//!
//! XORs one byte region into another at arbitrary alignment, without
//! allocating.  The implementation is selected once, at first use: an AVX2
//! path when the CPU supports it, a word-wise scalar loop otherwise.

use lazy_static::lazy_static;

type XorFn = fn(&mut [u8], &[u8]);

lazy_static! {
    static ref XOR_IMPL: XorFn = select_impl();
}

/// XOR `src` into `dst`.  The regions must be the same length.
pub(crate) fn xor_buf(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());
    (*XOR_IMPL)(dst, src)
}

fn xor_scalar(dst: &mut [u8], src: &[u8]) {
    let mut dwords = dst.chunks_exact_mut(8);
    let mut swords = src.chunks_exact(8);
    for (d, s) in (&mut dwords).zip(&mut swords) {
        let x = u64::from_ne_bytes((&*d).try_into().unwrap()) ^
                u64::from_ne_bytes(s.try_into().unwrap());
        d.copy_from_slice(&x.to_ne_bytes());
    }
    for (d, s) in dwords.into_remainder().iter_mut()
        .zip(swords.remainder())
    {
        *d ^= *s;
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn xor_avx2_unchecked(dst: &mut [u8], src: &[u8]) {
    use std::arch::x86_64::*;

    let len = dst.len();
    let mut i = 0;
    while i + 32 <= len {
        let d = _mm256_loadu_si256(dst.as_ptr().add(i) as *const __m256i);
        let s = _mm256_loadu_si256(src.as_ptr().add(i) as *const __m256i);
        _mm256_storeu_si256(dst.as_mut_ptr().add(i) as *mut __m256i,
                            _mm256_xor_si256(d, s));
        i += 32;
    }
    xor_scalar(&mut dst[i..], &src[i..]);
}

#[cfg(target_arch = "x86_64")]
fn xor_avx2(dst: &mut [u8], src: &[u8]) {
    // Safe because select_impl verified AVX2 support
    unsafe { xor_avx2_unchecked(dst, src) }
}

#[cfg(target_arch = "x86_64")]
fn select_impl() -> XorFn {
    if std::is_x86_feature_detected!("avx2") {
        xor_avx2
    } else {
        xor_scalar
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn select_impl() -> XorFn {
    xor_scalar
}

// LCOV_EXCL_STOP
