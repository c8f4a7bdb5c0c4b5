// vim: tw=80
//! A RAID-5 stripe execution engine for virtual block devices.
//!
//! This crate turns N >= 3 child block devices into one striped,
//! single-parity virtual device.  The embedding framework implements
//! [`bdev::BaseBdev`] for its children, assembles a [`Raid5`] array, holds
//! one [`Raid5Channel`] per I/O channel, and feeds host reads and writes
//! to [`Raid5::submit_rw_request`].
//!
//! Writes pick the cheaper of read-modify-write and reconstruction write
//! per stripe; a full-stripe write needs no preread at all.  With one
//! child degraded, reads reconstruct the missing data by XOR and writes
//! keep parity consistent on the survivors.  Requests that touch the same
//! stripe execute strictly in submission order.

#![allow(clippy::type_complexity)]

pub mod bdev;
pub mod raid5;
pub mod types;
pub mod util;

pub use crate::raid5::{
    BASE_BDEVS_MAX_DEGRADED,
    BASE_BDEVS_MIN,
    IoCmd,
    RAID_MAX_STRIPES,
    Raid5,
    Raid5Channel,
};
pub use crate::types::*;
pub use crate::util::*;
