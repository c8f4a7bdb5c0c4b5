// vim: tw=80
//! Per-I/O-channel resources.
//!
//! Each channel owns a retry queue for host requests that could not obtain
//! a stripe slot or a pooled request, and a small pool of iovec wrappers
//! used by the fast-path read helper.

use std::{
    collections::VecDeque,
    sync::Mutex
};

use divbuf::DivBufInaccessible;
use futures::channel::oneshot;
use tracing::{Level, event};

/// Number of iovec wrappers pre-allocated per channel
const IOV_WRAPPER_COUNT: usize = 512;

/// Bookkeeping for one chunk-sized child read on the fast path.  The
/// inaccessible handles allow the read to be resubmitted if the child
/// reports ENOMEM.
pub(crate) struct IovWrapper {
    pub dbis: Vec<DivBufInaccessible>,
}

/// Per-channel resource.  One per I/O channel; all access is from the
/// channel's own tasks except for waiter release, which may come from a
/// completion on another channel's thread.
pub struct Raid5Channel {
    retry_queue: Mutex<VecDeque<oneshot::Sender<()>>>,
    iov_wrappers: Mutex<Vec<IovWrapper>>,
}

impl Raid5Channel {
    pub(crate) fn new() -> Self {
        let wrappers = (0..IOV_WRAPPER_COUNT)
            .map(|_| IovWrapper { dbis: Vec::new() })
            .collect();
        Raid5Channel {
            retry_queue: Mutex::new(VecDeque::new()),
            iov_wrappers: Mutex::new(wrappers),
        }
    }

    /// Park the caller until a completion on this channel releases it.
    /// Resources should be retried after the returned receiver completes.
    pub(crate) fn park(&self) -> oneshot::Receiver<()> {
        event!(Level::DEBUG, "raid5_channel_park");
        let (tx, rx) = oneshot::channel();
        self.retry_queue.lock().unwrap().push_back(tx);
        rx
    }

    /// Release one parked waiter, if any.  Waiters whose tasks have gone
    /// away are skipped.
    pub(crate) fn retry_one(&self) {
        let mut q = self.retry_queue.lock().unwrap();
        while let Some(tx) = q.pop_front() {
            if tx.send(()).is_ok() {
                break;
            }
        }
    }

    pub(crate) fn take_wrapper(&self) -> IovWrapper {
        self.iov_wrappers.lock().unwrap().pop()
            .unwrap_or_else(|| IovWrapper { dbis: Vec::new() })
    }

    pub(crate) fn return_wrapper(&self, mut w: IovWrapper) {
        w.dbis.clear();
        self.iov_wrappers.lock().unwrap().push(w);
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
use futures::FutureExt;
use super::*;

#[test]
fn park_and_retry_fifo() {
    let ch = Raid5Channel::new();
    let rx1 = ch.park();
    let mut rx2 = ch.park();
    ch.retry_one();
    assert!(rx1.now_or_never().unwrap().is_ok());
    assert!(rx2.try_recv().unwrap().is_none());
    ch.retry_one();
    assert!(rx2.now_or_never().unwrap().is_ok());
}

#[test]
fn retry_with_empty_queue_is_harmless() {
    let ch = Raid5Channel::new();
    ch.retry_one();
}

#[test]
fn retry_skips_dead_waiters() {
    let ch = Raid5Channel::new();
    let rx1 = ch.park();
    let rx2 = ch.park();
    drop(rx1);
    ch.retry_one();
    assert!(rx2.now_or_never().unwrap().is_ok());
}

#[test]
fn wrappers_recycle() {
    let ch = Raid5Channel::new();
    let mut w = ch.take_wrapper();
    let dbs = divbuf::DivBufShared::from(vec![0u8; 8]);
    let dbm = dbs.try_mut().unwrap();
    w.dbis.push(dbm.clone_inaccessible());
    drop(dbm);
    ch.return_wrapper(w);
    let w2 = ch.take_wrapper();
    assert!(w2.dbis.is_empty());
}

}
// LCOV_EXCL_STOP
