//! Counter of accepted-but-unfinished events, used by graceful stop.
//!
//! An accepted event holds one [`InFlightGuard`]. Once dispatched, the guard
//! moves into a [`Delivery`] that hands out one [`CopyToken`] per mailbox
//! copy; the slot is given back when the last token finishes.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone)]
pub(crate) struct InFlight {
    count: Arc<watch::Sender<usize>>,
}

impl InFlight {
    pub(crate) fn new() -> Self {
        Self {
            count: Arc::new(watch::Sender::new(0)),
        }
    }

    /// Takes one slot; the slot is given back exactly once by the guard.
    pub(crate) fn acquire(&self) -> InFlightGuard {
        self.count.send_modify(|n| *n += 1);
        InFlightGuard {
            inflight: self.clone(),
            released: AtomicBool::new(false),
        }
    }

    pub(crate) fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Resolves once no slot is held.
    pub(crate) async fn wait_idle(&self) {
        let mut rx = self.count.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

pub(crate) struct InFlightGuard {
    inflight: InFlight,
    released: AtomicBool,
}

impl InFlightGuard {
    pub(crate) fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.inflight
                .count
                .send_modify(|n| *n = n.saturating_sub(1));
        }
    }

}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Fan-out of one accepted event.
pub(crate) struct Delivery {
    guard: InFlightGuard,
    outstanding: AtomicUsize,
}

impl Delivery {
    pub(crate) fn new(guard: InFlightGuard) -> Arc<Self> {
        Arc::new(Self {
            guard,
            outstanding: AtomicUsize::new(0),
        })
    }

    /// A token for one more copy. The slot stays held while any token is
    /// unfinished.
    pub(crate) fn copy(self: &Arc<Self>) -> CopyToken {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        CopyToken {
            delivery: self.clone(),
            finished: AtomicBool::new(false),
        }
    }

    fn finish_one(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.guard.release();
        }
    }
}

/// One copy's share of a [`Delivery`]. Finished by ack or by drop.
pub(crate) struct CopyToken {
    delivery: Arc<Delivery>,
    finished: AtomicBool,
}

impl CopyToken {
    pub(crate) fn finish(&self) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            self.delivery.finish_one();
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

impl Drop for CopyToken {
    fn drop(&mut self) {
        self.finish();
    }
}
