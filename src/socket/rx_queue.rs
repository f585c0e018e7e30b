use std::sync::Arc;

use crate::ring::{FrameDesc, RingCons};

use super::{Readiness, Socket};

/// The receiving side of an XDP [`Socket`].
///
/// Descriptors consumed here point at UMEM frames whose payloads were
/// copied in by the data path. Once dealt with, the frames should
/// eventually be added back on to the
/// [`FillQueue`](crate::umem::FillQueue).
pub struct RxQueue {
    cons: RingCons<FrameDesc>,
    socket: Arc<Socket>,
}

impl std::fmt::Debug for RxQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RxQueue").field("cons", &self.cons).finish()
    }
}

impl RxQueue {
    pub(super) fn new(cons: RingCons<FrameDesc>, socket: Arc<Socket>) -> Self {
        Self { cons, socket }
    }

    /// Populate `descs` with information on packets received on the RX
    /// ring.
    ///
    /// The number of entries updated will be less than or equal to the
    /// length of `descs`. Entries will be updated sequentially from the
    /// start of `descs` until the end. Returns the number of elements
    /// updated.
    #[inline]
    pub fn consume(&mut self, descs: &mut [FrameDesc]) -> usize {
        let nb = descs.len() as u32;

        if nb == 0 {
            return 0;
        }

        let mut pos = 0;

        let cnt = self.cons.peek(nb, &mut pos);

        if cnt > 0 {
            for (i, desc) in descs.iter_mut().enumerate().take(cnt as usize) {
                *desc = self.cons.read(pos + i as u32);
            }

            self.cons.release(cnt);
        }

        cnt as usize
    }

    /// Same as [`consume`](RxQueue::consume) but for a single
    /// descriptor.
    #[inline]
    pub fn consume_one(&mut self, desc: &mut FrameDesc) -> usize {
        self.consume(std::slice::from_mut(desc))
    }

    /// Same as [`consume`](RxQueue::consume) but wait for the socket to
    /// become readable first, up to `timeout_ms` (negative: wait
    /// indefinitely).
    #[inline]
    pub fn poll_and_consume(&mut self, descs: &mut [FrameDesc], timeout_ms: i32) -> usize {
        if self
            .socket
            .poll_wait(Readiness::READABLE, timeout_ms)
            .contains(Readiness::READABLE)
        {
            self.consume(descs)
        } else {
            0
        }
    }

    /// The socket this queue belongs to.
    #[inline]
    pub fn socket(&self) -> &Arc<Socket> {
        &self.socket
    }
}
