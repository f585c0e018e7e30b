use std::sync::Arc;

use crate::ring::RingCons;

use super::Umem;

/// Used to transfer ownership of [`Umem`] frames from the data path back
/// to user-space.
///
/// Frame indices received here are those whose contents have been handed
/// to the device after submission via the
/// [`TxQueue`](crate::socket::TxQueue), and may now be used again.
pub struct CompQueue {
    cons: RingCons<u32>,
    _umem: Arc<Umem>,
}

impl std::fmt::Debug for CompQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompQueue").field("cons", &self.cons).finish()
    }
}

impl CompQueue {
    pub(crate) fn new(cons: RingCons<u32>, umem: Arc<Umem>) -> Self {
        Self { cons, _umem: umem }
    }

    /// Update `indices` with frames whose transmission has completed.
    ///
    /// The number of entries updated will be less than or equal to the
    /// length of `indices`. Returns the number of elements updated.
    ///
    /// Free frames should be added back on to either the
    /// [`FillQueue`](crate::umem::FillQueue) for data receipt or the
    /// [`TxQueue`](crate::socket::TxQueue) for data transmission.
    #[inline]
    pub fn consume(&mut self, indices: &mut [u32]) -> usize {
        let nb = indices.len() as u32;

        if nb == 0 {
            return 0;
        }

        let mut pos = 0;

        let cnt = self.cons.peek(nb, &mut pos);

        if cnt > 0 {
            for (i, idx) in indices.iter_mut().enumerate().take(cnt as usize) {
                *idx = self.cons.read(pos + i as u32);
            }

            self.cons.release(cnt);
        }

        cnt as usize
    }
}
