use std::sync::Arc;

use crate::ring::RingProd;

use super::Umem;

/// Used to transfer ownership of [`Umem`] frames from user-space to the
/// data path.
///
/// Frame indices submitted here will be used to receive packets, and will
/// eventually be returned via the [`RxQueue`](crate::socket::RxQueue).
pub struct FillQueue {
    prod: RingProd<u32>,
    _umem: Arc<Umem>,
}

impl std::fmt::Debug for FillQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FillQueue").field("prod", &self.prod).finish()
    }
}

impl FillQueue {
    pub(crate) fn new(prod: RingProd<u32>, umem: Arc<Umem>) -> Self {
        Self { prod, _umem: umem }
    }

    /// Let the data path know that the frames at `indices` may be used to
    /// receive data. Returns the number of frames submitted.
    ///
    /// Note that if the length of `indices` is greater than the number of
    /// free slots on the underlying ring then no frames at all will be
    /// handed over.
    ///
    /// # Safety
    ///
    /// This function is unsafe as it is possible to cause a data race if
    /// used improperly. For example, by simultaneously submitting the same
    /// frame index to this `FillQueue` and the
    /// [`TxQueue`](crate::socket::TxQueue). Once submitted, a frame should
    /// not be used again until consumed via the
    /// [`RxQueue`](crate::socket::RxQueue).
    #[inline]
    pub unsafe fn produce(&mut self, indices: &[u32]) -> usize {
        let nb = indices.len() as u32;

        if nb == 0 {
            return 0;
        }

        let mut pos = 0;

        let cnt = self.prod.reserve(nb, &mut pos);

        if cnt > 0 {
            for (i, idx) in indices.iter().enumerate().take(cnt as usize) {
                self.prod.write(pos + i as u32, *idx);
            }

            self.prod
                .submit(cnt)
                .expect("submit of freshly reserved slots cannot overflow");
        }

        cnt as usize
    }

    /// Same as [`produce`](Self::produce) but for a single frame index.
    ///
    /// # Safety
    ///
    /// See [`produce`](Self::produce).
    #[inline]
    pub unsafe fn produce_one(&mut self, idx: u32) -> usize {
        self.produce(&[idx])
    }
}
