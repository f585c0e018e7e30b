use log::warn;

use std::sync::Arc;

use crate::{
    config::SendFlags,
    error::{Error, Result},
    ring::{FrameDesc, RingProd},
};

use super::Socket;

/// The transmitting side of an XDP [`Socket`].
///
/// Descriptors produced here are drained by the socket's egress path
/// once it is kicked; the frame indices come back on the
/// [`CompQueue`](crate::umem::CompQueue) when the device is done with
/// them.
pub struct TxQueue {
    prod: RingProd<FrameDesc>,
    socket: Arc<Socket>,
}

impl std::fmt::Debug for TxQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxQueue").field("prod", &self.prod).finish()
    }
}

impl TxQueue {
    pub(super) fn new(prod: RingProd<FrameDesc>, socket: Arc<Socket>) -> Self {
        Self { prod, socket }
    }

    /// Submit the payloads described by `descs` for transmission.
    /// Returns the number of descriptors submitted.
    ///
    /// Note that if the length of `descs` is greater than the number of
    /// free slots on the underlying ring then no descriptors at all will
    /// be submitted.
    ///
    /// # Safety
    ///
    /// This function is unsafe as it is possible to cause a data race by
    /// simultaneously submitting the same frame index to the TX ring and
    /// the fill ring, for example. Once submitted, a frame should not be
    /// used again until its index is consumed via the
    /// [`CompQueue`](crate::umem::CompQueue).
    #[inline]
    pub unsafe fn produce(&mut self, descs: &[FrameDesc]) -> usize {
        let nb = descs.len() as u32;

        if nb == 0 {
            return 0;
        }

        let mut pos = 0;

        let cnt = self.prod.reserve(nb, &mut pos);

        if cnt > 0 {
            for (i, desc) in descs.iter().enumerate().take(cnt as usize) {
                self.prod.write(pos + i as u32, *desc);
            }

            self.prod
                .submit(cnt)
                .expect("submit of freshly reserved slots cannot overflow");
        }

        cnt as usize
    }

    /// Same as [`produce`](TxQueue::produce) but kick the socket
    /// afterwards so the egress path drains what was submitted.
    ///
    /// # Safety
    ///
    /// See [`produce`](TxQueue::produce).
    #[inline]
    pub unsafe fn produce_and_kick(&mut self, descs: &[FrameDesc]) -> Result<usize> {
        let cnt = self.produce(descs);

        if cnt > 0 {
            self.kick()?;
        }

        Ok(cnt)
    }

    /// Kick the socket to drain produced descriptors.
    ///
    /// Ring-full and device-busy conditions are swallowed: the caller
    /// retries on the next kick. A downed device is reported but treated
    /// the same way.
    #[inline]
    pub fn kick(&self) -> Result<()> {
        match self.socket.sendmsg(SendFlags::MSG_DONTWAIT) {
            Ok(()) => Ok(()),
            Err(Error::WouldBlock) => Ok(()),
            Err(Error::DeviceDown) => {
                warn!("device is down, kick suppressed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// The socket this queue belongs to.
    #[inline]
    pub fn socket(&self) -> &Arc<Socket> {
        &self.socket
    }
}
