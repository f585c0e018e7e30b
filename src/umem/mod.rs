//! Types for interacting with and creating a [`Umem`].

pub(crate) mod mem;
pub use mem::UmemRegion;

mod fill_queue;
pub use fill_queue::FillQueue;

mod comp_queue;
pub use comp_queue::CompQueue;

use log::error;

use crate::{
    config::{QueueSize, UmemConfig},
    error::{Error, Result},
    ring::{self, FrameDesc, RingCons, RingProd, RingShared},
};

use std::sync::Arc;

/// The geometry of a [`Umem`], copied into ring consumers so they can
/// validate frame indices and descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UmemProps {
    num_frames: u32,
    frame_size: u32,
    frame_headroom: u32,
}

impl UmemProps {
    pub(crate) fn new(num_frames: u32, frame_size: u32, frame_headroom: u32) -> Self {
        Self {
            num_frames,
            frame_size,
            frame_headroom,
        }
    }

    #[inline]
    pub fn num_frames(&self) -> u32 {
        self.num_frames
    }

    #[inline]
    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    #[inline]
    pub fn frame_headroom(&self) -> u32 {
        self.frame_headroom
    }

    /// The largest payload a frame can carry after its headroom.
    #[inline]
    pub fn payload_capacity(&self) -> u32 {
        self.frame_size - self.frame_headroom
    }

    /// A descriptor is well formed if its frame index is in bounds and
    /// its payload lies within a single frame.
    #[inline]
    pub(crate) fn is_desc_valid(&self, desc: &FrameDesc) -> bool {
        desc.idx < self.num_frames
            && (desc.offset as u64 + desc.len as u64) <= self.frame_size as u64
    }

    #[inline]
    pub(crate) fn is_index_valid(&self, idx: u32) -> bool {
        idx < self.num_frames
    }
}

/// The data-path half of the fill ring. The user-facing producer is
/// stashed here until handed out as a [`FillQueue`].
struct FqState {
    cons: RingCons<u32>,
    user: Option<RingProd<u32>>,
    shared: Arc<RingShared>,
}

/// The data-path half of the completion ring, plus the count of
/// completion slots reserved for frames still held by the device.
struct CqState {
    prod: RingProd<u32>,
    reserved: u32,
    user: Option<RingCons<u32>>,
    shared: Arc<RingShared>,
}

/// A region of virtual contiguous memory divided into equal-sized frames,
/// together with the fill and completion rings through which frame
/// ownership moves between user and data path. It provides the underlying
/// working memory for one or more [`Socket`](crate::socket::Socket)s.
///
/// A `Umem` is shared by reference count: each socket bound to it holds an
/// `Arc` handle, and the frame region is unpinned and unmapped when the
/// last handle is dropped.
pub struct Umem {
    props: UmemProps,
    mem: UmemRegion,
    // The kernel-side ring halves sit behind spin locks: several sockets
    // sharing the UMEM drain one fill pool and feed one completion
    // stream, and the data path must not sleep.
    fq: spin::Mutex<Option<FqState>>,
    cq: spin::Mutex<Option<CqState>>,
}

impl std::fmt::Debug for Umem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Umem").field("props", &self.props).finish()
    }
}

impl Umem {
    /// Register `mem` as a frame pool, validating the geometry and
    /// pinning the pages.
    pub(crate) fn register(mem: UmemRegion, config: &UmemConfig) -> Result<Self> {
        let frame_size = config.frame_size().get();

        let len = mem.len();

        if len % frame_size as usize != 0 {
            return Err(Error::InvalidGeometry);
        }

        let num_frames = (len / frame_size as usize) as u32;

        if num_frames == 0 {
            return Err(Error::InvalidGeometry);
        }

        mem.lock_pages();

        Ok(Self {
            props: UmemProps::new(num_frames, frame_size, config.frame_headroom()),
            mem,
            fq: spin::Mutex::new(None),
            cq: spin::Mutex::new(None),
        })
    }

    #[inline]
    pub fn props(&self) -> UmemProps {
        self.props
    }

    /// Byte offset of frame `idx` within the region.
    #[inline]
    pub fn frame_address(&self, idx: u32) -> usize {
        idx as usize * self.props.frame_size as usize
    }

    /// Byte offset of frame `idx`'s packet data segment, past the
    /// headroom.
    #[inline]
    pub fn frame_address_with_headroom(&self, idx: u32) -> usize {
        self.frame_address(idx) + self.props.frame_headroom as usize
    }

    /// The whole of frame `idx`.
    ///
    /// # Safety
    ///
    /// The caller must currently own index `idx` (e.g. have consumed it
    /// from the RX or completion ring and not yet given it back) and must
    /// not hold this view across the point where ownership is handed over.
    #[inline]
    pub unsafe fn frame(&self, idx: u32) -> &[u8] {
        assert!(self.props.is_index_valid(idx));

        self.mem
            .read(self.frame_address(idx), self.props.frame_size as usize)
    }

    /// A mutable view of frame `idx`, for filling transmit payloads.
    ///
    /// # Safety
    ///
    /// As for [`frame`](Self::frame), and additionally no other view of
    /// the frame may exist for the lifetime of the returned slice.
    #[inline]
    pub unsafe fn frame_mut(&self, idx: u32) -> &mut [u8] {
        assert!(self.props.is_index_valid(idx));

        self.mem
            .slice_mut(self.frame_address(idx), self.props.frame_size as usize)
    }

    /// The payload a received descriptor points at.
    ///
    /// # Safety
    ///
    /// As for [`frame`](Self::frame); the descriptor must have been
    /// consumed from this UMEM's RX ring.
    #[inline]
    pub unsafe fn frame_data(&self, desc: &FrameDesc) -> &[u8] {
        assert!(self.props.is_desc_valid(desc));

        self.mem.read(
            self.frame_address(desc.idx) + desc.offset as usize,
            desc.len as usize,
        )
    }

    /// Copy a received payload into frame `idx` past its headroom.
    pub(crate) fn write_frame_with_headroom(&self, idx: u32, data: &[u8]) {
        debug_assert!(data.len() <= self.props.payload_capacity() as usize);

        // SAFETY: the caller peeked `idx` off the fill ring, so the data
        // path owns the frame until the RX descriptor is published.
        unsafe {
            self.mem.write(self.frame_address_with_headroom(idx), data);
        }
    }

    /// Copy `len` payload bytes out of the region at `addr`, for handing
    /// to a device.
    pub(crate) fn copy_from_frame(&self, addr: usize, len: usize) -> Vec<u8> {
        // SAFETY: the caller consumed a validated TX descriptor, so the
        // data path owns the frame until its completion is published.
        unsafe { self.mem.read(addr, len).to_vec() }
    }

    /// Attach the fill ring. May be done exactly once.
    pub(crate) fn attach_fq(&self, size: QueueSize) -> Result<()> {
        let mut fq = self.fq.lock();

        if fq.is_some() {
            return Err(Error::InvalidArgument);
        }

        let (prod, cons) = ring::pair::<u32>(size)?;
        let shared = prod.shared().clone();

        *fq = Some(FqState {
            cons,
            user: Some(prod),
            shared,
        });

        Ok(())
    }

    /// Attach the completion ring. May be done exactly once.
    pub(crate) fn attach_cq(&self, size: QueueSize) -> Result<()> {
        let mut cq = self.cq.lock();

        if cq.is_some() {
            return Err(Error::InvalidArgument);
        }

        let (prod, cons) = ring::pair::<u32>(size)?;
        let shared = prod.shared().clone();

        *cq = Some(CqState {
            prod,
            reserved: 0,
            user: Some(cons),
            shared,
        });

        Ok(())
    }

    /// Whether both the fill and completion rings are attached, which
    /// bind requires.
    pub(crate) fn validate_queues(&self) -> bool {
        self.fq.lock().is_some() && self.cq.lock().is_some()
    }

    pub(crate) fn take_fill_user(&self) -> Option<RingProd<u32>> {
        self.fq.lock().as_mut().and_then(|fq| fq.user.take())
    }

    pub(crate) fn take_comp_user(&self) -> Option<RingCons<u32>> {
        self.cq.lock().as_mut().and_then(|cq| cq.user.take())
    }

    pub(crate) fn fq_shared(&self) -> Option<Arc<RingShared>> {
        self.fq.lock().as_ref().map(|fq| fq.shared.clone())
    }

    pub(crate) fn cq_shared(&self) -> Option<Arc<RingShared>> {
        self.cq.lock().as_ref().map(|cq| cq.shared.clone())
    }

    /// Run `f` against the fill ring's consumer side, holding the fill
    /// lock for the duration so a peeked index cannot be interleaved with
    /// another socket's peek.
    pub(crate) fn with_fill_consumer<R>(
        &self,
        f: impl FnOnce(&mut RingCons<u32>, &UmemProps) -> R,
    ) -> Option<R> {
        let mut fq = self.fq.lock();

        fq.as_mut().map(|fq| f(&mut fq.cons, &self.props))
    }

    /// Reserve one completion slot for a frame about to be handed to the
    /// device. Fails with [`WouldBlock`](Error::WouldBlock) if the ring
    /// cannot absorb every outstanding completion plus this one.
    pub(crate) fn reserve_completion(&self) -> Result<()> {
        let mut cq = self.cq.lock();

        let cq = cq.as_mut().ok_or(Error::InvalidState)?;

        let want = cq.reserved + 1;

        if cq.prod.nb_free(want) < want {
            return Err(Error::WouldBlock);
        }

        cq.reserved = want;

        Ok(())
    }

    /// Return an unused completion reservation.
    pub(crate) fn cancel_completion(&self) {
        if let Some(cq) = self.cq.lock().as_mut() {
            cq.reserved = cq.reserved.saturating_sub(1);
        }
    }

    /// Publish `idx` on the completion ring, consuming its reservation.
    /// Invoked by the completion token when the device frame is
    /// destroyed.
    pub(crate) fn complete(&self, idx: u32) {
        let mut cq = self.cq.lock();

        let cq = match cq.as_mut() {
            Some(cq) => cq,
            None => {
                error!("completion for frame {} but no completion ring", idx);
                return;
            }
        };

        cq.reserved = cq.reserved.saturating_sub(1);

        let mut pos = 0;
        if cq.prod.reserve(1, &mut pos) == 0 {
            // Unreachable while every in-flight frame holds a reservation.
            error!("completion ring full, frame index {} lost", idx);
            return;
        }

        cq.prod.write(pos, idx);

        if let Err(e) = cq.prod.submit(1) {
            error!("failed to publish completion for frame {}: {}", idx, e);
        }
    }
}
