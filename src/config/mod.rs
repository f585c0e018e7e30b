//! [`Umem`](crate::umem::Umem) and [`Socket`](crate::socket::Socket)
//! configuration.

mod socket;
pub use socket::{BindFlags, SendFlags, SockAddrXdp};

mod umem;
pub use umem::Config as UmemConfig;

use std::convert::TryFrom;

use crate::{
    error::{Error, Result},
    util,
};

/// A ring's slot count. Must be a non-zero power of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSize(u32);

impl QueueSize {
    /// Create a new `QueueSize` instance. Fails with
    /// [`InvalidCapacity`](Error::InvalidCapacity) if `size` is zero or not
    /// a power of two.
    pub fn new(size: u32) -> Result<Self> {
        if !util::is_pow_of_two(size) {
            Err(Error::InvalidCapacity)
        } else {
            Ok(Self(size))
        }
    }

    /// The queue size.
    #[inline]
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for QueueSize {
    type Error = Error;

    fn try_from(size: u32) -> Result<Self> {
        QueueSize::new(size)
    }
}

/// The smallest frame a UMEM may be partitioned into.
pub const XDP_UMEM_MIN_FRAME_SIZE: u32 = 2048;

/// The largest frame a UMEM may be partitioned into (one page).
pub const XDP_UMEM_MAX_FRAME_SIZE: u32 = util::PAGE_SIZE as u32;

/// The size of a [`Umem`](crate::umem::Umem) frame. Must be a power of two
/// between 2048 and one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSize(u32);

impl FrameSize {
    /// Create a new `FrameSize` instance. Fails with
    /// [`InvalidGeometry`](Error::InvalidGeometry) if `size` is not a power
    /// of two in `2048..=4096`.
    pub fn new(size: u32) -> Result<Self> {
        if !util::is_pow_of_two(size)
            || size < XDP_UMEM_MIN_FRAME_SIZE
            || size > XDP_UMEM_MAX_FRAME_SIZE
        {
            Err(Error::InvalidGeometry)
        } else {
            Ok(Self(size))
        }
    }

    /// The frame size.
    #[inline]
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for FrameSize {
    type Error = Error;

    fn try_from(size: u32) -> Result<Self> {
        FrameSize::new(size)
    }
}
