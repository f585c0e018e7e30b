//! An in-process implementation of the core machinery behind AF_XDP
//! sockets: the single-producer/single-consumer descriptor rings, the
//! UMEM frame pool with its fill and completion rings, and the
//! [`Socket`] object binding a UMEM to a device queue.
//!
//! The XDP data path delivers frames through [`Socket::receive`], which
//! draws a free frame index off the fill ring, copies the payload into
//! the UMEM and publishes a descriptor on the RX ring. Userspace holds
//! the other side of each ring through the [`RxQueue`], [`TxQueue`],
//! [`FillQueue`](umem::FillQueue) and [`CompQueue`](umem::CompQueue)
//! views, or maps a ring's backing pages directly via [`Socket::mmap`].
//!
//! Ownership of a frame index moves through exactly one ring at a time:
//! fill ring (user to data path), RX ring (back to user with payload),
//! TX ring (user to data path) and completion ring (back to user once
//! the device is done). Submitting an index to two rings at once is not
//! detected and is undefined behaviour at the payload level.

pub mod config;
pub mod dev;
mod error;
pub mod family;
mod ring;
pub mod socket;
pub mod umem;
mod util;

pub use error::{Error, Result};
pub use family::{Caps, SocketId, PF_XDP};
pub use ring::{
    FrameDesc, RingMapping, RING_CONSUMER_OFFSET, RING_DESC_OFFSET, RING_PRODUCER_OFFSET,
    XDP_PGOFF_RX_RING, XDP_PGOFF_TX_RING, XDP_UMEM_PGOFF_COMPLETION_RING,
    XDP_UMEM_PGOFF_FILL_RING,
};
pub use socket::{RxQueue, Socket, TxQueue, XdpStatistics, TX_BATCH_SIZE};
pub use umem::{Umem, UmemProps, UmemRegion};
