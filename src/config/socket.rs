use bitflags::bitflags;

use crate::family::{SocketId, PF_XDP};

bitflags! {
    /// Flags accepted by [`bind`](crate::socket::Socket::bind).
    pub struct BindFlags: u16 {
        /// Inherit the UMEM of the socket named by
        /// [`SockAddrXdp::shared_umem`].
        const XDP_SHARED_UMEM = 1;
    }
}

bitflags! {
    /// Flags accepted by [`sendmsg`](crate::socket::Socket::sendmsg).
    pub struct SendFlags: u32 {
        /// Do not wait for ring or device space. This family only supports
        /// non-blocking sends, so the flag is mandatory.
        const MSG_DONTWAIT = 1;
    }
}

/// The bind address of an XDP socket: a device queue, plus optionally the
/// socket whose UMEM should be inherited.
#[derive(Debug, Clone, Copy)]
pub struct SockAddrXdp {
    pub family: u16,
    pub ifindex: u32,
    pub queue_id: u32,
    pub flags: BindFlags,
    pub shared_umem: Option<SocketId>,
}

impl SockAddrXdp {
    /// An address binding to `queue_id` on the device at `ifindex`, using
    /// the socket's own UMEM.
    pub fn new(ifindex: u32, queue_id: u32) -> Self {
        Self {
            family: PF_XDP,
            ifindex,
            queue_id,
            flags: BindFlags::empty(),
            shared_umem: None,
        }
    }

    /// An address binding to `queue_id` on the device at `ifindex`,
    /// inheriting the UMEM owned by `owner`.
    pub fn shared(ifindex: u32, queue_id: u32, owner: SocketId) -> Self {
        Self {
            family: PF_XDP,
            ifindex,
            queue_id,
            flags: BindFlags::XDP_SHARED_UMEM,
            shared_umem: Some(owner),
        }
    }
}
