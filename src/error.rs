//! The error codes returned by every fallible operation in this crate.

use std::{error, fmt};

pub type Result<T> = std::result::Result<T, Error>;

/// A stable error code.
///
/// Configuration errors are returned synchronously to the caller. Errors on
/// the ingress data path are never surfaced directly; they increment the
/// per-socket counters readable via
/// [`statistics`](crate::socket::Socket::statistics).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Malformed argument, or an argument inconsistent with the socket's
    /// current configuration.
    InvalidArgument,
    /// Operation attempted in the wrong phase of the socket lifecycle.
    InvalidState,
    /// A UMEM is already registered on this socket.
    AlreadyRegistered,
    /// Ring capacity was zero or not a power of two.
    InvalidCapacity,
    /// UMEM geometry (frame size, headroom, region length) is unusable.
    InvalidGeometry,
    /// The queue id is not backed by the device.
    InvalidQueue,
    /// No device with the given ifindex exists.
    NoSuchDevice,
    /// The bound device is administratively down.
    DeviceDown,
    /// Backing memory could not be allocated.
    OutOfMemory,
    /// The fill ring was empty when a frame arrived.
    NoFillBuffer,
    /// A ring is full, or the device cannot take the frame right now.
    WouldBlock,
    /// A frame was delivered to a socket not bound to its originating
    /// device queue.
    Misrouted,
    /// Payload length exceeds what the device or frame can carry.
    TooLarge,
    /// The socket operation or flag is not supported by this family.
    NotSupported,
    /// The caller lacks the raw-network capability.
    NotPermitted,
    /// The shared-UMEM reference does not name a live socket.
    NotFound,
    /// The shared-UMEM reference names a socket without a UMEM.
    BadDescriptor,
    /// A ring descriptor failed validation.
    MalformedDescriptor,
    /// The producer tried to publish more entries than it had reserved.
    Overflow,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Error::*;
        let msg = match self {
            InvalidArgument => "invalid argument",
            InvalidState => "operation invalid in current socket state",
            AlreadyRegistered => "a UMEM is already registered",
            InvalidCapacity => "ring capacity must be a non-zero power of two",
            InvalidGeometry => "unusable UMEM geometry",
            InvalidQueue => "queue id out of range for device",
            NoSuchDevice => "no such device",
            DeviceDown => "device is down",
            OutOfMemory => "out of memory",
            NoFillBuffer => "fill ring empty",
            WouldBlock => "operation would block",
            Misrouted => "frame delivered to wrong socket",
            TooLarge => "payload too large",
            NotSupported => "operation not supported",
            NotPermitted => "operation not permitted",
            NotFound => "shared UMEM reference not found",
            BadDescriptor => "shared UMEM reference has no UMEM attached",
            MalformedDescriptor => "malformed ring descriptor",
            Overflow => "publish exceeds reserved ring entries",
        };
        write!(f, "{}", msg)
    }
}

impl error::Error for Error {}
