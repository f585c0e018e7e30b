//! The process-wide protocol family record.
//!
//! Creating a socket registers it here under a small integer id, the way
//! a socket gets a file descriptor; the id is what another socket names
//! in a shared-UMEM bind. The table holds weak handles only, so a
//! socket's lifetime is governed entirely by its owners.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, OnceLock, Weak,
    },
};

use bitflags::bitflags;

use crate::{
    error::{Error, Result},
    socket::Socket,
};

/// The address family value identifying this socket family, shared with
/// the XDP program-to-map binding used by the driver.
pub const PF_XDP: u16 = libc::AF_XDP as u16;

bitflags! {
    /// The caller's effective capability set, checked at socket creation.
    pub struct Caps: u64 {
        /// Permission to use raw network facilities.
        const NET_RAW = 1 << 13;
    }
}

/// The id under which a socket is registered with the family; the
/// reference another socket presents to inherit its UMEM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(u32);

impl SocketId {
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }
}

struct Family {
    sockets: Mutex<HashMap<u32, Weak<Socket>>>,
    next_id: AtomicU32,
}

fn family() -> &'static Family {
    static FAMILY: OnceLock<Family> = OnceLock::new();

    FAMILY.get_or_init(|| Family {
        sockets: Mutex::new(HashMap::new()),
        // Ids start away from zero so an uninitialised id never resolves.
        next_id: AtomicU32::new(1),
    })
}

pub(crate) fn allocate_id() -> SocketId {
    SocketId(family().next_id.fetch_add(1, Ordering::Relaxed))
}

pub(crate) fn insert(id: SocketId, socket: &Arc<Socket>) {
    family()
        .sockets
        .lock()
        .unwrap()
        .insert(id.raw(), Arc::downgrade(socket));
}

pub(crate) fn remove(id: SocketId) {
    family().sockets.lock().unwrap().remove(&id.raw());
}

/// Resolve a socket id to a live socket.
pub(crate) fn lookup(id: SocketId) -> Result<Arc<Socket>> {
    family()
        .sockets
        .lock()
        .unwrap()
        .get(&id.raw())
        .and_then(Weak::upgrade)
        .ok_or(Error::NotFound)
}
