//! A minimal model of the network device side of the socket: enough to
//! resolve an ifindex to a device handle, hand frames to a transmit
//! implementation and have received frames carry their originating queue.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock,
    },
};

use crate::{
    error::{Error, Result},
    umem::Umem,
};

/// The device's disposition of a frame handed to
/// [`Driver::direct_xmit`]. The frame object is consumed in every case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxVerdict {
    /// The frame was queued for transmission.
    Sent,
    /// The frame was taken but the device signalled congestion. Treated
    /// as sent, since ownership has already transferred.
    Congested,
    /// The device dropped the frame.
    Dropped,
    /// The device queue was busy.
    Busy,
}

/// The transmit side of a device. Implementations receive ownership of
/// each [`TxFrame`]; destroying the frame publishes its completion.
pub trait Driver: Send + Sync {
    fn direct_xmit(&self, frame: TxFrame, queue_id: u32) -> TxVerdict;
}

/// A network device, registered in the process-wide device table and
/// handed out by reference count. A socket holds a handle for the
/// duration of a bind.
pub struct NetDevice {
    ifindex: u32,
    name: String,
    mtu: u32,
    num_rx_queues: u32,
    up: AtomicBool,
    driver: Box<dyn Driver>,
}

impl std::fmt::Debug for NetDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetDevice")
            .field("ifindex", &self.ifindex)
            .field("name", &self.name)
            .field("mtu", &self.mtu)
            .field("num_rx_queues", &self.num_rx_queues)
            .field("up", &self.up)
            .finish()
    }
}

impl NetDevice {
    pub fn new(
        ifindex: u32,
        name: impl Into<String>,
        mtu: u32,
        num_rx_queues: u32,
        driver: Box<dyn Driver>,
    ) -> Self {
        Self {
            ifindex,
            name: name.into(),
            mtu,
            num_rx_queues,
            up: AtomicBool::new(true),
            driver,
        }
    }

    #[inline]
    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    #[inline]
    pub fn num_rx_queues(&self) -> u32 {
        self.num_rx_queues
    }

    #[inline]
    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Relaxed)
    }

    /// Administratively raise or lower the device.
    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::Relaxed);
    }

    pub(crate) fn direct_xmit(&self, frame: TxFrame, queue_id: u32) -> TxVerdict {
        self.driver.direct_xmit(frame, queue_id)
    }
}

fn devices() -> &'static Mutex<HashMap<u32, Arc<NetDevice>>> {
    static DEVICES: OnceLock<Mutex<HashMap<u32, Arc<NetDevice>>>> = OnceLock::new();

    DEVICES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Add a device to the process-wide table, making its ifindex resolvable
/// by [`get_by_index`].
pub fn register(dev: NetDevice) -> Result<Arc<NetDevice>> {
    let mut table = devices().lock().unwrap();

    if table.contains_key(&dev.ifindex) {
        return Err(Error::AlreadyRegistered);
    }

    let dev = Arc::new(dev);
    table.insert(dev.ifindex, dev.clone());

    Ok(dev)
}

/// Resolve an ifindex to a device handle.
pub fn get_by_index(ifindex: u32) -> Result<Arc<NetDevice>> {
    devices()
        .lock()
        .unwrap()
        .get(&ifindex)
        .cloned()
        .ok_or(Error::NoSuchDevice)
}

/// Remove a device from the table. Sockets already bound keep their
/// handles; the device is destroyed when the last one drops it.
pub fn unregister(ifindex: u32) -> Result<()> {
    devices()
        .lock()
        .unwrap()
        .remove(&ifindex)
        .map(|_| ())
        .ok_or(Error::NoSuchDevice)
}

/// A frame delivered by the XDP data path to
/// [`receive`](crate::socket::Socket::receive): the payload together with
/// the device queue it arrived on.
pub struct RxFrame<'a> {
    dev: Arc<NetDevice>,
    queue_id: u32,
    data: &'a [u8],
}

impl<'a> RxFrame<'a> {
    pub fn new(dev: &Arc<NetDevice>, queue_id: u32, data: &'a [u8]) -> Self {
        Self {
            dev: dev.clone(),
            queue_id,
            data,
        }
    }

    #[inline]
    pub fn dev(&self) -> &Arc<NetDevice> {
        &self.dev
    }

    #[inline]
    pub fn queue_id(&self) -> u32 {
        self.queue_id
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        self.data
    }
}

/// A transient per-packet object handed to the device for transmission:
/// an owned copy of the payload plus the completion token that returns
/// the originating UMEM frame on the completion ring.
pub struct TxFrame {
    data: Vec<u8>,
    _token: CompletionToken,
}

impl TxFrame {
    pub(crate) fn new(data: Vec<u8>, token: CompletionToken) -> Self {
        Self {
            data,
            _token: token,
        }
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Completion metadata attached to a [`TxFrame`]. Dropping the token —
/// which happens when the device destroys the frame object, however it
/// disposed of it — publishes the frame index on the owning UMEM's
/// completion ring.
pub struct CompletionToken {
    umem: Arc<Umem>,
    idx: u32,
}

impl CompletionToken {
    pub(crate) fn new(umem: Arc<Umem>, idx: u32) -> Self {
        Self { umem, idx }
    }
}

impl Drop for CompletionToken {
    fn drop(&mut self) {
        self.umem.complete(self.idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullDriver;

    impl Driver for NullDriver {
        fn direct_xmit(&self, _frame: TxFrame, _queue_id: u32) -> TxVerdict {
            TxVerdict::Sent
        }
    }

    #[test]
    fn ifindex_resolution_follows_the_table() {
        assert_eq!(get_by_index(90001).unwrap_err(), Error::NoSuchDevice);

        let dev = register(NetDevice::new(90001, "model0", 1500, 4, Box::new(NullDriver)))
            .expect("register failed");

        assert_eq!(
            register(NetDevice::new(90001, "model0", 1500, 4, Box::new(NullDriver))).unwrap_err(),
            Error::AlreadyRegistered
        );

        let found = get_by_index(90001).unwrap();
        assert!(Arc::ptr_eq(&dev, &found));
        assert_eq!(found.name(), "model0");

        unregister(90001).unwrap();
        assert_eq!(get_by_index(90001).unwrap_err(), Error::NoSuchDevice);

        // Held handles outlive the table entry.
        assert_eq!(dev.mtu(), 1500);
    }

    #[test]
    fn devices_start_up_and_may_be_lowered() {
        let dev = NetDevice::new(90002, "model1", 1500, 1, Box::new(NullDriver));

        assert!(dev.is_up());
        dev.set_up(false);
        assert!(!dev.is_up());
    }
}
