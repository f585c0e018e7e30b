//! Types for creating and using an XDP [`Socket`].

mod poll;
pub use poll::Readiness;
use poll::Waiter;

mod rx_queue;
pub use rx_queue::RxQueue;

mod tx_queue;
pub use tx_queue::TxQueue;

use log::debug;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, Weak,
};

use crate::{
    config::{BindFlags, QueueSize, SendFlags, SockAddrXdp, UmemConfig},
    dev::{self, CompletionToken, NetDevice, RxFrame, TxFrame, TxVerdict},
    error::{Error, Result},
    family::{self, Caps, SocketId, PF_XDP},
    ring::{
        self, FrameDesc, RingCons, RingMapping, RingProd, RingShared, XDP_PGOFF_RX_RING,
        XDP_PGOFF_TX_RING, XDP_UMEM_PGOFF_COMPLETION_RING, XDP_UMEM_PGOFF_FILL_RING,
    },
    umem::{CompQueue, FillQueue, Umem, UmemRegion},
};

/// The most TX descriptors a single [`sendmsg`](Socket::sendmsg) call
/// will drain.
pub const TX_BATCH_SIZE: u32 = 16;

/// Per-socket counters, readable via [`statistics`](Socket::statistics).
#[derive(Debug, Default, Clone, Copy)]
pub struct XdpStatistics {
    rx_dropped: u64,
    rx_invalid_descs: u64,
    tx_invalid_descs: u64,
}

impl XdpStatistics {
    /// Received frames dropped on ingress for any reason (fill ring
    /// empty, RX ring full, misrouted or oversize frames).
    #[inline]
    pub fn rx_dropped(&self) -> u64 {
        self.rx_dropped
    }

    /// Malformed descriptors rejected on the RX ring.
    #[inline]
    pub fn rx_invalid_descs(&self) -> u64 {
        self.rx_invalid_descs
    }

    /// Malformed descriptors rejected while draining the TX ring.
    #[inline]
    pub fn tx_invalid_descs(&self) -> u64 {
        self.tx_invalid_descs
    }
}

/// The socket's RX ring: the user-side consumer is stashed until handed
/// out as an [`RxQueue`]; the data-path producer lives in
/// `Socket::rx_prod`.
struct RxRingState {
    user: Option<RingCons<FrameDesc>>,
    shared: Arc<RingShared>,
}

/// The socket's TX ring: the user-side producer is stashed until handed
/// out as a [`TxQueue`]; the consumer is drained by `sendmsg` under the
/// socket mutex.
struct TxRingState {
    user: Option<RingProd<FrameDesc>>,
    cons: RingCons<FrameDesc>,
    shared: Arc<RingShared>,
}

/// Configuration state, guarded by the socket mutex.
struct State {
    umem: Option<Arc<Umem>>,
    rx: Option<RxRingState>,
    tx: Option<TxRingState>,
    dev: Option<Arc<NetDevice>>,
    queue_id: u32,
}

/// The snapshot of a successful bind that the XDP data path reads. Held
/// behind a reader/writer spin lock: `receive` takes the read side,
/// while rebind and release take the write side, which doubles as the
/// wait for in-flight data-path calls to drain before the device handle
/// is dropped.
struct Binding {
    dev: Arc<NetDevice>,
    queue_id: u32,
    umem: Arc<Umem>,
}

/// An XDP socket: the endpoint binding a [`Umem`] to a device queue.
///
/// A socket starts out fresh, accumulates rings and a UMEM through the
/// configuration calls, and becomes active once [`bind`](Socket::bind)
/// succeeds. From then on the XDP data path feeds it received frames via
/// [`receive`](Socket::receive) and userspace drains and refills the
/// rings through the queue views.
pub struct Socket {
    id: SocketId,
    // Handed to the queue views, which need to reach back for polls and
    // kicks.
    self_ref: Weak<Socket>,
    state: Mutex<State>,
    binding: spin::RwLock<Option<Binding>>,
    rx_prod: spin::Mutex<Option<RingProd<FrameDesc>>>,
    rx_dropped: AtomicU64,
    waiter: Waiter,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket").field("id", &self.id).finish()
    }
}

impl Socket {
    /// Create a fresh socket and register it with the protocol family.
    ///
    /// Fails with [`NotPermitted`](Error::NotPermitted) unless `caps`
    /// includes the raw-network capability.
    pub fn new(caps: Caps) -> Result<Arc<Self>> {
        if !caps.contains(Caps::NET_RAW) {
            return Err(Error::NotPermitted);
        }

        let id = family::allocate_id();

        let socket = Arc::new_cyclic(|weak| Socket {
            id,
            self_ref: weak.clone(),
            state: Mutex::new(State {
                umem: None,
                rx: None,
                tx: None,
                dev: None,
                queue_id: 0,
            }),
            binding: spin::RwLock::new(None),
            rx_prod: spin::Mutex::new(None),
            rx_dropped: AtomicU64::new(0),
            waiter: Waiter::new(),
        });

        family::insert(id, &socket);

        Ok(socket)
    }

    fn handle(&self) -> Arc<Socket> {
        self.self_ref
            .upgrade()
            .expect("socket is alive while borrowed")
    }

    /// The id under which this socket is registered with the family; the
    /// reference another socket passes to inherit this socket's UMEM.
    #[inline]
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Whether the socket can be the target of an XDP redirect, i.e. has
    /// an RX ring.
    pub fn is_setup_for_redirect(&self) -> bool {
        self.state.lock().unwrap().rx.is_some()
    }

    /// This socket's UMEM handle, if one is registered or inherited.
    pub fn umem(&self) -> Option<Arc<Umem>> {
        self.state.lock().unwrap().umem.clone()
    }

    // ---- Configuration ----------------------------------------------

    /// Create the RX ring with `entries` slots.
    pub fn rx_ring(&self, entries: u32) -> Result<()> {
        let size = QueueSize::new(entries)?;

        let mut state = self.state.lock().unwrap();

        if state.rx.is_some() {
            return Err(Error::InvalidArgument);
        }

        let (prod, cons) = ring::pair::<FrameDesc>(size)?;
        let shared = prod.shared().clone();

        *self.rx_prod.lock() = Some(prod);
        state.rx = Some(RxRingState {
            user: Some(cons),
            shared,
        });

        Ok(())
    }

    /// Create the TX ring with `entries` slots.
    pub fn tx_ring(&self, entries: u32) -> Result<()> {
        let size = QueueSize::new(entries)?;

        let mut state = self.state.lock().unwrap();

        if state.tx.is_some() {
            return Err(Error::InvalidArgument);
        }

        let (prod, cons) = ring::pair::<FrameDesc>(size)?;
        let shared = prod.shared().clone();

        state.tx = Some(TxRingState {
            user: Some(prod),
            cons,
            shared,
        });

        Ok(())
    }

    /// Register `mem` as this socket's UMEM. A socket registers at most
    /// one UMEM, ever.
    pub fn umem_reg(&self, mem: UmemRegion, config: &UmemConfig) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        if state.umem.is_some() {
            return Err(Error::AlreadyRegistered);
        }

        let umem = Umem::register(mem, config)?;

        state.umem = Some(Arc::new(umem));

        Ok(())
    }

    /// Create the registered UMEM's fill ring with `entries` slots.
    pub fn umem_fill_ring(&self, entries: u32) -> Result<()> {
        let size = QueueSize::new(entries)?;

        let state = self.state.lock().unwrap();

        let umem = state.umem.as_ref().ok_or(Error::InvalidState)?;

        umem.attach_fq(size)
    }

    /// Create the registered UMEM's completion ring with `entries` slots.
    pub fn umem_completion_ring(&self, entries: u32) -> Result<()> {
        let size = QueueSize::new(entries)?;

        let state = self.state.lock().unwrap();

        let umem = state.umem.as_ref().ok_or(Error::InvalidState)?;

        umem.attach_cq(size)
    }

    /// Read the socket's counters.
    pub fn statistics(&self) -> XdpStatistics {
        let state = self.state.lock().unwrap();

        XdpStatistics {
            rx_dropped: self.rx_dropped.load(Ordering::Relaxed),
            rx_invalid_descs: state
                .rx
                .as_ref()
                .map(|rx| rx.shared.invalid_descs())
                .unwrap_or(0),
            tx_invalid_descs: state
                .tx
                .as_ref()
                .map(|tx| tx.shared.invalid_descs())
                .unwrap_or(0),
        }
    }

    // ---- Queue views ------------------------------------------------

    /// Take the user side of the RX ring. Available once per ring.
    pub fn rx_queue(&self) -> Result<RxQueue> {
        let mut state = self.state.lock().unwrap();

        let cons = state
            .rx
            .as_mut()
            .and_then(|rx| rx.user.take())
            .ok_or(Error::InvalidState)?;

        Ok(RxQueue::new(cons, self.handle()))
    }

    /// Take the user side of the TX ring. Available once per ring.
    pub fn tx_queue(&self) -> Result<TxQueue> {
        let mut state = self.state.lock().unwrap();

        let prod = state
            .tx
            .as_mut()
            .and_then(|tx| tx.user.take())
            .ok_or(Error::InvalidState)?;

        Ok(TxQueue::new(prod, self.handle()))
    }

    /// Take the user side of the UMEM's fill ring. Available once per
    /// ring.
    pub fn fill_queue(&self) -> Result<FillQueue> {
        let state = self.state.lock().unwrap();

        let umem = state.umem.as_ref().ok_or(Error::InvalidState)?;

        let prod = umem.take_fill_user().ok_or(Error::InvalidState)?;

        Ok(FillQueue::new(prod, umem.clone()))
    }

    /// Take the user side of the UMEM's completion ring. Available once
    /// per ring.
    pub fn comp_queue(&self) -> Result<CompQueue> {
        let state = self.state.lock().unwrap();

        let umem = state.umem.as_ref().ok_or(Error::InvalidState)?;

        let cons = umem.take_comp_user().ok_or(Error::InvalidState)?;

        Ok(CompQueue::new(cons, umem.clone()))
    }

    // ---- Bind and release -------------------------------------------

    /// Bind the socket to the device queue named by `addr`, after which
    /// the ring publication guarantees are in force.
    ///
    /// Binding again to the identical `(device, queue_id)` is a no-op.
    /// Rebinding to a different queue synchronizes with the driver before
    /// the previous device handle is released.
    pub fn bind(&self, addr: &SockAddrXdp) -> Result<()> {
        if addr.family != PF_XDP {
            return Err(Error::InvalidArgument);
        }

        let mut state = self.state.lock().unwrap();

        let dev = dev::get_by_index(addr.ifindex)?;

        if state.rx.is_none() && state.tx.is_none() {
            return Err(Error::InvalidState);
        }

        if addr.queue_id >= dev.num_rx_queues() {
            return Err(Error::InvalidQueue);
        }

        if let Some(cur) = &state.dev {
            if Arc::ptr_eq(cur, &dev) && state.queue_id == addr.queue_id {
                // Same queue again: drop the freshly resolved handle and
                // leave the binding untouched.
                return Ok(());
            }
        }

        let umem = if addr.flags.contains(BindFlags::XDP_SHARED_UMEM) {
            if state.umem.is_some() {
                // We have already our own.
                return Err(Error::InvalidArgument);
            }

            let owner_id = addr.shared_umem.ok_or(Error::BadDescriptor)?;

            if owner_id == self.id {
                // A socket cannot inherit from itself.
                return Err(Error::BadDescriptor);
            }

            let owner = family::lookup(owner_id)?;
            let owner_state = owner.state.lock().unwrap();

            let umem = owner_state.umem.clone().ok_or(Error::BadDescriptor)?;

            match &owner_state.dev {
                Some(owner_dev)
                    if Arc::ptr_eq(owner_dev, &dev) && owner_state.queue_id == addr.queue_id => {}
                _ => return Err(Error::InvalidArgument),
            }

            umem
        } else {
            let umem = state.umem.clone().ok_or(Error::InvalidState)?;

            if !umem.validate_queues() {
                return Err(Error::InvalidGeometry);
            }

            umem
        };

        // Rebind: wait for the driver to stop using the socket, then let
        // go of the previous device and any UMEM being replaced.
        if state.dev.is_some() {
            let old = self.binding.write().take();
            drop(old);

            let old_dev = state.dev.take();
            let old_umem = state.umem.take();
            drop(old_dev);
            drop(old_umem);
        }

        state.dev = Some(dev.clone());
        state.queue_id = addr.queue_id;
        state.umem = Some(umem.clone());

        *self.binding.write() = Some(Binding {
            dev: dev.clone(),
            queue_id: addr.queue_id,
            umem,
        });

        debug!(
            "socket {} bound to {} queue {}",
            self.id.raw(),
            dev.name(),
            addr.queue_id
        );

        Ok(())
    }

    /// Leave the bound state, waiting for the driver to stop using the
    /// socket before the device handle is dropped, and unregister from
    /// the family. Not cancellable once started.
    pub fn release(&self) {
        let mut state = self.state.lock().unwrap();

        if state.dev.is_some() {
            let old = self.binding.write().take();
            drop(old);

            state.dev = None;

            debug!("socket {} released", self.id.raw());
        }

        family::remove(self.id);
    }

    // ---- Ingress ----------------------------------------------------

    /// Deliver a frame from the XDP data path, deferring RX publication
    /// until [`flush`](Socket::flush) so a NAPI pass can amortize the
    /// wake-up over a batch.
    ///
    /// The payload is copied into a UMEM frame drawn from the fill ring
    /// and a descriptor for it is staged on the RX ring. Every failure
    /// increments the `rx_dropped` counter and leaves the rings
    /// unchanged.
    pub fn receive(&self, frame: &RxFrame) -> Result<()> {
        let res = self.do_receive(frame);

        if res.is_err() {
            self.rx_dropped.fetch_add(1, Ordering::Relaxed);
        }

        res
    }

    /// Deliver a frame and immediately publish it, waking poll waiters.
    pub fn receive_and_flush(&self, frame: &RxFrame) -> Result<()> {
        let res = self.receive(frame);

        if res.is_ok() {
            self.flush();
        }

        res
    }

    /// Publish every staged RX descriptor and wake poll waiters.
    pub fn flush(&self) {
        if let Some(rx) = self.rx_prod.lock().as_mut() {
            rx.submit_all();
        }

        self.waiter.notify();
    }

    fn do_receive(&self, frame: &RxFrame) -> Result<()> {
        let binding = self.binding.read();
        let binding = binding.as_ref().ok_or(Error::InvalidState)?;

        if !Arc::ptr_eq(&binding.dev, frame.dev()) || binding.queue_id != frame.queue_id() {
            return Err(Error::Misrouted);
        }

        let umem = &binding.umem;
        let len = frame.data().len();

        if len > umem.props().payload_capacity() as usize {
            return Err(Error::TooLarge);
        }

        umem.with_fill_consumer(|fq, props| {
            let idx = match fq.peek_index(props) {
                Some(idx) => idx,
                None => return Err(Error::NoFillBuffer),
            };

            umem.write_frame_with_headroom(idx, frame.data());

            let mut rx_prod = self.rx_prod.lock();

            let rx = match rx_prod.as_mut() {
                Some(rx) => rx,
                None => {
                    fq.cancel(1);
                    return Err(Error::InvalidState);
                }
            };

            let mut pos = 0;
            if rx.reserve(1, &mut pos) == 0 {
                fq.cancel(1);
                return Err(Error::WouldBlock);
            }

            rx.write(
                pos,
                FrameDesc {
                    idx,
                    len: len as u32,
                    offset: props.frame_headroom(),
                },
            );

            fq.release(1);

            Ok(())
        })
        .unwrap_or(Err(Error::InvalidState))
    }

    // ---- Egress -----------------------------------------------------

    /// Drain the TX ring into the bound device.
    ///
    /// Strictly non-blocking: `flags` must include
    /// [`MSG_DONTWAIT`](SendFlags::MSG_DONTWAIT) or the call fails with
    /// [`NotSupported`](Error::NotSupported). At most
    /// [`TX_BATCH_SIZE`] descriptors are drained per call; if more
    /// remain, the call fails with [`WouldBlock`](Error::WouldBlock) and
    /// should be repeated.
    pub fn sendmsg(&self, flags: SendFlags) -> Result<()> {
        if !flags.contains(SendFlags::MSG_DONTWAIT) {
            return Err(Error::NotSupported);
        }

        let mut state = self.state.lock().unwrap();

        let dev = state.dev.clone().ok_or(Error::InvalidState)?;

        if !dev.is_up() {
            return Err(Error::DeviceDown);
        }

        self.xmit(&mut state, &dev, TX_BATCH_SIZE)
    }

    /// The egress drain. Serialized by the socket mutex, which the
    /// caller holds; a racing rebind cannot pull the device out from
    /// under it.
    fn xmit(&self, state: &mut State, dev: &Arc<NetDevice>, batch: u32) -> Result<()> {
        let umem = state.umem.clone().ok_or(Error::InvalidState)?;
        let queue_id = state.queue_id;

        let tx = state.tx.as_mut().ok_or(Error::InvalidState)?;

        let props = umem.props();
        let mut sent = false;
        let mut drained = 0;
        let mut result = Ok(());

        loop {
            if drained == batch {
                // More descriptors may remain; the caller retries.
                if tx.cons.nb_avail(1) > 0 {
                    result = Err(Error::WouldBlock);
                }
                break;
            }

            let desc = match tx.cons.peek_desc(&props) {
                Some(desc) => desc,
                None => break,
            };

            if let Err(e) = umem.reserve_completion() {
                tx.cons.cancel(1);
                result = Err(e);
                break;
            }

            if desc.len > dev.mtu() {
                // Release the completion reservation and leave the
                // descriptor at the head.
                umem.cancel_completion();
                tx.cons.cancel(1);
                result = Err(Error::TooLarge);
                break;
            }

            let addr = umem.frame_address(desc.idx) + desc.offset as usize;
            let payload = umem.copy_from_frame(addr, desc.len as usize);

            let frame = TxFrame::new(payload, CompletionToken::new(umem.clone(), desc.idx));

            match dev.direct_xmit(frame, queue_id) {
                TxVerdict::Sent | TxVerdict::Congested => {
                    sent = true;
                    drained += 1;
                    tx.cons.release(1);
                }
                TxVerdict::Dropped | TxVerdict::Busy => {
                    // The device consumed the frame object; its token
                    // still returns the index on the completion ring.
                    tx.cons.release(1);
                    result = Err(Error::WouldBlock);
                    break;
                }
            }
        }

        if sent {
            self.waiter.notify();
        }

        result
    }

    // ---- Poll and unsupported operations ----------------------------

    /// The socket's current readiness.
    pub fn poll(&self) -> Readiness {
        let state = self.state.lock().unwrap();

        let mut readiness = Readiness::empty();

        if let Some(rx) = &state.rx {
            if !rx.shared.is_empty() {
                readiness |= Readiness::READABLE;
            }
        }

        if let Some(tx) = &state.tx {
            if !tx.shared.is_full() {
                readiness |= Readiness::WRITABLE;
            }
        }

        readiness
    }

    /// Wait until any of `events` is ready or `timeout_ms` elapses
    /// (negative: wait indefinitely). Returns the ready subset, which is
    /// empty on timeout.
    pub fn poll_wait(&self, events: Readiness, timeout_ms: i32) -> Readiness {
        let deadline = poll::deadline_from_ms(timeout_ms);

        loop {
            let snapshot = self.waiter.generation();

            let ready = self.poll() & events;
            if !ready.is_empty() {
                return ready;
            }

            if self.waiter.wait_change(snapshot, deadline) {
                return self.poll() & events;
            }
        }
    }

    /// Connection-oriented operations are not part of this family.
    pub fn connect(&self) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Connection-oriented operations are not part of this family.
    pub fn listen(&self) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Connection-oriented operations are not part of this family.
    pub fn accept(&self) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Reception happens through the RX ring, not message calls.
    pub fn recvmsg(&self) -> Result<()> {
        Err(Error::NotSupported)
    }

    // ---- Memory mapping ---------------------------------------------

    /// Map one of the socket's rings.
    ///
    /// `offset` selects the ring ([`XDP_PGOFF_RX_RING`],
    /// [`XDP_PGOFF_TX_RING`], [`XDP_UMEM_PGOFF_FILL_RING`] or
    /// [`XDP_UMEM_PGOFF_COMPLETION_RING`]); `len` must not exceed the
    /// ring's backing pages. Fails with
    /// [`InvalidArgument`](Error::InvalidArgument) for an unknown offset
    /// or a ring that has not been created.
    pub fn mmap(&self, offset: u64, len: usize) -> Result<RingMapping> {
        let state = self.state.lock().unwrap();

        let shared = match offset {
            XDP_PGOFF_RX_RING => state.rx.as_ref().map(|rx| rx.shared.clone()),
            XDP_PGOFF_TX_RING => state.tx.as_ref().map(|tx| tx.shared.clone()),
            XDP_UMEM_PGOFF_FILL_RING => {
                state.umem.as_ref().and_then(|umem| umem.fq_shared())
            }
            XDP_UMEM_PGOFF_COMPLETION_RING => {
                state.umem.as_ref().and_then(|umem| umem.cq_shared())
            }
            _ => return Err(Error::InvalidArgument),
        }
        .ok_or(Error::InvalidArgument)?;

        if len > shared.page_len() {
            return Err(Error::InvalidArgument);
        }

        Ok(RingMapping::new(shared, len))
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.release();
    }
}
