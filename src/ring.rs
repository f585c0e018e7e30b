//! Single-producer/single-consumer rings shared between the user and
//! kernel sides of a socket.
//!
//! Each ring is a page-backed region holding a pair of monotonically
//! increasing 32-bit counters followed by a power-of-two slot array. The
//! producer and consumer sides hold separate typed views over the shared
//! region and cache both counters locally, re-reading the remote counter
//! (with acquire ordering) only when the cached view says the ring is full
//! or empty. Slot stores become visible before the producer counter store;
//! counter publication on either side uses release ordering.

use std::{
    fmt,
    marker::PhantomData,
    mem,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

use crate::{
    config::QueueSize,
    error::{Error, Result},
    umem::mem::Mmap,
    umem::UmemProps,
    util,
};

/// Page offset at which a socket's RX ring is mapped.
pub const XDP_PGOFF_RX_RING: u64 = libc::XDP_PGOFF_RX_RING as u64;

/// Page offset at which a socket's TX ring is mapped.
pub const XDP_PGOFF_TX_RING: u64 = libc::XDP_PGOFF_TX_RING as u64;

/// Page offset at which a UMEM's fill ring is mapped.
pub const XDP_UMEM_PGOFF_FILL_RING: u64 = libc::XDP_UMEM_PGOFF_FILL_RING as u64;

/// Page offset at which a UMEM's completion ring is mapped.
pub const XDP_UMEM_PGOFF_COMPLETION_RING: u64 = libc::XDP_UMEM_PGOFF_COMPLETION_RING as u64;

/// Byte offset of the producer counter within a mapped ring.
pub const RING_PRODUCER_OFFSET: usize = 0;

/// Byte offset of the consumer counter within a mapped ring. Kept a cache
/// line away from the producer so the two sides do not false-share.
pub const RING_CONSUMER_OFFSET: usize = 64;

/// Byte offset of the slot array within a mapped ring.
pub const RING_DESC_OFFSET: usize = 128;

/// A descriptor locating a payload within a UMEM frame, as carried by the
/// RX and TX rings.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameDesc {
    /// UMEM frame index.
    pub idx: u32,
    /// Payload length in bytes.
    pub len: u32,
    /// Byte offset of the payload from the start of the frame.
    pub offset: u32,
}

/// Types that may be carried in a ring slot: `u32` frame indices on the
/// UMEM rings, [`FrameDesc`] on the RX and TX rings.
pub(crate) trait Slot: Copy + Default {}

impl Slot for u32 {}
impl Slot for FrameDesc {}

/// The page-backed state shared by both sides of a ring.
#[derive(Debug)]
pub(crate) struct RingShared {
    mmap: Mmap,
    size: u32,
    mask: u32,
    slot_size: usize,
    invalid_descs: AtomicU64,
}

// SAFETY: the raw region is only ever accessed through the atomics below
// and through slot reads/writes whose ownership is handed over by those
// atomics.
unsafe impl Send for RingShared {}
unsafe impl Sync for RingShared {}

impl RingShared {
    fn new(size: QueueSize, slot_size: usize) -> Result<Self> {
        let len = util::page_align(RING_DESC_OFFSET + size.get() as usize * slot_size);

        // Anonymous mappings are zero-filled, so both counters start at 0.
        let mmap = Mmap::new(len, false)?;

        Ok(Self {
            mmap,
            size: size.get(),
            mask: size.get() - 1,
            slot_size,
            invalid_descs: AtomicU64::new(0),
        })
    }

    #[inline]
    fn producer(&self) -> &AtomicU32 {
        // SAFETY: the region is at least a page long and the counter
        // offsets are within it and well aligned.
        unsafe { &*(self.as_ptr().add(RING_PRODUCER_OFFSET) as *const AtomicU32) }
    }

    #[inline]
    fn consumer(&self) -> &AtomicU32 {
        // SAFETY: as for `producer`.
        unsafe { &*(self.as_ptr().add(RING_CONSUMER_OFFSET) as *const AtomicU32) }
    }

    /// Pointer to the slot backing logical position `pos`.
    ///
    /// # Safety
    ///
    /// The caller must own the slot at `pos`, i.e. have reserved it (as
    /// producer) or observed it published (as consumer).
    #[inline]
    unsafe fn slot_ptr<T: Slot>(&self, pos: u32) -> *mut T {
        debug_assert_eq!(mem::size_of::<T>(), self.slot_size);
        let base = self.as_ptr().add(RING_DESC_OFFSET) as *mut T;
        base.add((pos & self.mask) as usize)
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.mmap.addr().as_ptr() as *mut u8
    }

    #[inline]
    pub(crate) fn size(&self) -> u32 {
        self.size
    }

    /// Length of the backing pages; the upper bound for a memory mapping
    /// of this ring.
    #[inline]
    pub(crate) fn page_len(&self) -> usize {
        self.mmap.len()
    }

    /// Number of published but unconsumed entries.
    #[inline]
    pub(crate) fn entries(&self) -> u32 {
        self.producer()
            .load(Ordering::Acquire)
            .wrapping_sub(self.consumer().load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries() == 0
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.entries() == self.size
    }

    /// Count of descriptors rejected by the consumer-side validation.
    #[inline]
    pub(crate) fn invalid_descs(&self) -> u64 {
        self.invalid_descs.load(Ordering::Relaxed)
    }
}

/// Create both sides of a ring of `size` slots.
pub(crate) fn pair<T: Slot>(size: QueueSize) -> Result<(RingProd<T>, RingCons<T>)> {
    let shared = Arc::new(RingShared::new(size, mem::size_of::<T>())?);

    Ok((RingProd::new(shared.clone()), RingCons::new(shared)))
}

/// The producing side of a ring.
pub(crate) struct RingProd<T> {
    shared: Arc<RingShared>,
    cached_prod: u32,
    cached_cons: u32,
    _marker: PhantomData<T>,
}

impl<T> fmt::Debug for RingProd<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingProd")
            .field("shared", &self.shared)
            .field("cached_prod", &self.cached_prod)
            .field("cached_cons", &self.cached_cons)
            .finish()
    }
}

impl<T: Slot> RingProd<T> {
    fn new(shared: Arc<RingShared>) -> Self {
        let cached_prod = shared.producer().load(Ordering::Relaxed);
        let cached_cons = shared.consumer().load(Ordering::Relaxed);

        Self {
            shared,
            cached_prod,
            cached_cons,
            _marker: PhantomData,
        }
    }

    /// Number of free slots, refreshing the cached consumer counter only
    /// if the cached view cannot satisfy `nb`. The refreshed value has the
    /// ring size added so that `cached_cons - cached_prod` is the free
    /// count directly.
    pub(crate) fn nb_free(&mut self, nb: u32) -> u32 {
        let free = self.cached_cons.wrapping_sub(self.cached_prod);

        if free >= nb {
            return free;
        }

        self.cached_cons = self
            .shared
            .consumer()
            .load(Ordering::Acquire)
            .wrapping_add(self.shared.size);

        self.cached_cons.wrapping_sub(self.cached_prod)
    }

    /// Reserve `nb` slots, writing the starting position into `idx`.
    /// All-or-nothing: returns `nb` on success and 0 otherwise.
    pub(crate) fn reserve(&mut self, nb: u32, idx: &mut u32) -> u32 {
        if self.nb_free(nb) < nb {
            return 0;
        }

        *idx = self.cached_prod;
        self.cached_prod = self.cached_prod.wrapping_add(nb);

        nb
    }

    /// Write `value` into the slot at reserved position `pos`.
    pub(crate) fn write(&mut self, pos: u32, value: T) {
        // SAFETY: `pos` was handed out by `reserve`, so the slot is owned
        // by this side until submitted.
        unsafe { self.shared.slot_ptr::<T>(pos).write(value) };
    }

    /// Publish `nb` reserved slots to the consumer.
    pub(crate) fn submit(&mut self, nb: u32) -> Result<()> {
        let producer = self.shared.producer();
        let cur = producer.load(Ordering::Relaxed);

        if nb > self.cached_prod.wrapping_sub(cur) {
            return Err(Error::Overflow);
        }

        // Slot writes above must be visible before the counter moves.
        producer.store(cur.wrapping_add(nb), Ordering::Release);

        Ok(())
    }

    /// Publish every reserved-but-unpublished slot, returning how many
    /// were published. Used by the batched ingress flush.
    pub(crate) fn submit_all(&mut self) -> u32 {
        let producer = self.shared.producer();
        let cur = producer.load(Ordering::Relaxed);
        let pending = self.cached_prod.wrapping_sub(cur);

        if pending > 0 {
            producer.store(self.cached_prod, Ordering::Release);
        }

        pending
    }

    /// Cancel `nb` reserved slots.
    pub(crate) fn cancel(&mut self, nb: u32) {
        self.cached_prod = self.cached_prod.wrapping_sub(nb);
    }

    #[inline]
    pub(crate) fn shared(&self) -> &Arc<RingShared> {
        &self.shared
    }
}

/// The consuming side of a ring.
pub(crate) struct RingCons<T> {
    shared: Arc<RingShared>,
    cached_prod: u32,
    cached_cons: u32,
    _marker: PhantomData<T>,
}

impl<T> fmt::Debug for RingCons<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingCons")
            .field("shared", &self.shared)
            .field("cached_prod", &self.cached_prod)
            .field("cached_cons", &self.cached_cons)
            .finish()
    }
}

impl<T: Slot> RingCons<T> {
    fn new(shared: Arc<RingShared>) -> Self {
        let cached_prod = shared.producer().load(Ordering::Relaxed);
        let cached_cons = shared.consumer().load(Ordering::Relaxed);

        Self {
            shared,
            cached_prod,
            cached_cons,
            _marker: PhantomData,
        }
    }

    /// Number of available entries, bounded by `nb`. The cached producer
    /// counter is refreshed only when the cached view is empty.
    pub(crate) fn nb_avail(&mut self, nb: u32) -> u32 {
        let mut entries = self.cached_prod.wrapping_sub(self.cached_cons);

        if entries == 0 {
            self.cached_prod = self.shared.producer().load(Ordering::Acquire);
            entries = self.cached_prod.wrapping_sub(self.cached_cons);
        }

        entries.min(nb)
    }

    /// Peek up to `nb` entries, writing the starting position into `idx`
    /// and returning how many are readable.
    pub(crate) fn peek(&mut self, nb: u32, idx: &mut u32) -> u32 {
        let cnt = self.nb_avail(nb);

        if cnt == 0 {
            return 0;
        }

        *idx = self.cached_cons;
        self.cached_cons = self.cached_cons.wrapping_add(cnt);

        cnt
    }

    /// Read the slot at peeked position `pos`.
    pub(crate) fn read(&self, pos: u32) -> T {
        // SAFETY: `pos` was handed out by `peek` after an acquire load of
        // the producer counter, so the slot contents are fully published.
        unsafe { self.shared.slot_ptr::<T>(pos).read() }
    }

    /// Hand `nb` consumed slots back to the producer.
    pub(crate) fn release(&mut self, nb: u32) {
        let consumer = self.shared.consumer();
        let cur = consumer.load(Ordering::Relaxed);

        // Slot reads must complete before the producer may reuse them.
        consumer.store(cur.wrapping_add(nb), Ordering::Release);
    }

    /// Cancel `nb` peeked entries, leaving them at the head.
    pub(crate) fn cancel(&mut self, nb: u32) {
        self.cached_cons = self.cached_cons.wrapping_sub(nb);
    }

    #[inline]
    pub(crate) fn shared(&self) -> &Arc<RingShared> {
        &self.shared
    }
}

impl RingCons<FrameDesc> {
    /// Peek the next well-formed descriptor, skipping and counting
    /// malformed ones. A malformed descriptor never stalls the ring.
    ///
    /// The returned descriptor stays peeked: call [`release`] once it has
    /// been acted on, or [`cancel`] to leave it at the head.
    ///
    /// [`release`]: RingCons::release
    /// [`cancel`]: RingCons::cancel
    pub(crate) fn peek_desc(&mut self, props: &UmemProps) -> Option<FrameDesc> {
        loop {
            let mut pos = 0;

            if self.peek(1, &mut pos) == 0 {
                return None;
            }

            let desc = self.read(pos);

            if props.is_desc_valid(&desc) {
                return Some(desc);
            }

            self.shared.invalid_descs.fetch_add(1, Ordering::Relaxed);
            self.release(1);
        }
    }
}

impl RingCons<u32> {
    /// Peek the next in-bounds frame index, skipping and counting invalid
    /// ones. Same peek/release contract as [`peek_desc`].
    ///
    /// [`peek_desc`]: RingCons::peek_desc
    pub(crate) fn peek_index(&mut self, props: &UmemProps) -> Option<u32> {
        loop {
            let mut pos = 0;

            if self.peek(1, &mut pos) == 0 {
                return None;
            }

            let idx = self.read(pos);

            if props.is_index_valid(idx) {
                return Some(idx);
            }

            self.shared.invalid_descs.fetch_add(1, Ordering::Relaxed);
            self.release(1);
        }
    }
}

/// A validated view of one ring's backing pages, as handed out by
/// [`mmap`](crate::socket::Socket::mmap).
///
/// The pages hold the producer counter at [`RING_PRODUCER_OFFSET`], the
/// consumer counter at [`RING_CONSUMER_OFFSET`] and the slot array at
/// [`RING_DESC_OFFSET`]; this layout is stable across versions.
#[derive(Debug)]
pub struct RingMapping {
    shared: Arc<RingShared>,
    len: usize,
}

impl RingMapping {
    pub(crate) fn new(shared: Arc<RingShared>, len: usize) -> Self {
        Self { shared, len }
    }

    /// Base pointer of the mapped pages.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.shared.as_ptr()
    }

    /// Length of the mapping requested by the caller.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Slot count of the mapped ring.
    #[inline]
    pub fn ring_size(&self) -> u32 {
        self.shared.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc_ring(size: u32) -> (RingProd<FrameDesc>, RingCons<FrameDesc>) {
        pair(QueueSize::new(size).unwrap()).unwrap()
    }

    fn props() -> UmemProps {
        UmemProps::new(8, 2048, 0)
    }

    fn produce_one(prod: &mut RingProd<FrameDesc>, desc: FrameDesc) -> bool {
        let mut pos = 0;
        if prod.reserve(1, &mut pos) == 0 {
            return false;
        }
        prod.write(pos, desc);
        prod.submit(1).unwrap();
        true
    }

    #[test]
    fn zero_or_non_power_of_two_capacity_is_rejected() {
        assert_eq!(QueueSize::new(0).unwrap_err(), Error::InvalidCapacity);
        assert_eq!(QueueSize::new(6).unwrap_err(), Error::InvalidCapacity);
    }

    #[test]
    fn produced_entries_are_consumed_in_order() {
        let (mut prod, mut cons) = desc_ring(4);

        for i in 0..3 {
            assert!(produce_one(
                &mut prod,
                FrameDesc {
                    idx: i,
                    len: 64,
                    offset: 0,
                }
            ));
        }

        let mut pos = 0;
        assert_eq!(cons.peek(4, &mut pos), 3);

        for i in 0..3 {
            assert_eq!(cons.read(pos + i).idx, i);
        }

        cons.release(3);

        assert!(prod.shared().is_empty());
    }

    #[test]
    fn producer_stops_at_capacity_and_consumer_stops_at_empty() {
        let (mut prod, mut cons) = desc_ring(2);

        let mut pos = 0;
        assert_eq!(prod.reserve(2, &mut pos), 2);
        prod.write(pos, FrameDesc::default());
        prod.write(pos + 1, FrameDesc::default());
        prod.submit(2).unwrap();

        // Full: no further reservation possible.
        assert_eq!(prod.reserve(1, &mut pos), 0);
        assert!(prod.shared().is_full());

        assert_eq!(cons.peek(4, &mut pos), 2);
        cons.release(2);

        // Empty: nothing left to peek.
        assert_eq!(cons.peek(1, &mut pos), 0);
        assert!(cons.shared().is_empty());

        // Space is visible to the producer again.
        assert_eq!(prod.reserve(2, &mut pos), 2);
    }

    #[test]
    fn submitting_more_than_reserved_overflows() {
        let (mut prod, _cons) = desc_ring(4);

        let mut pos = 0;
        assert_eq!(prod.reserve(2, &mut pos), 2);

        assert_eq!(prod.submit(3).unwrap_err(), Error::Overflow);
        assert!(prod.submit(2).is_ok());
        assert_eq!(prod.submit(1).unwrap_err(), Error::Overflow);
    }

    #[test]
    fn cancelled_reservations_are_returned() {
        let (mut prod, mut cons) = desc_ring(2);

        let mut pos = 0;
        assert_eq!(prod.reserve(2, &mut pos), 2);
        prod.cancel(2);

        assert_eq!(prod.reserve(2, &mut pos), 2);
        prod.write(pos, FrameDesc::default());
        prod.write(pos + 1, FrameDesc::default());
        prod.submit(2).unwrap();

        assert_eq!(cons.peek(2, &mut pos), 2);
        cons.cancel(2);

        // Still at the head after an un-peek.
        assert_eq!(cons.peek(2, &mut pos), 2);
    }

    #[test]
    fn counters_keep_increasing_across_wrap_around() {
        let (mut prod, mut cons) = desc_ring(2);

        for round in 0..1000u32 {
            assert!(produce_one(
                &mut prod,
                FrameDesc {
                    idx: round,
                    len: round,
                    offset: 0,
                }
            ));

            let mut pos = 0;
            assert_eq!(cons.peek(1, &mut pos), 1);
            assert_eq!(cons.read(pos).idx, round);
            cons.release(1);
        }

        assert_eq!(prod.shared().producer().load(Ordering::Relaxed), 1000);
        assert_eq!(cons.shared().consumer().load(Ordering::Relaxed), 1000);
    }

    #[test]
    fn malformed_descriptors_are_counted_and_skipped() {
        let (mut prod, mut cons) = desc_ring(8);

        let bad_idx = FrameDesc {
            idx: 8,
            len: 64,
            offset: 0,
        };
        let bad_bounds = FrameDesc {
            idx: 0,
            len: 4000,
            offset: 0,
        };
        let straddling = FrameDesc {
            idx: 1,
            len: 1500,
            offset: 1000,
        };
        let good = FrameDesc {
            idx: 2,
            len: 1500,
            offset: 0,
        };

        for desc in [bad_idx, bad_bounds, straddling, good].iter() {
            assert!(produce_one(&mut prod, *desc));
        }

        let props = props();

        assert_eq!(cons.peek_desc(&props), Some(good));
        cons.release(1);

        assert_eq!(cons.peek_desc(&props), None);
        assert_eq!(cons.shared().invalid_descs(), 3);
    }

    #[test]
    fn out_of_bounds_fill_indices_are_counted_and_skipped() {
        let (mut prod, mut cons) = pair::<u32>(QueueSize::new(4).unwrap()).unwrap();

        for idx in [9u32, 10, 3].iter() {
            let mut pos = 0;
            assert_eq!(prod.reserve(1, &mut pos), 1);
            prod.write(pos, *idx);
            prod.submit(1).unwrap();
        }

        let props = props();

        assert_eq!(cons.peek_index(&props), Some(3));
        cons.release(1);

        assert_eq!(cons.peek_index(&props), None);
        assert_eq!(cons.shared().invalid_descs(), 2);
    }

    #[test]
    fn published_slots_are_fully_visible_to_a_concurrent_consumer() {
        use std::thread;

        const ITERS: u32 = 100_000;

        let (mut prod, mut cons) = desc_ring(8);
        let (tx, rx) = crossbeam_channel::bounded::<FrameDesc>(1024);

        let producer = thread::spawn(move || {
            let mut i = 0;
            while i < ITERS {
                let desc = FrameDesc {
                    idx: i,
                    len: i.wrapping_mul(3),
                    offset: i ^ 0x5a5a_5a5a,
                };
                let mut pos = 0;
                if prod.reserve(1, &mut pos) == 1 {
                    prod.write(pos, desc);
                    prod.submit(1).unwrap();
                    i += 1;
                } else {
                    thread::yield_now();
                }
            }
        });

        let consumer = thread::spawn(move || {
            let mut seen = 0;
            while seen < ITERS {
                let mut pos = 0;
                let cnt = cons.peek(8, &mut pos);
                if cnt == 0 {
                    thread::yield_now();
                    continue;
                }
                for i in 0..cnt {
                    tx.send(cons.read(pos + i)).unwrap();
                }
                cons.release(cnt);
                seen += cnt;
            }
        });

        let mut expected = 0u32;
        for desc in rx.iter().take(ITERS as usize) {
            // Every observed slot must be whole: all three fields from the
            // same publication.
            assert_eq!(desc.idx, expected);
            assert_eq!(desc.len, expected.wrapping_mul(3));
            assert_eq!(desc.offset, expected ^ 0x5a5a_5a5a);
            expected += 1;
        }

        producer.join().unwrap();
        consumer.join().unwrap();
    }
}
