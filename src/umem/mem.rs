use std::{ptr::NonNull, slice};

use log::{error, warn};

use crate::error::{Error, Result};

/// An anonymous memory mapped region.
#[derive(Debug)]
pub(crate) struct Mmap {
    addr: NonNull<libc::c_void>, // Store a copy to avoid double deref.
    len: usize,
}

impl Mmap {
    pub(crate) fn new(len: usize, use_huge_pages: bool) -> Result<Self> {
        // MAP_ANONYMOUS: mapping not backed by a file.
        // MAP_SHARED: shares this mapping, so changes are visible
        // to other processes mapping the same file.
        // MAP_POPULATE: pre-populate page tables, reduces
        // blocking on page faults later.
        let mut flags = libc::MAP_ANONYMOUS | libc::MAP_SHARED | libc::MAP_POPULATE;

        if use_huge_pages {
            flags |= libc::MAP_HUGETLB;
        }

        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE, // prot
                flags,
                -1, // file
                0,  // offset
            )
        };

        if addr == libc::MAP_FAILED {
            error!("`mmap()` for {} bytes failed: {}", len, errno::errno());
            Err(Error::OutOfMemory)
        } else {
            let addr =
                NonNull::new(addr).expect("ptr non-null since we confirmed `mmap()` succeeded");

            Ok(Mmap { addr, len })
        }
    }

    #[inline]
    pub(crate) fn addr(&self) -> NonNull<libc::c_void> {
        self.addr
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        let err = unsafe { libc::munmap(self.addr.as_ptr(), self.len) };

        if err != 0 {
            error!("`munmap()` failed with error code {}", err);
        }
    }
}

/// The frame memory backing a [`Umem`](super::Umem): a page-aligned,
/// anonymous shared mapping that registration partitions into equal-size
/// frames.
///
/// Setting `use_huge_pages` to `true` will instruct `mmap()` to allocate
/// the underlying memory using huge pages. If you are getting errors as a
/// result of this, check that the `HugePages_Total` setting is non-zero
/// when you run `cat /proc/meminfo`.
#[derive(Debug)]
pub struct UmemRegion {
    mmap: Mmap,
}

// SAFETY: these impls are only safe in the context of this crate. The
// mutators of the region write to disjoint frames, whose ownership is
// transferred through the rings one party at a time.
unsafe impl Send for UmemRegion {}
unsafe impl Sync for UmemRegion {}

impl UmemRegion {
    pub fn new(len: usize, use_huge_pages: bool) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidGeometry);
        }

        Ok(Self {
            mmap: Mmap::new(len, use_huge_pages)?,
        })
    }

    /// The region length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pin the region's pages so the data path never faults on them.
    ///
    /// Best-effort: a process with a small `RLIMIT_MEMLOCK` still gets a
    /// working (if fault-prone) pool.
    pub(crate) fn lock_pages(&self) {
        let err = unsafe { libc::mlock(self.mmap.addr().as_ptr(), self.len()) };

        if err != 0 {
            warn!(
                "`mlock()` of the frame region failed: {} (check `ulimit -l`)",
                errno::errno()
            );
        }
    }

    #[inline]
    fn as_ptr(&self) -> *mut u8 {
        self.mmap.addr().as_ptr() as *mut u8
    }

    /// Copy `data` into the region at byte offset `addr`.
    ///
    /// # Safety
    ///
    /// The caller must own the frame containing `addr..addr + data.len()`
    /// and ensure no other reference to that range exists at the same
    /// time.
    pub(crate) unsafe fn write(&self, addr: usize, data: &[u8]) {
        assert!(addr + data.len() <= self.len());

        std::ptr::copy_nonoverlapping(data.as_ptr(), self.as_ptr().add(addr), data.len());
    }

    /// A view of `len` bytes of the region starting at byte offset `addr`.
    ///
    /// # Safety
    ///
    /// The caller must own the frame containing the range and ensure it is
    /// not written to for the lifetime of the returned slice.
    pub(crate) unsafe fn read(&self, addr: usize, len: usize) -> &[u8] {
        assert!(addr + len <= self.len());

        slice::from_raw_parts(self.as_ptr().add(addr), len)
    }

    /// A mutable view of `len` bytes of the region starting at byte offset
    /// `addr`.
    ///
    /// # Safety
    ///
    /// The caller must own the frame containing the range and ensure no
    /// other reference to it exists for the lifetime of the returned
    /// slice.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut(&self, addr: usize, len: usize) -> &mut [u8] {
        assert!(addr + len <= self.len());

        slice::from_raw_parts_mut(self.as_ptr().add(addr), len)
    }
}
