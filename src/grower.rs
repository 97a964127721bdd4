//! Backing stores that supply raw heap memory.
//!
//! A [`HeapGrower`] owns one contiguous byte region that only ever grows at
//! the top, like `sbrk`. The allocator addresses it by offset, so the region
//! may move in memory between growths (as a `Vec` does) without invalidating
//! anything handed out.

use alloc::vec::Vec;
use core::fmt;

/// Grows the heap on request, and exposes the bytes granted so far.
pub trait HeapGrower {
    type Err: fmt::Debug;

    /// Grow the heap by exactly `size` bytes. Returns the offset of the start
    /// of the new region, which is always the old end of the heap.
    ///
    /// On failure the heap must be left as it was.
    fn grow_heap(&mut self, size: usize) -> Result<usize, Self::Err>;

    /// Every byte granted so far.
    fn heap(&self) -> &[u8];

    fn heap_mut(&mut self) -> &mut [u8];

    /// Offset of the first heap byte.
    fn heap_lo(&self) -> usize {
        0
    }

    /// Offset of the last heap byte, or `None` while the heap is empty.
    fn heap_hi(&self) -> Option<usize> {
        self.heap().len().checked_sub(1)
    }
}

/// `ToyHeap` is an in-memory buffer with a fixed upper limit that can pretend
/// to be a heap. It is mainly useful for testing, including running out of
/// memory on purpose.
pub struct ToyHeap {
    pub limit: usize,
    pub growths: usize,
    heap: Vec<u8>,
}

impl ToyHeap {
    pub fn new(limit: usize) -> Self {
        ToyHeap {
            limit,
            growths: 0,
            heap: Vec::new(),
        }
    }

    /// Number of bytes handed out so far.
    pub fn size(&self) -> usize {
        self.heap.len()
    }
}

impl Default for ToyHeap {
    fn default() -> Self {
        ToyHeap::new(256 * 1024)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToyHeapOverflowError {
    pub requested: usize,
    pub available: usize,
}

impl fmt::Display for ToyHeapOverflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "toy heap overflow: requested {} bytes with {} available",
            self.requested, self.available
        )
    }
}

impl HeapGrower for ToyHeap {
    type Err = ToyHeapOverflowError;

    fn grow_heap(&mut self, size: usize) -> Result<usize, Self::Err> {
        let start = self.heap.len();
        let available = self.limit.saturating_sub(start);
        if size > available {
            return Err(ToyHeapOverflowError {
                requested: size,
                available,
            });
        }

        self.heap.resize(start + size, 0);
        self.growths += 1;
        Ok(start)
    }

    fn heap(&self) -> &[u8] {
        &self.heap
    }

    fn heap_mut(&mut self) -> &mut [u8] {
        &mut self.heap
    }
}

/// `LibcHeapGrower` reserves one large anonymous mapping from the OS on first
/// use, and hands it out from the bottom up as the heap grows.
///
/// Pages are only touched (and so only backed by real memory) once the
/// allocator writes to them.
#[cfg(feature = "use_libc")]
pub struct LibcHeapGrower {
    base: *mut u8,
    reserved: usize,
    max_size: usize,
    brk: usize,
    // Just for tracking, not really needed
    pub growths: usize,
}

#[cfg(feature = "use_libc")]
impl LibcHeapGrower {
    /// A grower that can supply at most `max_size` bytes.
    pub fn new(max_size: usize) -> Self {
        LibcHeapGrower {
            base: core::ptr::null_mut(),
            reserved: 0,
            max_size,
            brk: 0,
            growths: 0,
        }
    }

    fn reserve(&mut self) -> Result<(), errno::Errno> {
        let pagesize = sysconf::page::pagesize();
        let to_reserve = crate::block::round_up(self.max_size, pagesize)
            .ok_or(errno::Errno(libc::ENOMEM))?;

        let ptr = unsafe {
            libc::mmap(
                // Address we want the memory at. We don't care, so null it is.
                core::ptr::null_mut(),
                to_reserve,
                libc::PROT_WRITE | libc::PROT_READ,
                // Not backed by a file, and not shared with anyone
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(errno::errno());
        }

        log::debug!("reserved {} bytes of heap at {:?}", to_reserve, ptr);
        self.base = ptr as *mut u8;
        self.reserved = to_reserve;
        Ok(())
    }
}

#[cfg(feature = "use_libc")]
impl Default for LibcHeapGrower {
    fn default() -> Self {
        // 20 MiB, the same as the classic `memlib` simulator
        LibcHeapGrower::new(20 * (1 << 20))
    }
}

#[cfg(feature = "use_libc")]
impl HeapGrower for LibcHeapGrower {
    type Err = errno::Errno;

    fn grow_heap(&mut self, size: usize) -> Result<usize, Self::Err> {
        if self.base.is_null() {
            self.reserve()?;
        }

        let start = self.brk;
        if size > self.max_size.saturating_sub(start) {
            return Err(errno::Errno(libc::ENOMEM));
        }

        self.brk += size;
        self.growths += 1;
        Ok(start)
    }

    fn heap(&self) -> &[u8] {
        if self.base.is_null() {
            return &[];
        }
        // The first `brk` bytes of the mapping are ours, and the mapping
        // lives as long as `self`.
        unsafe { core::slice::from_raw_parts(self.base, self.brk) }
    }

    fn heap_mut(&mut self) -> &mut [u8] {
        if self.base.is_null() {
            return &mut [];
        }
        unsafe { core::slice::from_raw_parts_mut(self.base, self.brk) }
    }
}

#[cfg(feature = "use_libc")]
impl Drop for LibcHeapGrower {
    fn drop(&mut self) {
        if self.base.is_null() {
            return;
        }
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.reserved);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn test_toy_heap() {
        let mut heap = ToyHeap::new(128);
        assert_eq!(heap.heap_hi(), None);

        assert_eq!(heap.grow_heap(32), Ok(0));
        assert_eq!(heap.grow_heap(64), Ok(32));
        assert_eq!(heap.size(), 96);
        assert_eq!(heap.heap_lo(), 0);
        assert_eq!(heap.heap_hi(), Some(95));
        assert_eq!(heap.growths, 2);

        heap.heap_mut()[95] = 7;
        assert_eq!(heap.heap()[95], 7);

        let err = heap.grow_heap(64).unwrap_err();
        assert_eq!(
            err,
            ToyHeapOverflowError {
                requested: 64,
                available: 32
            }
        );
        // A failed growth leaves the heap alone
        assert_eq!(heap.size(), 96);
        assert_eq!(heap.growths, 2);
        assert_eq!(heap.grow_heap(32), Ok(96));
    }

    #[cfg(feature = "use_libc")]
    #[test]
    fn test_libc_heap() {
        let mut heap = LibcHeapGrower::new(1 << 16);
        assert!(heap.heap().is_empty());
        assert_eq!(heap.grow_heap(4096).unwrap(), 0);
        assert_eq!(heap.grow_heap(4096).unwrap(), 4096);
        heap.heap_mut()[8191] = 1;
        assert_eq!(heap.heap().len(), 8192);
        assert!(heap.grow_heap(1 << 16).is_err());
    }
}
