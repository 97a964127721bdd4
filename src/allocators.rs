//! The allocator itself.
//!
//! ## Basic Types
//!
//! ### [`RawAlloc`](struct.RawAlloc.html)
//!
//! A `RawAlloc` is a single-threaded heap manager built on a
//! [`HeapGrower`](../grower/trait.HeapGrower.html). It hands out
//! [`Payload`](../block/struct.Payload.html) offsets into the grower's memory,
//! and tracks freed blocks in a
//! [`SegregatedList`](../freelist/struct.SegregatedList.html).
//!
//! ### [`Config`](struct.Config.html)
//!
//! Tunables: how much to grow the heap by at a time, and whether `resize`
//! may grow or shrink a block where it stands.
//!
//! ## Heap layout
//!
//! ```text
//! | pad | prologue hdr | prologue ftr | block | block | ... | epilogue hdr |
//! ```
//!
//! The prologue and epilogue are permanently allocated, so coalescing never
//! walks off either end of the heap.

use core::fmt;

use crate::block::{round_up, write_tag, Payload, Tag, ALIGNMENT, DSIZE, MIN_BLOCK_SIZE, WORD};
use crate::freelist::SegregatedList;
use crate::grower::HeapGrower;

/// Default amount to grow the heap by, in bytes.
pub const CHUNK_SIZE: usize = 1 << 12;

/// Padding word, prologue header and footer, and epilogue header.
const PREFIX_SIZE: usize = 4 * WORD;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Minimum number of bytes to grow the heap by.
    pub chunk_size: usize,
    /// Let `resize` reuse the current block, or absorb a free block after
    /// it, instead of always moving.
    pub resize_in_place: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            chunk_size: CHUNK_SIZE,
            resize_in_place: true,
        }
    }
}

impl Config {
    // Chunks must be valid block sizes
    fn chunk(&self) -> usize {
        round_up(self.chunk_size, ALIGNMENT)
            .unwrap_or(usize::MAX & !(ALIGNMENT - 1))
            .max(MIN_BLOCK_SIZE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocError<E> {
    /// The heap grower could not supply more memory.
    OutOfMemory(E),
    /// No block could be large enough for this many bytes.
    TooLarge(usize),
    /// The heap grower returned a region at an unaligned offset.
    Misaligned(usize),
    AlreadyInitialized,
}

impl<E: fmt::Debug> fmt::Display for AllocError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory(e) => write!(f, "out of memory: {:?}", e),
            AllocError::TooLarge(size) => write!(f, "allocation of {} bytes is too large", size),
            AllocError::Misaligned(offset) => {
                write!(f, "heap grower returned misaligned region at {:#x}", offset)
            }
            AllocError::AlreadyInitialized => write!(f, "heap is already initialized"),
        }
    }
}

/// Block size needed to hold `size` bytes of payload.
fn adjusted_size(size: usize) -> Option<usize> {
    let with_overhead = size.checked_add(DSIZE)?;
    Some(round_up(with_overhead, ALIGNMENT)?.max(MIN_BLOCK_SIZE))
}

/// A raw allocator, capable of growing the heap, returning payloads for new
/// allocations, and tracking and reusing freed memory.
///
/// Note: The heap never shrinks; memory is not returned to the grower.
pub struct RawAlloc<G> {
    pub grower: G,
    pub(crate) blocks: SegregatedList,
    pub(crate) config: Config,
    // Payload of the prologue block, once initialized
    pub(crate) prologue: Option<Payload>,
    pub(crate) extensions: usize,
}

impl<G: HeapGrower + Default> Default for RawAlloc<G> {
    fn default() -> Self {
        RawAlloc::new(G::default())
    }
}

impl<G: HeapGrower> RawAlloc<G> {
    /// Create a new `RawAlloc`. The heap is set up on the first call to
    /// [`init`](#method.init) or the first allocation.
    pub fn new(grower: G) -> Self {
        RawAlloc::with_config(grower, Config::default())
    }

    pub fn with_config(grower: G, config: Config) -> Self {
        RawAlloc {
            grower,
            blocks: SegregatedList::default(),
            config,
            prologue: None,
            extensions: 0,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.prologue.is_some()
    }

    /// Lay down the prologue and epilogue, and grow the heap by one chunk.
    ///
    /// The prefix and the first chunk come from a single growth, so if the
    /// grower cannot supply them the heap is left untouched and the allocator
    /// stays uninitialized.
    pub fn init(&mut self) -> Result<(), AllocError<G::Err>> {
        if self.is_initialized() {
            return Err(AllocError::AlreadyInitialized);
        }
        self.blocks.clear();

        let chunk = self.config.chunk();
        let total = PREFIX_SIZE
            .checked_add(chunk)
            .ok_or(AllocError::TooLarge(chunk))?;
        let start = self
            .grower
            .grow_heap(total)
            .map_err(AllocError::OutOfMemory)?;
        if start % ALIGNMENT != 0 {
            return Err(AllocError::Misaligned(start));
        }

        let mem = self.grower.heap_mut();
        write_tag(mem, start, Tag::from_word(0));
        write_tag(mem, start + WORD, Tag::pack(DSIZE, true));
        write_tag(mem, start + 2 * WORD, Tag::pack(DSIZE, true));
        let prologue = Payload::new(start + DSIZE).ok_or(AllocError::Misaligned(start))?;

        // The first chunk's header sits where the epilogue would otherwise go
        let first = prologue.next(mem);
        first.set(mem, chunk, false);
        let epilogue = first.next(mem);
        write_tag(mem, epilogue.header(), Tag::EPILOGUE);
        self.blocks.insert(mem, first);
        self.extensions += 1;
        self.prologue = Some(prologue);

        log::debug!(
            "initialized heap with prologue at {} and {} free bytes at {}",
            prologue,
            chunk,
            first
        );
        self.debug_check(line!());
        Ok(())
    }

    fn ensure_init(&mut self) -> Result<(), AllocError<G::Err>> {
        if self.is_initialized() {
            return Ok(());
        }
        self.init()
    }

    /// Grow the heap by at least `bytes`, and return the resulting free
    /// block, merged with any free block that ended the old heap. The block
    /// is in the free list.
    fn extend(&mut self, bytes: usize) -> Result<Payload, AllocError<G::Err>> {
        let size = round_up(bytes, ALIGNMENT).ok_or(AllocError::TooLarge(bytes))?;
        let start = self
            .grower
            .grow_heap(size)
            .map_err(AllocError::OutOfMemory)?;
        self.extensions += 1;

        // The old epilogue header becomes the new block's header
        let block = Payload::new(start).ok_or(AllocError::Misaligned(start))?;
        debug_assert_eq!(start + size, self.grower.heap().len());

        let mem = self.grower.heap_mut();
        block.set(mem, size, false);
        let epilogue = block.next(mem);
        write_tag(mem, epilogue.header(), Tag::EPILOGUE);
        log::debug!("extended heap by {} bytes at {}", size, block);

        let merged = self.coalesce(block);
        self.blocks.insert(self.grower.heap_mut(), merged);
        Ok(merged)
    }

    /// Merge a free block with its free neighbors, and return the merged
    /// block.
    ///
    /// `block` must be marked free and not be in the free list. Neighbors are
    /// taken out of the free list; the caller inserts the result.
    fn coalesce(&mut self, block: Payload) -> Payload {
        let mem = self.grower.heap_mut();
        let prev_allocated = block.prev_tag(mem).is_allocated();
        let next = block.next(mem);
        let next_allocated = next.is_allocated(mem);
        let mut size = block.size(mem);

        let merged = match (prev_allocated, next_allocated) {
            (true, true) => return block,
            (true, false) => {
                self.blocks.remove(mem, next);
                size += next.size(mem);
                block
            }
            (false, true) => {
                let prev = block.prev(mem);
                self.blocks.remove(mem, prev);
                size += prev.size(mem);
                prev
            }
            (false, false) => {
                let prev = block.prev(mem);
                self.blocks.remove(mem, prev);
                self.blocks.remove(mem, next);
                size += prev.size(mem) + next.size(mem);
                prev
            }
        };

        merged.set(mem, size, false);
        log::trace!("coalesced {} into {}:{}", block, merged, size);
        merged
    }

    /// Carve `size` bytes out of the front of free block `block`, returning
    /// the rest to the free list if it is large enough to be a block.
    fn place(&mut self, block: Payload, size: usize) {
        let mem = self.grower.heap_mut();
        self.blocks.remove(mem, block);

        let available = block.size(mem);
        if available - size >= MIN_BLOCK_SIZE {
            block.set(mem, size, true);
            let rest = block.next(mem);
            rest.set(mem, available - size, false);
            self.blocks.insert(mem, rest);
            log::trace!("split {}:{} off of {}:{}", rest, available - size, block, available);
        } else {
            block.set(mem, available, true);
        }
    }

    /// Allocate a block with room for `size` bytes.
    ///
    /// Returns `Ok(None)` for a zero-sized request, which touches nothing.
    pub fn try_allocate(&mut self, size: usize) -> Result<Option<Payload>, AllocError<G::Err>> {
        if size == 0 {
            return Ok(None);
        }
        let needed = adjusted_size(size).ok_or(AllocError::TooLarge(size))?;
        self.ensure_init()?;

        let block = match self.blocks.find(self.grower.heap(), needed) {
            Some(block) => block,
            None => self.extend(needed.max(self.config.chunk()))?,
        };
        self.place(block, needed);

        log::trace!("allocated {} bytes at {}", size, block);
        self.debug_check(line!());
        Ok(Some(block))
    }

    /// Allocate a block with room for `size` bytes.
    ///
    /// Returns `None` if `size` is zero or there is no memory left.
    pub fn allocate(&mut self, size: usize) -> Option<Payload> {
        match self.try_allocate(size) {
            Ok(block) => block,
            Err(e) => {
                log::warn!("allocation of {} bytes failed: {}", size, e);
                None
            }
        }
    }

    /// Allocate room for `count` items of `size` bytes each, zeroed.
    pub fn allocate_zeroed(&mut self, count: usize, size: usize) -> Option<Payload> {
        let total = count.checked_mul(size)?;
        let block = self.allocate(total)?;
        self.payload_mut(block)[..total].fill(0);
        Some(block)
    }

    /// Release a block back to the allocator. Releasing `None` does nothing.
    ///
    /// `block` must have come from this allocator and not already have been
    /// released; nothing checks that.
    pub fn release<P: Into<Option<Payload>>>(&mut self, block: P) {
        let block = match block.into() {
            Some(block) if self.is_initialized() => block,
            _ => return,
        };

        let mem = self.grower.heap_mut();
        let size = block.size(mem);
        block.set(mem, size, false);
        let merged = self.coalesce(block);
        self.blocks.insert(self.grower.heap_mut(), merged);

        log::trace!("released {}", block);
        self.debug_check(line!());
    }

    /// Resize a block to hold `size` bytes, possibly moving it.
    ///
    /// Resizing `None` is an allocation, and resizing to 0 is a release.
    /// On success the first `min(old size, size)` payload bytes are kept. On
    /// failure `None` is returned and the old block is left untouched.
    pub fn resize<P: Into<Option<Payload>>>(&mut self, block: P, size: usize) -> Option<Payload> {
        let block = match block.into() {
            None => return self.allocate(size),
            Some(block) => block,
        };
        if size == 0 {
            self.release(block);
            return None;
        }

        if self.config.resize_in_place {
            let needed = adjusted_size(size)?;
            if self.resize_in_place(block, needed) {
                self.debug_check(line!());
                return Some(block);
            }
        }

        let old_size = self.usable_size(block);
        let moved = self.allocate(size)?;
        let keep = old_size.min(size);
        self.grower
            .heap_mut()
            .copy_within(block.offset()..block.offset() + keep, moved.offset());
        self.release(block);

        log::debug!("resize moved {} to {} ({} bytes kept)", block, moved, keep);
        Some(moved)
    }

    // Shrink the block where it stands, or grow it into a free block right
    // after it. Returns false, having changed nothing, when neither works.
    fn resize_in_place(&mut self, block: Payload, needed: usize) -> bool {
        let mem = self.grower.heap_mut();
        let current = block.size(mem);

        if needed <= current {
            if current - needed >= MIN_BLOCK_SIZE {
                block.set(mem, needed, true);
                let rest = block.next(mem);
                rest.set(mem, current - needed, false);
                let merged = self.coalesce(rest);
                self.blocks.insert(self.grower.heap_mut(), merged);
            }
            log::debug!("resize shrank {} in place", block);
            return true;
        }

        let next = block.next(mem);
        if next.is_allocated(mem) || current + next.size(mem) < needed {
            return false;
        }

        let total = current + next.size(mem);
        self.blocks.remove(mem, next);
        if total - needed >= MIN_BLOCK_SIZE {
            block.set(mem, needed, true);
            let rest = block.next(mem);
            rest.set(mem, total - needed, false);
            self.blocks.insert(mem, rest);
        } else {
            block.set(mem, total, true);
        }
        log::debug!("resize grew {} in place to {} bytes", block, needed);
        true
    }

    /// Number of payload bytes the block can hold.
    pub fn usable_size(&self, block: Payload) -> usize {
        block.size(self.grower.heap()) - DSIZE
    }

    /// The payload of an allocated block.
    pub fn payload(&self, block: Payload) -> &[u8] {
        let len = self.usable_size(block);
        &self.grower.heap()[block.offset()..block.offset() + len]
    }

    /// The payload of an allocated block, for writing.
    pub fn payload_mut(&mut self, block: Payload) -> &mut [u8] {
        let len = self.usable_size(block);
        &mut self.grower.heap_mut()[block.offset()..block.offset() + len]
    }

    /// Number of times the heap has been grown.
    pub fn extensions(&self) -> usize {
        self.extensions
    }

    #[cfg(feature = "heap-check")]
    fn debug_check(&self, line: u32) {
        assert!(self.check_heap(line), "heap check failed at line {}", line);
    }

    #[cfg(not(feature = "heap-check"))]
    fn debug_check(&self, _line: u32) {}
}

impl<G: HeapGrower> fmt::Display for RawAlloc<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.blocks.display(self.grower.heap()))
    }
}
