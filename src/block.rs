//! Boundary tags and block navigation.
//!
//! Every block in the heap is laid out as
//!
//! ```text
//!   header        payload                              footer
//! ┌────────┬───────────────────────────────────────┬────────┐
//! │ size|a │ prev link │ next link │ ...           │ size|a │
//! └────────┴───────────────────────────────────────┴────────┘
//!          ^ payload offset (a multiple of ALIGNMENT)
//! ```
//!
//! The header and footer hold the same packed [`Tag`]. The first two payload
//! words are free list links while the block is free; once allocated, the
//! whole payload belongs to the caller. In other words the payload is a
//! tagged union `Free { prev, next } | Allocated { opaque }`, with the tag
//! living in the header.
//!
//! All addresses here are byte offsets into the heap buffer handed out by a
//! [`HeapGrower`](crate::grower::HeapGrower), never raw pointers. Reads and
//! writes outside of the buffer panic instead of corrupting memory.

use core::fmt;
use core::num::NonZeroUsize;

use static_assertions::const_assert;

/// Size of a header, footer, or free list link, in bytes.
pub const WORD: usize = 8;

/// Header plus footer.
pub const DSIZE: usize = 2 * WORD;

/// Every payload offset and every block size is a multiple of this.
pub const ALIGNMENT: usize = 16;

/// The smallest block we can track when free: header, two links, footer.
pub const MIN_BLOCK_SIZE: usize = 4 * WORD;

const ALLOCATED_BIT: u64 = 0x1;
const SIZE_MASK: u64 = !(ALIGNMENT as u64 - 1);

const_assert!(ALIGNMENT.is_power_of_two());
const_assert!(MIN_BLOCK_SIZE % ALIGNMENT == 0);
const_assert!(MIN_BLOCK_SIZE >= DSIZE + 2 * WORD);
const_assert!(ALLOCATED_BIT < ALIGNMENT as u64);

/// Round `value` up to the nearest multiple of `increment`, or `None` if that
/// would overflow.
pub fn round_up(value: usize, increment: usize) -> Option<usize> {
    if value == 0 {
        return Some(0);
    }
    Some(increment * ((value - 1) / increment).checked_add(1)?)
}

/// A packed `(size, allocated)` boundary tag.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Tag(u64);

impl Tag {
    pub const EPILOGUE: Tag = Tag::pack(0, true);

    /// Pack a size and allocated bit into a word.
    ///
    /// Bits of `size` below the alignment are dropped.
    pub const fn pack(size: usize, allocated: bool) -> Tag {
        let alloc = if allocated { ALLOCATED_BIT } else { 0 };
        Tag((size as u64 & SIZE_MASK) | alloc)
    }

    pub const fn from_word(word: u64) -> Tag {
        Tag(word)
    }

    pub const fn word(self) -> u64 {
        self.0
    }

    pub const fn size(self) -> usize {
        (self.0 & SIZE_MASK) as usize
    }

    pub const fn is_allocated(self) -> bool {
        self.0 & ALLOCATED_BIT != 0
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_allocated() { "A" } else { "F" };
        write!(f, "Tag({}{})", self.size(), state)
    }
}

/// Read a native-endian word at `at`.
pub fn read_word(mem: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; WORD];
    buf.copy_from_slice(&mem[at..at + WORD]);
    u64::from_ne_bytes(buf)
}

/// Write a native-endian word at `at`.
pub fn write_word(mem: &mut [u8], at: usize, word: u64) {
    mem[at..at + WORD].copy_from_slice(&word.to_ne_bytes());
}

pub fn read_tag(mem: &[u8], at: usize) -> Tag {
    Tag::from_word(read_word(mem, at))
}

pub fn write_tag(mem: &mut [u8], at: usize, tag: Tag) {
    write_word(mem, at, tag.word());
}

/// The offset of a block's payload within the heap.
///
/// This is what the allocator hands out instead of a pointer. Offset 0 is
/// never a payload (the heap starts with padding and the prologue), so
/// `Option<Payload>` doubles as a nullable pointer and as a free list link.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Payload(NonZeroUsize);

impl Payload {
    pub fn new(offset: usize) -> Option<Payload> {
        NonZeroUsize::new(offset).map(Payload)
    }

    /// Byte offset of the payload from the start of the heap.
    pub fn offset(self) -> usize {
        self.0.get()
    }

    pub(crate) fn add(self, bytes: usize) -> Payload {
        Payload(self.0.saturating_add(bytes))
    }

    pub(crate) fn header(self) -> usize {
        self.offset() - WORD
    }

    pub(crate) fn footer(self, mem: &[u8]) -> usize {
        self.offset() + self.size(mem) - DSIZE
    }

    pub(crate) fn tag(self, mem: &[u8]) -> Tag {
        read_tag(mem, self.header())
    }

    /// Total size of the block, header and footer included.
    pub(crate) fn size(self, mem: &[u8]) -> usize {
        self.tag(mem).size()
    }

    pub(crate) fn is_allocated(self, mem: &[u8]) -> bool {
        self.tag(mem).is_allocated()
    }

    /// The block directly after this one. For the last block, this is the
    /// epilogue, whose header says size 0 and allocated.
    pub(crate) fn next(self, mem: &[u8]) -> Payload {
        self.add(self.size(mem))
    }

    /// Tag of the block directly before this one, read from its footer.
    pub(crate) fn prev_tag(self, mem: &[u8]) -> Tag {
        read_tag(mem, self.offset() - DSIZE)
    }

    /// The block directly before this one. Only meaningful when that block
    /// is not the prologue.
    pub(crate) fn prev(self, mem: &[u8]) -> Payload {
        Payload(
            NonZeroUsize::new(self.offset() - self.prev_tag(mem).size())
                .unwrap_or(self.0),
        )
    }

    /// Write matching header and footer tags for a block of `size` bytes.
    pub(crate) fn set(self, mem: &mut [u8], size: usize, allocated: bool) {
        let tag = Tag::pack(size, allocated);
        write_tag(mem, self.header(), tag);
        write_tag(mem, self.offset() + size - DSIZE, tag);
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{:#x}", self.offset())
    }
}
