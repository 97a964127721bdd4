use core::fmt;

use crate::block::{read_word, write_word, Payload, WORD};

/// Number of size classes. Bucket `i` holds free blocks with sizes in
/// `[2^i, 2^(i+1))`; the last bucket also takes everything larger.
pub const BUCKET_COUNT: usize = 20;

/// Which bucket a block of `size` bytes belongs in.
pub fn bucket_index(size: usize) -> usize {
    size.checked_ilog2()
        .map_or(0, |log| log as usize)
        .min(BUCKET_COUNT - 1)
}

// Free blocks keep their links in the first two payload words: `prev` at the
// payload offset, `next` one word later. Offset 0 means "no link".
fn link(mem: &[u8], at: usize) -> Option<Payload> {
    Payload::new(read_word(mem, at) as usize)
}

fn set_link(mem: &mut [u8], at: usize, link: Option<Payload>) {
    write_word(mem, at, link.map_or(0, |p| p.offset() as u64));
}

pub(crate) fn prev_free(mem: &[u8], block: Payload) -> Option<Payload> {
    link(mem, block.offset())
}

pub(crate) fn next_free(mem: &[u8], block: Payload) -> Option<Payload> {
    link(mem, block.offset() + WORD)
}

fn set_prev_free(mem: &mut [u8], block: Payload, prev: Option<Payload>) {
    set_link(mem, block.offset(), prev);
}

fn set_next_free(mem: &mut [u8], block: Payload, next: Option<Payload>) {
    set_link(mem, block.offset() + WORD, next);
}

/// A `SegregatedList` is an array of doubly-linked lists of free blocks,
/// bucketed by power-of-two size class.
///
/// The list heads live here; the links live inside the free blocks
/// themselves, so every method takes the heap memory the blocks live in.
///
/// It maintains a few invariants:
///
/// - A free block is in exactly one list, the one for its size class; an
///   allocated block is in none.
/// - Each list is sorted by ascending block size, so the first fit in a list
///   is also the best fit in that list.
/// - `prev` of a list's head is `None`, and `next(prev(b)) == b` otherwise.
#[derive(Clone, PartialEq, Eq)]
pub struct SegregatedList {
    heads: [Option<Payload>; BUCKET_COUNT],
}

impl Default for SegregatedList {
    fn default() -> Self {
        SegregatedList {
            heads: [None; BUCKET_COUNT],
        }
    }
}

/// Iterator over one bucket's list, in list order.
///
/// A block's links are only read when moving past it, so a caller can stop
/// at a block it doesn't trust.
pub struct BucketIter<'heap> {
    mem: &'heap [u8],
    last: Option<Payload>,
    next: Option<Payload>,
}

impl<'heap> Iterator for BucketIter<'heap> {
    type Item = Payload;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(last) = self.last.take() {
            self.next = next_free(self.mem, last);
        }
        let block = self.next.take()?;
        self.last = Some(block);
        Some(block)
    }
}

impl SegregatedList {
    pub fn clear(&mut self) {
        self.heads = [None; BUCKET_COUNT];
    }

    pub fn head(&self, bucket: usize) -> Option<Payload> {
        self.heads[bucket]
    }

    pub fn iter<'heap>(&self, mem: &'heap [u8], bucket: usize) -> BucketIter<'heap> {
        BucketIter {
            mem,
            last: None,
            next: self.heads[bucket],
        }
    }

    /// Add a free block, keeping its bucket sorted by size.
    ///
    /// The block's header must already record its final size.
    pub fn insert(&mut self, mem: &mut [u8], block: Payload) {
        let size = block.size(mem);
        let bucket = bucket_index(size);

        // Walk to the first block at least as large as this one
        let mut prev = None;
        let mut next = self.heads[bucket];
        while let Some(candidate) = next {
            if candidate.size(mem) >= size {
                break;
            }
            prev = Some(candidate);
            next = next_free(mem, candidate);
        }

        set_prev_free(mem, block, prev);
        set_next_free(mem, block, next);
        if let Some(next) = next {
            set_prev_free(mem, next, Some(block));
        }
        match prev {
            Some(prev) => set_next_free(mem, prev, Some(block)),
            None => self.heads[bucket] = Some(block),
        }

        log::trace!("free list: inserted {}:{} into bucket {}", block, size, bucket);
    }

    /// Unlink a free block from its bucket.
    ///
    /// The bucket is recomputed from the block's header, so this must be
    /// called before the header is rewritten with a new size.
    pub fn remove(&mut self, mem: &mut [u8], block: Payload) {
        let bucket = bucket_index(block.size(mem));
        let prev = prev_free(mem, block);
        let next = next_free(mem, block);

        match prev {
            Some(prev) => set_next_free(mem, prev, next),
            None => self.heads[bucket] = next,
        }
        if let Some(next) = next {
            set_prev_free(mem, next, prev);
        }

        log::trace!("free list: removed {} from bucket {}", block, bucket);
    }

    /// Find a free block of at least `size` bytes, without removing it.
    ///
    /// Searches from `size`'s own bucket upwards and takes the first fit in
    /// the first bucket that has one.
    pub fn find(&self, mem: &[u8], size: usize) -> Option<Payload> {
        (bucket_index(size)..BUCKET_COUNT)
            .find_map(|bucket| self.iter(mem, bucket).find(|b| b.size(mem) >= size))
    }

    /// A view that can be printed, showing every non-empty bucket.
    pub fn display<'a>(&'a self, mem: &'a [u8]) -> impl fmt::Display + 'a {
        ListDisplay { list: self, mem }
    }
}

struct ListDisplay<'a> {
    list: &'a SegregatedList,
    mem: &'a [u8],
}

impl fmt::Display for ListDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegregatedList(")?;
        let mut start = true;
        for bucket in 0..BUCKET_COUNT {
            if self.list.heads[bucket].is_none() {
                continue;
            }
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "{}: [", bucket)?;
            for (i, block) in self.list.iter(self.mem, bucket).enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}:{}", block, block.size(self.mem))?;
            }
            write!(f, "]")?;
        }
        write!(f, ")")
    }
}

impl fmt::Debug for SegregatedList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegregatedList")
            .field("heads", &self.heads)
            .finish()
    }
}
