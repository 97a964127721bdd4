//! Heap consistency checking and statistics.
//!
//! [`RawAlloc::stats`] walks the whole heap from prologue to epilogue, then
//! walks every free list, and cross-checks the two.

use alloc::collections::BTreeSet;

use crate::allocators::RawAlloc;
use crate::block::{read_tag, Payload, Tag, ALIGNMENT, DSIZE, MIN_BLOCK_SIZE, WORD};
use crate::freelist::{bucket_index, prev_free, BUCKET_COUNT};
use crate::grower::HeapGrower;

/// Validity contains a count of every invalid state found in a heap.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Validity {
    /// Payloads not on an `ALIGNMENT` boundary.
    pub misaligned: usize,
    /// Blocks whose header and footer disagree.
    ///
    /// This likely indicates a caller wrote past the end of its payload.
    pub tag_mismatches: usize,
    /// Blocks or list entries that are undersized or run outside the heap.
    /// Heap walks stop at the first one.
    pub out_of_heap: usize,
    /// Missing or damaged prologue or epilogue.
    pub bad_boundaries: usize,
    /// Free blocks directly after another free block, not merged.
    pub uncoalesced: usize,
    /// Free blocks in the heap that no free list contains.
    pub unlisted: usize,
    /// Free list entries that are not free blocks in the heap, or that are
    /// listed more than once.
    pub listed_not_free: usize,
    /// Free list entries in a bucket that doesn't cover their size.
    pub wrong_bucket: usize,
    /// Free list entries smaller than the entry before them.
    pub out_of_order: usize,
    /// Free list entries whose `prev` link doesn't point at the entry before
    /// them.
    pub broken_links: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        *self == Validity::default()
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    /// Bytes granted by the heap grower.
    pub heap_size: usize,
    pub allocated_blocks: usize,
    /// Total size of allocated blocks, including headers and footers.
    pub allocated_bytes: usize,
    pub free_blocks: usize,
    /// Total size of free blocks, including headers and footers.
    pub free_bytes: usize,
    pub largest_free: usize,
    /// Number of times the heap has been grown.
    pub extensions: usize,
}

impl<G: HeapGrower> RawAlloc<G> {
    /// Get statistics on this allocator, and verify validity of the heap and
    /// free lists.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity = Validity::default();
        let mut stats = Stats {
            heap_size: self.grower.heap().len(),
            extensions: self.extensions,
            ..Stats::default()
        };

        let prologue = match self.prologue {
            None => return (validity, stats),
            Some(p) => p,
        };

        let free = self.walk_heap(prologue, &mut validity, &mut stats);
        self.walk_lists(&free, &mut validity);

        (validity, stats)
    }

    // Walk every block in address order, returning the free ones.
    fn walk_heap(
        &self,
        prologue: Payload,
        validity: &mut Validity,
        stats: &mut Stats,
    ) -> BTreeSet<Payload> {
        let mem = self.grower.heap();
        let mut free = BTreeSet::new();

        let expected = Tag::pack(DSIZE, true);
        if mem.len() < prologue.offset() + WORD
            || prologue.tag(mem) != expected
            || read_tag(mem, prologue.offset()) != expected
        {
            validity.bad_boundaries += 1;
            return free;
        }

        let mut previous_free = false;
        let mut block = prologue.next(mem);
        loop {
            if block.offset() > mem.len() {
                validity.out_of_heap += 1;
                break;
            }
            let tag = block.tag(mem);
            if tag.size() == 0 {
                // The epilogue should be the very last word of the heap
                if !tag.is_allocated() || block.offset() != mem.len() {
                    validity.bad_boundaries += 1;
                }
                break;
            }

            let size = tag.size();
            let end = block.offset().checked_add(size);
            if size < MIN_BLOCK_SIZE || end.map_or(true, |end| end > mem.len()) {
                validity.out_of_heap += 1;
                break;
            }
            if block.offset() % ALIGNMENT != 0 {
                validity.misaligned += 1;
            }
            if read_tag(mem, block.footer(mem)) != tag {
                validity.tag_mismatches += 1;
            }

            if tag.is_allocated() {
                stats.allocated_blocks += 1;
                stats.allocated_bytes += size;
                previous_free = false;
            } else {
                if previous_free {
                    validity.uncoalesced += 1;
                }
                stats.free_blocks += 1;
                stats.free_bytes += size;
                stats.largest_free = stats.largest_free.max(size);
                free.insert(block);
                previous_free = true;
            }

            block = block.next(mem);
        }

        free
    }

    // Walk every bucket, checking each entry against the free blocks found
    // in the heap walk.
    fn walk_lists(&self, free: &BTreeSet<Payload>, validity: &mut Validity) {
        let mem = self.grower.heap();
        let mut listed = BTreeSet::new();

        for bucket in 0..BUCKET_COUNT {
            let mut previous: Option<(Payload, usize)> = None;
            for block in self.blocks.iter(mem, bucket) {
                if !self.in_heap(block) {
                    validity.out_of_heap += 1;
                    break;
                }
                // Anything not found in the heap walk can't be trusted to
                // have readable tags or links, so stop here.
                if !free.contains(&block) {
                    validity.listed_not_free += 1;
                    break;
                }
                if !listed.insert(block) {
                    // Listed twice, or a cycle
                    validity.listed_not_free += 1;
                    break;
                }

                let size = block.size(mem);
                if bucket_index(size) != bucket {
                    validity.wrong_bucket += 1;
                }
                if prev_free(mem, block) != previous.map(|(p, _)| p) {
                    validity.broken_links += 1;
                }
                if let Some((_, previous_size)) = previous {
                    if size < previous_size {
                        validity.out_of_order += 1;
                    }
                }
                previous = Some((block, size));
            }
        }

        validity.unlisted += free.difference(&listed).count();
    }

    fn in_heap(&self, block: Payload) -> bool {
        let offset = block.offset();
        offset >= self.grower.heap_lo() && self.grower.heap_hi().map_or(false, |hi| offset <= hi)
    }

    /// Check the heap for consistency, logging any problems found.
    ///
    /// `line` identifies the caller in the log. This only does anything in
    /// builds with debug assertions or the `heap-check` feature; otherwise it
    /// always returns true.
    pub fn check_heap(&self, line: u32) -> bool {
        if !cfg!(any(debug_assertions, feature = "heap-check")) {
            return true;
        }

        let (validity, stats) = self.stats();
        if !validity.is_valid() {
            log::error!(
                "heap check failed (line {}): {:?}; stats: {:?}",
                line,
                validity,
                stats
            );
        }
        validity.is_valid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    use crate::block::write_tag;
    use crate::grower::ToyHeap;

    fn allocator() -> RawAlloc<ToyHeap> {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        allocator.init().unwrap();
        allocator
    }

    #[test]
    fn test_uninitialized() {
        let allocator: RawAlloc<ToyHeap> = RawAlloc::default();
        let (validity, stats) = allocator.stats();
        assert!(validity.is_valid());
        assert_eq!(stats, Stats::default());
        assert!(allocator.check_heap(line!()));
    }

    #[test]
    fn test_stats() {
        let mut allocator = allocator();
        let p = allocator.allocate(100).unwrap();
        let _q = allocator.allocate(200).unwrap();
        allocator.release(p);

        let (validity, stats) = allocator.stats();
        assert!(validity.is_valid());
        assert_eq!(stats.allocated_blocks, 1);
        assert_eq!(stats.allocated_bytes, 224);
        assert_eq!(stats.free_blocks, 2);
        assert_eq!(stats.free_bytes, 4096 - 224);
        assert_eq!(stats.largest_free, 4096 - 224 - 128);
        assert_eq!(stats.extensions, 1);
        assert_eq!(stats.heap_size, allocator.grower.size());
        assert!(allocator.check_heap(line!()));
    }

    #[test]
    fn test_detects_overrun() {
        let mut allocator = allocator();
        let p = allocator.allocate(24).unwrap();
        let _q = allocator.allocate(24).unwrap();
        let footer = p.footer(allocator.grower.heap());

        // Scribble over p's footer, as a payload overrun would
        write_tag(allocator.grower.heap_mut(), footer, Tag::from_word(0xdead_beef));
        let (validity, _) = allocator.stats();
        assert_eq!(validity.tag_mismatches, 1);
        assert!(!validity.is_valid());
        if cfg!(debug_assertions) {
            assert!(!allocator.check_heap(line!()));
        }
    }

    #[test]
    fn test_detects_unlisted_and_uncoalesced() {
        let mut allocator = allocator();
        let p = allocator.allocate(24).unwrap();
        let q = allocator.allocate(24).unwrap();
        let _fence = allocator.allocate(24).unwrap();

        // Mark both free without going through the free list
        let mem = allocator.grower.heap_mut();
        let size = p.size(mem);
        p.set(mem, size, false);
        q.set(mem, size, false);

        let (validity, _) = allocator.stats();
        assert_eq!(validity.unlisted, 2);
        assert_eq!(validity.uncoalesced, 1);
    }

    #[test]
    fn test_detects_listed_allocated_block() {
        let mut allocator = allocator();
        let p = allocator.allocate(24).unwrap();
        allocator.release(p);
        // Claim the block again behind the free list's back
        let mem = allocator.grower.heap_mut();
        let size = p.size(mem);
        p.set(mem, size, true);

        let (validity, _) = allocator.stats();
        assert_eq!(validity.listed_not_free, 1);
    }

    #[test]
    fn test_detects_link_out_of_heap() {
        let mut allocator = allocator();
        let p = allocator.allocate(24).unwrap();
        let _fence = allocator.allocate(24).unwrap();
        allocator.release(p);

        // Point p's next link far past the end of the heap
        let beyond = allocator.grower.size() as u64 + 4096;
        crate::block::write_word(allocator.grower.heap_mut(), p.offset() + WORD, beyond);
        let (validity, _) = allocator.stats();
        assert_eq!(validity.out_of_heap, 1);
    }

    #[test]
    fn test_detects_bad_epilogue() {
        let mut allocator = allocator();
        let end = allocator.grower.size();
        write_tag(allocator.grower.heap_mut(), end - WORD, Tag::from_word(0));
        let (validity, _) = allocator.stats();
        assert_eq!(validity.bad_boundaries, 1);
    }

    #[test]
    fn test_detects_header_size_past_address_space() {
        let mut allocator = allocator();
        let _p = allocator.allocate(24).unwrap();
        let q = allocator.allocate(24).unwrap();

        // A header this large wraps around when added to the block's offset
        let header = q.header();
        crate::block::write_word(allocator.grower.heap_mut(), header, 0xFFFF_FFFF_FFFF_FFF0);
        let (validity, _) = allocator.stats();
        assert_eq!(validity.out_of_heap, 1);
        assert!(!validity.is_valid());
    }
}
