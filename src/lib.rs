#![cfg_attr(not(test), no_std)]

//! A boundary-tagged memory allocator with segregated free lists.
//!
//! The allocator manages one contiguous heap that grows at the top, supplied
//! by a [`HeapGrower`](grower/trait.HeapGrower.html). Every block carries its
//! size and allocated bit in a header and a footer, so freed blocks merge
//! with free neighbors in constant time. Free blocks are kept in one list
//! per power-of-two size class, each sorted by size, and allocation takes
//! the first fit starting from the request's own size class.
//!
//! Blocks are addressed by [`Payload`](block/struct.Payload.html) offsets
//! rather than raw pointers, so the whole allocator is safe code over a byte
//! buffer.
//!
//! ```
//! use segalloc::allocators::RawAlloc;
//! use segalloc::grower::ToyHeap;
//!
//! let mut allocator = RawAlloc::new(ToyHeap::default());
//! let block = allocator.allocate(64).unwrap();
//! allocator.payload_mut(block)[..5].copy_from_slice(b"hello");
//!
//! let block = allocator.resize(block, 256).unwrap();
//! assert_eq!(&allocator.payload(block)[..5], b"hello");
//! allocator.release(block);
//!
//! assert!(allocator.stats().0.is_valid());
//! ```
//!
//! Nothing here is thread-safe: a `RawAlloc` is a single allocation stream.

extern crate alloc;

pub mod allocators;
pub mod block;
pub mod check;
pub mod freelist;
pub mod grower;

pub use allocators::{AllocError, Config, RawAlloc};
pub use block::Payload;
pub use check::{Stats, Validity};
#[cfg(feature = "use_libc")]
pub use grower::LibcHeapGrower;
pub use grower::{HeapGrower, ToyHeap};
